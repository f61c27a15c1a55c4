use dotenvy::dotenv;
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

fn init_env_layer() -> EnvFilter {
    match dotenv() {
        Ok(path) => eprintln!(".env read successfully from {}", path.display()),
        Err(e) => eprintln!("Could not load .env file: {e}"),
    };

    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

fn report(result: Result<(), tracing_subscriber::util::TryInitError>) {
    if let Err(e) = result {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }
}

/// Logs to stderr, which keeps stdout free for data.
pub fn init_tracing_to_stderr() {
    let env_layer = init_env_layer();
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true);

    report(
        tracing_subscriber::registry()
            .with(env_layer)
            .with(stderr_layer)
            .try_init(),
    );
}

/// Opens `<log_dir>/app.log` for writing, creating the directory if needed.
fn file_writer(log_dir: &Path) -> Option<Mutex<File>> {
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log dir: {}", e);
        return None;
    }
    match File::create(log_dir.join("app.log")) {
        Ok(file) => Some(Mutex::new(file)),
        Err(e) => {
            eprintln!("Failed to create log file: {}", e);
            None
        }
    }
}

/// Logs to `<log_dir>/app.log`, falling back to stderr when the file can't be created.
pub fn init_tracing_to_file(log_dir: PathBuf) {
    let Some(writer) = file_writer(&log_dir) else {
        init_tracing_to_stderr();
        return;
    };

    let env_layer = init_env_layer();
    let file_log_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);

    report(
        tracing_subscriber::registry()
            .with(env_layer)
            .with(file_log_layer)
            .try_init(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logging_creates_app_log() {
        let dir = std::env::temp_dir().join(format!("analytics-tracing-{}", std::process::id()));
        init_tracing_to_file(dir.clone());

        tracing::info!("written to file");
        let content = std::fs::read_to_string(dir.join("app.log")).unwrap();
        assert!(content.contains("written to file"));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn unusable_log_dir_yields_no_writer() {
        let base = std::env::temp_dir().join(format!("analytics-tracing-writer-{}", std::process::id()));
        std::fs::create_dir_all(&base).unwrap();

        let not_a_dir = base.join("occupied");
        std::fs::write(&not_a_dir, b"").unwrap();
        assert!(file_writer(&not_a_dir).is_none());

        let logs = base.join("logs");
        assert!(file_writer(&logs).is_some());
        assert!(logs.join("app.log").is_file());

        std::fs::remove_dir_all(base).unwrap();
    }
}
