use crate::Model;
use futures::{future::BoxFuture, FutureExt};
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, info};

type CreateModelFn<T> = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Owns at most one loaded model and knows how to create it again after an offload.
pub(crate) struct ModelLoader<T>
where
    T: Model,
{
    pub model: Mutex<Option<T>>,
    create_model_fn: CreateModelFn<T>,
}

impl<T> ModelLoader<T>
where
    T: Model,
{
    pub fn new<F, Fut>(create_model: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            model: Mutex::new(None),
            create_model_fn: Box::new(move || create_model().boxed()),
        }
    }

    pub async fn load(&self) -> anyhow::Result<()> {
        let mut current_model = self.model.lock().await;

        if current_model.is_none() {
            debug!("loading model");
            let start = std::time::Instant::now();
            let model = (self.create_model_fn)().await?;
            info!("model loaded in {:?}", start.elapsed());
            *current_model = Some(model);
        }

        Ok(())
    }

    pub async fn offload(&self) -> anyhow::Result<()> {
        let mut current_model = self.model.lock().await;
        if current_model.take().is_some() {
            debug!("model offloaded");
        }

        Ok(())
    }

    pub async fn is_loaded(&self) -> bool {
        self.model.lock().await.is_some()
    }
}
