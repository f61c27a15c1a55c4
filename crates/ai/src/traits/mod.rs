mod vision_language;

use crate::{loader, HandlerPayload};
use futures::Future;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
pub use vision_language::*;

pub trait Model {
    type Item;
    type Output;

    fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<anyhow::Result<Self::Output>>>> + Send;

    fn batch_size_limit(&self) -> usize;
}

pub type BatchHandlerTx<Item, Output> = mpsc::Sender<HandlerPayload<Item, Output>>;

/// Handle to a model that lives on its own thread.
///
/// The model is created on the first request and dropped again after
/// `offload_duration` without requests. Requests are handled one batch at a
/// time, so the underlying accelerator context is never used concurrently.
#[derive(Debug)]
pub struct AIModel<TItem, TOutput> {
    model_id: String, // for better logging
    tx: BatchHandlerTx<TItem, TOutput>,
}

impl<TItem, TOutput> Clone for AIModel<TItem, TOutput> {
    fn clone(&self) -> Self {
        Self {
            model_id: self.model_id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<TItem, TOutput> AIModel<TItem, TOutput>
where
    TItem: Send + Sync + Clone + Debug + 'static,
    TOutput: Send + Sync + Debug + 'static,
{
    /// `offload_duration` of `None` keeps the model loaded until every handle is dropped.
    pub fn new<T, TFut, TFn>(
        model_id: impl Into<String>,
        create_model: TFn,
        offload_duration: Option<Duration>,
    ) -> anyhow::Result<Self>
    where
        T: Model<Item = TItem, Output = TOutput> + Send + 'static,
        TFut: Future<Output = anyhow::Result<T>> + Send + 'static,
        TFn: Fn() -> TFut + Send + 'static,
    {
        let model_id = model_id.into();
        let loader = loader::ModelLoader::new(create_model);
        let (tx, mut rx) = mpsc::channel::<HandlerPayload<TItem, TOutput>>(512);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        std::thread::Builder::new()
            .name(format!("ai-model-{}", model_id))
            .spawn(move || {
                let local = tokio::task::LocalSet::new();

                local.spawn_local(async move {
                    loop {
                        let idle = async {
                            match offload_duration {
                                Some(duration) => tokio::time::sleep(duration).await,
                                None => std::future::pending::<()>().await,
                            }
                        };

                        tokio::select! {
                            _ = idle => {
                                if loader.is_loaded().await {
                                    tracing::debug!("No message received for {:?}, offload model", offload_duration);
                                    if let Err(e) = loader.offload().await {
                                        tracing::error!("failed to offload model: {}", e);
                                    }
                                }
                            }
                            payload = rx.recv() => {
                                match payload {
                                    Some((items, result_tx)) => {
                                        // If channel closed,
                                        // we have no way to response, just ignore task.
                                        // This is very useful for task cancellation.
                                        if result_tx.is_closed() {
                                            continue;
                                        }

                                        if let Err(e) = loader.load().await {
                                            tracing::error!("failed to load model: {:#}", e);
                                            if result_tx.send(Err(e)).is_err() {
                                                tracing::error!("failed to send results");
                                            }
                                            continue;
                                        }

                                        let mut model = loader.model.lock().await;
                                        let results = match model.as_mut() {
                                            Some(model) => model.process(items).await,
                                            None => Err(anyhow::anyhow!("failed to load model")),
                                        };

                                        if result_tx.send(results).is_err() {
                                            tracing::error!("failed to send results");
                                        }
                                    }
                                    _ => {
                                        // this means all tx has been dropped
                                        if loader.is_loaded().await {
                                            tracing::warn!("all tx dropped, offload model and end loop");
                                            if let Err(e) = loader.offload().await {
                                                tracing::error!("failed to offload model: {}", e);
                                            }
                                        }
                                        break;
                                    }
                                }
                            }
                        }
                    }
                });

                rt.block_on(local);
            })?;

        Ok(Self { model_id, tx })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[tracing::instrument(name = "AIModel::process", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process(&self, items: Vec<TItem>) -> anyhow::Result<Vec<anyhow::Result<TOutput>>> {
        let (result_tx, rx) = oneshot::channel();
        let count = items.len();
        match self.tx.send((items, result_tx)).await {
            Ok(_) => {
                tracing::info!("{} items sent to model", count);
            }
            Err(e) => {
                anyhow::bail!("failed to send items: {:?}", e);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(e) => {
                anyhow::bail!("failed to receive results: {:?}", e);
            }
        }
    }

    #[tracing::instrument(name = "AIModel::process_single", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process_single(&self, item: TItem) -> anyhow::Result<TOutput> {
        let results = self.process(vec![item]).await?;
        let result = results
            .into_iter()
            .next()
            .ok_or(anyhow::anyhow!("no result"))??;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Debug)]
    struct Doubler;

    impl Model for Doubler {
        type Item = u32;
        type Output = u32;

        async fn process(
            &mut self,
            items: Vec<Self::Item>,
        ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
            if items.len() > self.batch_size_limit() {
                anyhow::bail!("too many items");
            }
            Ok(items
                .into_iter()
                .map(|v| {
                    if v == 0 {
                        Err(anyhow::anyhow!("zero"))
                    } else {
                        Ok(v * 2)
                    }
                })
                .collect())
        }

        fn batch_size_limit(&self) -> usize {
            4
        }
    }

    #[test_log::test(tokio::test)]
    async fn process_keeps_order() {
        let model = AIModel::new("doubler", || async { Ok(Doubler) }, None).unwrap();

        let results = model.process(vec![3, 1, 2]).await.unwrap();
        let values: Vec<u32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![6, 2, 4]);

        assert_eq!(model.process_single(5).await.unwrap(), 10);
        assert!(model.process_single(0).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn batch_errors_are_returned_to_caller() {
        let model = AIModel::new("doubler", || async { Ok(Doubler) }, None).unwrap();
        let err = model.process(vec![1, 2, 3, 4, 5]).await.unwrap_err();
        assert!(err.to_string().contains("too many items"));
    }

    #[test_log::test(tokio::test)]
    async fn load_failure_is_reported() {
        let model: AIModel<u32, u32> = AIModel::new(
            "broken",
            || async { Err::<Doubler, _>(anyhow::anyhow!("missing checkpoint")) },
            None,
        )
        .unwrap();

        let err = model.process(vec![1]).await.unwrap_err();
        assert!(err.to_string().contains("missing checkpoint"));
    }

    #[test_log::test(tokio::test)]
    async fn idle_model_is_offloaded_and_reloaded() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let model = AIModel::new(
            "doubler",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Doubler)
                }
            },
            Some(Duration::from_millis(50)),
        )
        .unwrap();

        model.process_single(1).await.unwrap();
        model.process_single(2).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        model.process_single(3).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
