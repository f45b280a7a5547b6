//! Out-of-band execution of admitted requests.
//!
//! Admission pushes a [`DispatchTask`] onto a bounded queue and returns. The
//! dispatcher loop drains the queue and runs up to `concurrency` executions at
//! once. When every [`Dispatcher`] handle is dropped the loop finishes the
//! queued tasks, waits for the running ones, and exits.

pub mod executor;

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::AppError;
use crate::providers::ProviderInput;
use crate::providers::rotation::RotationScope;

pub use self::executor::Executor;

/// One admitted request waiting for a provider call.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub request_id: String,
    pub project_id: String,
    pub model: String,
    pub input: ProviderInput,
    pub scope: RotationScope,
}

/// Sending half of the dispatch queue.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<DispatchTask>,
}

impl Dispatcher {
    /// Create a queue holding at most `capacity` waiting tasks.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DispatchTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a task, waiting for room when the queue is full.
    pub async fn enqueue(&self, task: DispatchTask) -> Result<(), AppError> {
        self.tx
            .send(task)
            .await
            .map_err(|_| AppError::Internal("Dispatcher is not running".to_string()))
    }
}

/// Spawn the dispatcher loop.
pub fn spawn_dispatcher(
    executor: Arc<Executor>,
    mut rx: mpsc::Receiver<DispatchTask>,
    concurrency: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                task = rx.recv() => {
                    let Some(task) = task else {
                        // Channel closed and empty.
                        break;
                    };
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let executor = executor.clone();
                    running.spawn(async move {
                        executor.run(task).await;
                        drop(permit);
                    });
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Dispatch task panicked");
                    }
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Dispatch task panicked");
            }
        }
        tracing::info!("Dispatcher shutting down");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::auth::projects::{NewProject, ProjectDefaults, ProjectRegistry};
    use crate::budget::BudgetGuard;
    use crate::cache::ResponseCache;
    use crate::config::{BudgetConfig, CacheConfig, CounterPolicy, RotationStrategy};
    use crate::db::Database;
    use crate::ledger::{Ledger, RequestStatus};
    use crate::providers::cost::CostCalculator;
    use crate::providers::retry::RetryPolicy;
    use crate::providers::rotation::{Credential, CredentialKind, KeyRotation, NewKey};
    use crate::providers::router::ProviderRouter;
    use crate::providers::{
        AdapterSet, Completion, Provider, ProviderAdapter, ProviderError, Usage,
    };
    use crate::store::{Counters, MemoryKvStore};

    /// Sleeps briefly and tracks peak concurrency.
    struct SlowAdapter {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ProviderAdapter for SlowAdapter {
        fn provider(&self) -> Provider {
            Provider::Gemini
        }

        fn invoke<'a>(
            &'a self,
            _credential: &'a Credential,
            _model: &'a str,
            input: &'a ProviderInput,
        ) -> BoxFuture<'a, Result<Completion, ProviderError>> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Completion {
                    content: format!("echo: {}", input.prompt_text()),
                    usage: Usage::default(),
                    estimated: true,
                })
            })
        }
    }

    #[tokio::test]
    async fn test_drains_queue_on_close_with_bounded_concurrency() {
        let db = Database::open_in_memory().unwrap();
        let kv = Arc::new(MemoryKvStore::new());
        let rotation = Arc::new(KeyRotation::new(
            db.clone(),
            Counters::new(kv.clone(), CounterPolicy::Atomic),
            RotationStrategy::RoundRobin,
        ));
        rotation
            .add_key(&NewKey {
                provider: "gemini".into(),
                credential: "k".into(),
                kind: CredentialKind::Bearer,
                models: vec!["*".into()],
            })
            .unwrap();
        let project = ProjectRegistry::new(db.clone(), ProjectDefaults::default())
            .create_with_token(
                &NewProject {
                    name: "queue".into(),
                    ..Default::default()
                },
                "tok",
            )
            .unwrap();

        let adapter = Arc::new(SlowAdapter {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut adapters = AdapterSet::new();
        adapters.register(adapter.clone());

        let ledger = Ledger::new(db.clone());
        let executor = Arc::new(Executor {
            router: ProviderRouter::default(),
            rotation,
            adapters,
            costs: CostCalculator::default(),
            ledger: ledger.clone(),
            cache: Arc::new(ResponseCache::new(kv, &CacheConfig::default())),
            budget: Arc::new(BudgetGuard::new(db, &BudgetConfig::default())),
            retry: RetryPolicy::none(),
            log_content: false,
        });

        let (dispatcher, rx) = Dispatcher::channel(16);
        let handle = spawn_dispatcher(executor, rx, 2);

        for i in 0..6 {
            let id = format!("req_{i}");
            ledger.create_pending(&id, &project.id, "gemini-pro", "{}").unwrap();
            dispatcher
                .enqueue(DispatchTask {
                    request_id: id,
                    project_id: project.id.clone(),
                    model: "gemini-pro".into(),
                    input: ProviderInput::Text {
                        prompt: format!("n{i}"),
                    },
                    scope: RotationScope::Global,
                })
                .await
                .unwrap();
        }
        drop(dispatcher);
        handle.await.unwrap();

        for i in 0..6 {
            let rec = ledger.get(&format!("req_{i}")).unwrap().unwrap();
            assert_eq!(rec.status, RequestStatus::Success);
            assert_eq!(rec.content(), Some(format!("echo: n{i}")));
        }
        assert!(adapter.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let (dispatcher, rx) = Dispatcher::channel(1);
        drop(rx);
        let err = dispatcher
            .enqueue(DispatchTask {
                request_id: "req_x".into(),
                project_id: "proj_x".into(),
                model: "m".into(),
                input: ProviderInput::Text { prompt: "p".into() },
                scope: RotationScope::Global,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
