//! Cluster singletons: long-running tasks pinned to the pod owning the
//! sentinel shard.

use crate::error::ShardingError;
use crate::metrics::ShardingMetrics;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Factory producing the singleton's task. Reusable: called again each time
/// the singleton needs to restart after the sentinel shard moves back here.
pub type SingletonRun =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), ShardingError>> + Send + Sync>;

struct RunningSingleton {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SingletonEntry {
    name: String,
    run: SingletonRun,
    /// Present iff the singleton is currently running on this pod.
    running: Option<RunningSingleton>,
}

/// Registered singletons plus their run state.
///
/// Reconciliation is serialized by the entry-list mutex so concurrent
/// assignment events cannot double-start a singleton.
pub(crate) struct SingletonRegistry {
    entries: Mutex<Vec<SingletonEntry>>,
    metrics: Arc<ShardingMetrics>,
}

impl SingletonRegistry {
    pub fn new(metrics: Arc<ShardingMetrics>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Record a singleton. It starts on the next reconcile if this pod owns
    /// the sentinel shard.
    pub async fn register(&self, name: impl Into<String>, run: SingletonRun) {
        let name = name.into();
        self.metrics
            .singletons
            .with_label_values(&[name.as_str()])
            .set(0);
        self.entries.lock().await.push(SingletonEntry {
            name,
            run,
            running: None,
        });
    }

    /// Bring every registered singleton in line with sentinel-shard
    /// ownership: all running when `should_run`, none otherwise.
    pub async fn reconcile(&self, should_run: bool) {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            match (should_run, entry.running.is_some()) {
                (true, false) => {
                    tracing::info!(singleton = %entry.name, "starting singleton");
                    let cancel = CancellationToken::new();
                    let fut = (entry.run)();
                    let token = cancel.clone();
                    let name = entry.name.clone();
                    let handle = tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            result = fut => {
                                if let Err(error) = result {
                                    tracing::error!(singleton = %name, %error, "singleton task failed");
                                }
                            }
                        }
                    });
                    self.metrics
                        .singletons
                        .with_label_values(&[entry.name.as_str()])
                        .set(1);
                    entry.running = Some(RunningSingleton { cancel, handle });
                }
                (false, true) => {
                    tracing::info!(singleton = %entry.name, "stopping singleton");
                    if let Some(running) = entry.running.take() {
                        running.cancel.cancel();
                        running.handle.abort();
                    }
                    self.metrics
                        .singletons
                        .with_label_values(&[entry.name.as_str()])
                        .set(0);
                }
                _ => {}
            }
        }
    }

    pub async fn stop_all(&self) {
        self.reconcile(false).await;
    }

    pub async fn running_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| entry.running.is_some())
            .count()
    }

    pub async fn registered_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}
