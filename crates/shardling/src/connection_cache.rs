use crate::error::ShardingError;
use crate::types::PodAddress;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Factory producing a connection to a peer pod.
pub type Connector<C> =
    Arc<dyn Fn(PodAddress) -> BoxFuture<'static, Result<C, ShardingError>> + Send + Sync>;

/// Pool of transport connections keyed by pod address.
///
/// `get` returns the cached connection or creates one; a per-address lock
/// serializes creation so concurrent callers targeting the same new pod open
/// a single connection. Transport implementations call `invalidate` when a
/// connection goes bad.
pub struct ConnectionCache<C: Clone + Send + Sync + 'static> {
    connections: DashMap<PodAddress, C>,
    connect_locks: DashMap<PodAddress, Arc<Mutex<()>>>,
    connector: Connector<C>,
}

impl<C: Clone + Send + Sync + 'static> ConnectionCache<C> {
    pub fn new(connector: Connector<C>) -> Self {
        Self {
            connections: DashMap::new(),
            connect_locks: DashMap::new(),
            connector,
        }
    }

    /// Get or create the connection for the given pod.
    pub async fn get(&self, pod: &PodAddress) -> Result<C, ShardingError> {
        // Fast path: existing connection
        if let Some(connection) = self.connections.get(pod) {
            return Ok(connection.clone());
        }

        let lock = self
            .connect_locks
            .entry(pod.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock; another caller may have connected
        if let Some(connection) = self.connections.get(pod) {
            return Ok(connection.clone());
        }

        let connection = (self.connector)(pod.clone()).await?;
        self.connections.insert(pod.clone(), connection.clone());
        Ok(connection)
    }

    /// Drop the cached connection for the given pod.
    pub fn invalidate(&self, pod: &PodAddress) {
        self.connections.remove(pod);
        self.connect_locks.remove(pod);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_connector(counter: Arc<AtomicUsize>) -> Connector<String> {
        Arc::new(move |pod| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(pod.to_string())
            })
        })
    }

    #[tokio::test]
    async fn caches_connections_per_pod() {
        let opened = Arc::new(AtomicUsize::new(0));
        let cache = ConnectionCache::new(counting_connector(Arc::clone(&opened)));
        let pod = PodAddress::new("10.0.0.1", 54321);

        let a = cache.get(&pod).await.unwrap();
        let b = cache.get(&pod).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_gets_open_one_connection() {
        let opened = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ConnectionCache::new(counting_connector(Arc::clone(&opened))));
        let pod = PodAddress::new("10.0.0.2", 54321);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let pod = pod.clone();
                tokio::spawn(async move { cache.get(&pod).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_reconnect() {
        let opened = Arc::new(AtomicUsize::new(0));
        let cache = ConnectionCache::new(counting_connector(Arc::clone(&opened)));
        let pod = PodAddress::new("10.0.0.3", 54321);

        cache.get(&pod).await.unwrap();
        cache.invalidate(&pod);
        assert!(cache.is_empty());
        cache.get(&pod).await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }
}
