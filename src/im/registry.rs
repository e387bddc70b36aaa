//! Registry backend - TTL-leased key/value with prefix watch
//!
//! The presence layer stores `presence/<user>/<device>` -> gateway
//! bindings here. Two implementations:
//!
//! - [`MemoryRegistry`] - true event-push watch, for tests and
//!   single-node runs.
//! - [`RedisRegistry`] - leases are key TTLs; the watch stream is a
//!   scan-diff task, so watchers observe changes within one scan
//!   interval. Lookup staleness is bounded by that interval.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::error::ImError;

/// One change on a registry key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl RegistryEvent {
    pub fn key(&self) -> &str {
        match self {
            RegistryEvent::Put { key, .. } | RegistryEvent::Delete { key } => key,
        }
    }
}

#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Store `key -> value` with a lease of `ttl`; overwrites and
    /// re-leases an existing key.
    async fn put_with_lease(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), ImError>;

    /// Extend the lease by `ttl` from now. False when the key is
    /// already gone (caller should re-register).
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, ImError>;

    async fn delete(&self, key: &str) -> Result<(), ImError>;

    /// All live pairs under a prefix
    async fn range(&self, prefix: &str) -> Result<Vec<(String, String)>, ImError>;

    /// Change stream filtered to a prefix. Events arrive in backend
    /// order per key.
    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<RegistryEvent>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

pub struct MemoryRegistry {
    entries: Mutex<BTreeMap<String, (String, Instant)>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Drop expired leases and emit Delete for each. Run on a timer
    /// when this backend serves a process; tests call it directly.
    pub fn sweep_expired_once(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let entries = self.entries.lock().expect("registry poisoned");
            entries
                .iter()
                .filter(|(_, (_, deadline))| *deadline <= now)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &expired {
            self.entries.lock().expect("registry poisoned").remove(key);
            self.emit(RegistryEvent::Delete { key: key.clone() });
        }
        expired.len()
    }
}

#[async_trait]
impl RegistryBackend for MemoryRegistry {
    async fn put_with_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), ImError> {
        self.entries
            .lock()
            .expect("registry poisoned")
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        self.emit(RegistryEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, ImError> {
        let mut entries = self.entries.lock().expect("registry poisoned");
        let now = Instant::now();
        match entries.get_mut(key) {
            Some((_, deadline)) if *deadline > now => {
                *deadline = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ImError> {
        let removed = self
            .entries
            .lock()
            .expect("registry poisoned")
            .remove(key)
            .is_some();
        if removed {
            self.emit(RegistryEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn range(&self, prefix: &str) -> Result<Vec<(String, String)>, ImError> {
        let now = Instant::now();
        let entries = self.entries.lock().expect("registry poisoned");
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, (_, deadline))| *deadline > now)
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = self.events.subscribe();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if event.key().starts_with(&prefix) && tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Registry watcher lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

// ============================================================================
// Redis implementation
// ============================================================================

pub struct RedisRegistry {
    conn: ConnectionManager,
    events: broadcast::Sender<RegistryEvent>,
    scan_interval: Duration,
}

impl RedisRegistry {
    pub async fn connect(url: &str, scan_interval: Duration) -> Result<Self, ImError> {
        let client = redis::Client::open(url).map_err(|e| ImError::Registry(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ImError::Registry(e.to_string()))?;
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            conn,
            events,
            scan_interval,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, ImError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{prefix}*"))
                .arg("COUNT")
                .arg(256)
                .query_async(&mut conn)
                .await
                .map_err(|e| ImError::Registry(e.to_string()))?;
            for key in keys {
                let value: Option<String> = redis::cmd("GET")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| ImError::Registry(e.to_string()))?;
                if let Some(value) = value {
                    out.push((key, value));
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }

    /// Scan-diff pump feeding the watch stream. Run one per process
    /// per watched prefix.
    pub async fn run_watch_pump(&self, prefix: &str) -> ! {
        let mut ticker = tokio::time::interval(self.scan_interval);
        let mut last: BTreeMap<String, String> = BTreeMap::new();
        loop {
            ticker.tick().await;
            let current = match self.scan_prefix(prefix).await {
                Ok(pairs) => pairs.into_iter().collect::<BTreeMap<_, _>>(),
                Err(e) => {
                    warn!(error = %e, "Registry scan failed; watch lags one interval");
                    continue;
                }
            };
            for (key, value) in &current {
                if last.get(key) != Some(value) {
                    let _ = self.events.send(RegistryEvent::Put {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
            for key in last.keys() {
                if !current.contains_key(key) {
                    let _ = self.events.send(RegistryEvent::Delete { key: key.clone() });
                }
            }
            last = current;
        }
    }
}

#[async_trait]
impl RegistryBackend for RedisRegistry {
    async fn put_with_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), ImError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .exec_async(&mut conn)
            .await
            .map_err(|e| ImError::Registry(e.to_string()))?;
        Ok(())
    }

    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, ImError> {
        let mut conn = self.conn();
        let extended: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| ImError::Registry(e.to_string()))?;
        Ok(extended == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), ImError> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(key)
            .exec_async(&mut conn)
            .await
            .map_err(|e| ImError::Registry(e.to_string()))?;
        Ok(())
    }

    async fn range(&self, prefix: &str) -> Result<Vec<(String, String)>, ImError> {
        self.scan_prefix(prefix).await
    }

    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = self.events.subscribe();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if event.key().starts_with(&prefix) && tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Registry watcher lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}
