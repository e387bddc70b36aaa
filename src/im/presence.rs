//! Presence Registry - user×device -> gateway bindings
//!
//! Bindings live in the registry backend under a TTL lease; clients
//! renew every ttl/3 and silence makes the binding disappear. Lookups
//! go through a local read-through cache invalidated by the backend's
//! watch stream, so a stale entry is corrected within one round trip
//! of the change.
//!
//! Lookup is eventually consistent. The router treats an empty result
//! as offline; a false "online" is absorbed by its retry-then-offline
//! fallback.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::error::ImError;
use super::registry::RegistryBackend;
use super::types::PresenceBinding;
use crate::core_types::{DeviceId, UserId};

/// Registry key namespace for presence bindings
pub const PRESENCE_PREFIX: &str = "presence/";

fn binding_key(user_id: UserId, device_id: &str) -> String {
    format!("{PRESENCE_PREFIX}{user_id}/{device_id}")
}

/// Parse the user id back out of a registry key; None for foreign keys
fn user_of_key(key: &str) -> Option<UserId> {
    key.strip_prefix(PRESENCE_PREFIX)?
        .split('/')
        .next()?
        .parse()
        .ok()
}

pub struct PresenceRegistry {
    backend: Arc<dyn RegistryBackend>,
    ttl: Duration,
    cache: DashMap<UserId, Vec<PresenceBinding>>,
}

impl PresenceRegistry {
    pub fn new(backend: Arc<dyn RegistryBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            cache: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Bind a device to its gateway with a fresh lease.
    pub async fn register(
        &self,
        user_id: UserId,
        device_id: &str,
        gateway_id: &str,
    ) -> Result<(), ImError> {
        if user_id == 0 || device_id.is_empty() || gateway_id.is_empty() {
            return Err(ImError::Validation(
                "user_id, device_id and gateway_id are required".into(),
            ));
        }
        self.backend
            .put_with_lease(&binding_key(user_id, device_id), gateway_id, self.ttl)
            .await?;
        self.cache.remove(&user_id);
        debug!(user_id, device_id, gateway_id, "Presence registered");
        Ok(())
    }

    /// Extend the lease. False means the lease already lapsed and the
    /// gateway must re-register the connection.
    pub async fn renew(&self, user_id: UserId, device_id: &str) -> Result<bool, ImError> {
        self.backend
            .renew(&binding_key(user_id, device_id), self.ttl)
            .await
    }

    /// Explicit disconnect removes the binding immediately.
    pub async fn disconnect(&self, user_id: UserId, device_id: &str) -> Result<(), ImError> {
        self.backend.delete(&binding_key(user_id, device_id)).await?;
        self.cache.remove(&user_id);
        Ok(())
    }

    /// Every live (gateway, device) for a user. Empty means offline.
    pub async fn lookup(&self, user_id: UserId) -> Result<Vec<PresenceBinding>, ImError> {
        if let Some(cached) = self.cache.get(&user_id) {
            return Ok(cached.clone());
        }
        let prefix = format!("{PRESENCE_PREFIX}{user_id}/");
        let pairs = self.backend.range(&prefix).await?;
        let bindings: Vec<PresenceBinding> = pairs
            .into_iter()
            .filter_map(|(key, gateway_id)| {
                let device_id: DeviceId = key.rsplit('/').next()?.to_string();
                Some(PresenceBinding {
                    user_id,
                    device_id,
                    gateway_id,
                })
            })
            .collect();
        self.cache.insert(user_id, bindings.clone());
        Ok(bindings)
    }

    /// Consume the backend watch stream and drop cache entries for
    /// every touched user. One task per process.
    pub async fn run_watch_invalidation(&self) {
        let mut watch = self.backend.watch(PRESENCE_PREFIX);
        while let Some(event) = watch.recv().await {
            if let Some(user_id) = user_of_key(event.key()) {
                self.cache.remove(&user_id);
            }
        }
        debug!("Presence watch stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::registry::MemoryRegistry;

    fn registry() -> (PresenceRegistry, Arc<MemoryRegistry>) {
        let backend = Arc::new(MemoryRegistry::new());
        (
            PresenceRegistry::new(backend.clone(), Duration::from_secs(90)),
            backend,
        )
    }

    #[test]
    fn test_user_of_key() {
        assert_eq!(user_of_key("presence/42/ios-a"), Some(42));
        assert_eq!(user_of_key("other/42/ios-a"), None);
        assert_eq!(user_of_key("presence/nope/x"), None);
    }

    #[tokio::test]
    async fn test_register_lookup_disconnect() {
        let (presence, _) = registry();
        presence.register(7, "ios-a", "gw-1").await.unwrap();
        presence.register(7, "web-b", "gw-2").await.unwrap();

        let mut bindings = presence.lookup(7).await.unwrap();
        bindings.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].gateway_id, "gw-1");
        assert_eq!(bindings[1].gateway_id, "gw-2");

        presence.disconnect(7, "ios-a").await.unwrap();
        assert_eq!(presence.lookup(7).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_empty_means_offline() {
        let (presence, _) = registry();
        assert!(presence.lookup(99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_validates_inputs() {
        let (presence, _) = registry();
        assert!(presence.register(0, "d", "g").await.is_err());
        assert!(presence.register(1, "", "g").await.is_err());
        assert!(presence.register(1, "d", "").await.is_err());
    }
}
