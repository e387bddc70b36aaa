//! Router - single entry point for message delivery
//!
//! Pipeline per request: validate, filter, sequence, dedup, then
//! either the fast path (direct gateway push per device, bounded
//! retries with exponential backoff) or the offline path (durable
//! bus partitioned by recipient). Sequencing happens before any
//! branching, so ordering per conversation is fixed no matter which
//! path delivers.
//!
//! Dedup levels:
//! - route level (`dedup:<msg>:<recipient>:route`): a repeated route
//!   call returns the cached outcome, no side effects.
//! - device level (`dedup:<msg>:<recipient>:<device>`): a push that
//!   already completed is never repeated for that device.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::ImError;
use super::filter::{FilterOutcome, WordFilter};
use super::gateway::GatewayClient;
use super::presence::PresenceRegistry;
use super::sequencer::Sequencer;
use super::types::{
    ConvScope, DeliveryPush, DeliveryStatus, GroupMessage, GroupMessageEvent,
    OfflineMessageEvent, PayloadKind, PrivateMessage, RouteResult, private_conv_id,
};
use crate::bus::{BusProducer, topics};
use crate::config::RouterConfig;
use crate::core_types::{MsgId, SeqNum, UserId};
use crate::store::{FastStore, keys};

/// Device slot sentinel for the whole-route dedup mark
const ROUTE_SLOT: &str = "route";

/// Cached route outcome stored in the dedup entry
#[derive(Debug, Serialize, Deserialize)]
struct CachedRoute {
    status: DeliveryStatus,
    seq: SeqNum,
}

pub struct MessageRouter {
    sequencer: Arc<Sequencer>,
    filter: Arc<WordFilter>,
    presence: Arc<PresenceRegistry>,
    gateway: Arc<dyn GatewayClient>,
    producer: Arc<dyn BusProducer>,
    store: Arc<dyn FastStore>,
    config: RouterConfig,
    dedup_ttl_secs: u64,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sequencer: Arc<Sequencer>,
        filter: Arc<WordFilter>,
        presence: Arc<PresenceRegistry>,
        gateway: Arc<dyn GatewayClient>,
        producer: Arc<dyn BusProducer>,
        store: Arc<dyn FastStore>,
        config: RouterConfig,
        dedup_ttl_secs: u64,
    ) -> Self {
        Self {
            sequencer,
            filter,
            presence,
            gateway,
            producer,
            store,
            config,
            dedup_ttl_secs,
        }
    }

    /// Route one private message to every live device of the
    /// recipient, or onto the offline bus.
    pub async fn route_private(&self, msg: PrivateMessage) -> Result<RouteResult, ImError> {
        self.validate(&msg.msg_id, msg.sender, msg.recipient, &msg.content)?;

        let content = match self.filter.apply(&msg.content) {
            FilterOutcome::Blocked { word } => {
                info!(msg_id = %msg.msg_id, word, "Message blocked by content filter");
                return Err(ImError::SensitiveContent);
            }
            FilterOutcome::Replaced { content } => content,
            FilterOutcome::Clean => msg.content.clone(),
        };

        let conv_id = private_conv_id(msg.sender, msg.recipient)?;
        let seq = self.sequencer.next(ConvScope::Private, &conv_id).await?;

        // Already processed: answer from the cache, no new effects.
        if let Some(cached) = self.cached_route(&msg.msg_id, msg.recipient).await {
            debug!(msg_id = %msg.msg_id, "Duplicate route call, returning cached status");
            return Ok(cached);
        }

        let push = DeliveryPush {
            msg_id: msg.msg_id.clone(),
            conv_id: conv_id.clone(),
            conv_type: ConvScope::Private,
            sender: msg.sender,
            recipient: msg.recipient,
            content: content.clone(),
            seq,
            ts: msg.ts,
        };

        let bindings = self.presence.lookup(msg.recipient).await?;
        let status = if bindings.is_empty() {
            self.publish_offline(&msg, &conv_id, &content, seq).await?;
            DeliveryStatus::Offline
        } else {
            let results = futures::future::join_all(bindings.iter().map(|binding| {
                self.deliver_with_retry(&binding.gateway_id, &binding.device_id, &push)
            }))
            .await;
            let delivered = results.iter().filter(|ok| **ok).count();
            if delivered == 0 {
                // Every device exhausted its retries
                self.publish_offline(&msg, &conv_id, &content, seq).await?;
                DeliveryStatus::Offline
            } else {
                if delivered < results.len() {
                    // Partially delivered; the missed devices pick it
                    // up from the offline queue on next sync
                    self.publish_offline(&msg, &conv_id, &content, seq).await?;
                }
                DeliveryStatus::Delivered
            }
        };

        self.mark_route(&msg.msg_id, msg.recipient, status, seq).await;
        Ok(RouteResult {
            sequence: seq,
            status,
        })
    }

    /// Route one group message onto the group bus; member fan-out is
    /// a separate service consuming `group_msg`.
    pub async fn route_group(&self, msg: GroupMessage) -> Result<RouteResult, ImError> {
        if msg.group_id == 0 {
            return Err(ImError::Validation("group_id is required".into()));
        }
        self.validate(&msg.msg_id, msg.sender, msg.sender, &msg.content)?;

        let content = match self.filter.apply(&msg.content) {
            FilterOutcome::Blocked { word } => {
                info!(msg_id = %msg.msg_id, word, "Group message blocked by content filter");
                return Err(ImError::SensitiveContent);
            }
            FilterOutcome::Replaced { content } => content,
            FilterOutcome::Clean => msg.content.clone(),
        };

        let conv_id = msg.group_id.to_string();
        let seq = self.sequencer.next(ConvScope::Group, &conv_id).await?;

        if let Some(cached) = self.cached_route(&msg.msg_id, msg.group_id).await {
            return Ok(cached);
        }

        let event = GroupMessageEvent {
            msg_id: msg.msg_id.clone(),
            group_id: msg.group_id,
            sender: msg.sender,
            content,
            seq,
            ts: msg.ts,
        };
        let payload = serde_json::to_vec(&event).map_err(|e| ImError::System(e.to_string()))?;
        self.producer
            .publish(topics::GROUP_MSG, &msg.group_id.to_string(), &payload)
            .await?;

        self.mark_route(&msg.msg_id, msg.group_id, DeliveryStatus::Pending, seq)
            .await;
        Ok(RouteResult {
            sequence: seq,
            status: DeliveryStatus::Pending,
        })
    }

    /// Cached delivery status of a routed message.
    pub async fn get_status(
        &self,
        msg_id: &str,
        recipient: UserId,
    ) -> Result<Option<RouteResult>, ImError> {
        Ok(self.cached_route(msg_id, recipient).await)
    }

    fn validate(
        &self,
        msg_id: &MsgId,
        sender: UserId,
        recipient: UserId,
        content: &str,
    ) -> Result<(), ImError> {
        if msg_id.is_empty() {
            return Err(ImError::Validation("msg_id is required".into()));
        }
        if sender == 0 || recipient == 0 {
            return Err(ImError::Validation("sender and recipient are required".into()));
        }
        if content.is_empty() {
            return Err(ImError::Validation("content must not be empty".into()));
        }
        if content.len() > self.config.max_content_len {
            return Err(ImError::Validation(format!(
                "content exceeds {} bytes",
                self.config.max_content_len
            )));
        }
        Ok(())
    }

    /// One device: skip if already delivered, otherwise push with
    /// exponential backoff until the attempt budget runs out. True
    /// when the device got the message (now or earlier).
    async fn deliver_with_retry(
        &self,
        gateway_id: &str,
        device_id: &str,
        push: &DeliveryPush,
    ) -> bool {
        let dedup_key = keys::dedup(&push.msg_id, push.recipient, device_id);
        match self.store.dedup_get(&dedup_key).await {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            // Can't tell; deliver anyway. At-least-once is the
            // contract, the client dedups by msg_id.
            Err(e) => warn!(device_id, error = %e, "Device dedup check failed"),
        }

        let attempts = self.config.max_retries + 1;
        for attempt in 0..attempts {
            match self.gateway.push(gateway_id, device_id, push).await {
                Ok(()) => {
                    if let Err(e) = self
                        .store
                        .dedup_mark(&dedup_key, "1", self.dedup_ttl_secs)
                        .await
                    {
                        warn!(device_id, error = %e, "Device dedup mark failed");
                    }
                    return true;
                }
                Err(e) => {
                    debug!(
                        gateway_id,
                        device_id,
                        attempt,
                        error = %e,
                        "Gateway push attempt failed"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }
        warn!(gateway_id, device_id, msg_id = %push.msg_id, "Push retries exhausted");
        false
    }

    /// base * 2^attempt with a touch of jitter to decorrelate
    /// retrying routers
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_ms << attempt.min(16);
        let jitter = rand::thread_rng().gen_range(0..=base / 10 + 1);
        Duration::from_millis(base + jitter)
    }

    async fn publish_offline(
        &self,
        msg: &PrivateMessage,
        conv_id: &str,
        content: &str,
        seq: SeqNum,
    ) -> Result<(), ImError> {
        let event = OfflineMessageEvent {
            msg_id: msg.msg_id.clone(),
            recipient: msg.recipient,
            sender: msg.sender,
            conv_id: conv_id.to_string(),
            conv_type: ConvScope::Private,
            kind: PayloadKind::Chat,
            content: content.to_string(),
            seq,
            ts: msg.ts,
        };
        let payload = serde_json::to_vec(&event).map_err(|e| ImError::System(e.to_string()))?;
        self.producer
            .publish(topics::OFFLINE_MSG, &event.partition_key(), &payload)
            .await?;
        Ok(())
    }

    async fn cached_route(&self, msg_id: &str, recipient: UserId) -> Option<RouteResult> {
        let key = keys::dedup(msg_id, recipient, ROUTE_SLOT);
        let value = self.store.dedup_get(&key).await.ok().flatten()?;
        let cached: CachedRoute = serde_json::from_str(&value).ok()?;
        Some(RouteResult {
            sequence: cached.seq,
            status: cached.status,
        })
    }

    async fn mark_route(
        &self,
        msg_id: &str,
        recipient: UserId,
        status: DeliveryStatus,
        seq: SeqNum,
    ) {
        let key = keys::dedup(msg_id, recipient, ROUTE_SLOT);
        let value = match serde_json::to_string(&CachedRoute { status, seq }) {
            Ok(v) => v,
            Err(_) => return,
        };
        if let Err(e) = self.store.dedup_mark(&key, &value, self.dedup_ttl_secs).await {
            warn!(msg_id, error = %e, "Route dedup mark failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::bus::{BusConsumer, MemoryBus};
    use crate::im::registry::MemoryRegistry;
    use crate::im::repository::memory::MemorySnapshotRepository;
    use crate::store::MemoryStore;

    /// Scripted gateway: pushes to listed devices fail every time
    struct MockGateway {
        failing: HashSet<String>,
        calls: Mutex<Vec<(String, String, MsgId)>>,
    }

    impl MockGateway {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_for(&self, device: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, d, _)| d == device)
                .count()
        }
    }

    #[async_trait]
    impl GatewayClient for MockGateway {
        async fn push(
            &self,
            gateway_id: &str,
            device_id: &str,
            push: &DeliveryPush,
        ) -> Result<(), ImError> {
            self.calls.lock().unwrap().push((
                gateway_id.to_string(),
                device_id.to_string(),
                push.msg_id.clone(),
            ));
            if self.failing.contains(device_id) {
                Err(ImError::GatewayPush("scripted failure".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        router: MessageRouter,
        presence: Arc<PresenceRegistry>,
        gateway: Arc<MockGateway>,
        bus: Arc<MemoryBus>,
    }

    fn harness(failing: &[&str]) -> Harness {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let presence = Arc::new(PresenceRegistry::new(
            Arc::new(MemoryRegistry::new()),
            Duration::from_secs(90),
        ));
        let sequencer = Arc::new(Sequencer::new(
            store.clone(),
            Arc::new(MemorySnapshotRepository::default()),
            10_000,
        ));
        let gateway = Arc::new(MockGateway::new(failing));
        let router = MessageRouter::new(
            sequencer,
            Arc::new(WordFilter::disabled()),
            presence.clone(),
            gateway.clone(),
            bus.clone(),
            store,
            RouterConfig {
                max_retries: 2,
                retry_base_ms: 1,
                ..RouterConfig::default()
            },
            3600,
        );
        Harness {
            router,
            presence,
            gateway,
            bus,
        }
    }

    fn private(msg_id: &str, sender: UserId, recipient: UserId) -> PrivateMessage {
        PrivateMessage {
            msg_id: msg_id.to_string(),
            sender,
            recipient,
            content: "hello".to_string(),
            ts: Utc::now(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_fast_path_all_devices_once() {
        let h = harness(&[]);
        h.presence.register(2, "ios", "gw-a").await.unwrap();
        h.presence.register(2, "web", "gw-b").await.unwrap();

        let result = h.router.route_private(private("m1", 1, 2)).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Delivered);
        assert_eq!(result.sequence, 1);
        assert_eq!(h.gateway.calls_for("ios"), 1);
        assert_eq!(h.gateway.calls_for("web"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_route_is_side_effect_free() {
        let h = harness(&[]);
        h.presence.register(2, "ios", "gw-a").await.unwrap();

        let first = h.router.route_private(private("m1", 1, 2)).await.unwrap();
        let second = h.router.route_private(private("m1", 1, 2)).await.unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.sequence, second.sequence);
        // One push total despite two route calls
        assert_eq!(h.gateway.calls_for("ios"), 1);
    }

    #[tokio::test]
    async fn test_offline_when_no_presence() {
        let h = harness(&[]);
        let consumer = h.bus.consumer(topics::OFFLINE_MSG);

        let result = h.router.route_private(private("m1", 1, 2)).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Offline);

        let records = consumer.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(records.len(), 1);
        let event: OfflineMessageEvent = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(event.recipient, 2);
        assert_eq!(event.seq, result.sequence);
    }

    #[tokio::test]
    async fn test_retries_exhausted_falls_back_offline() {
        let h = harness(&["ios"]);
        h.presence.register(2, "ios", "gw-a").await.unwrap();
        let consumer = h.bus.consumer(topics::OFFLINE_MSG);

        let result = h.router.route_private(private("m1", 1, 2)).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Offline);
        // Initial attempt + 2 retries
        assert_eq!(h.gateway.calls_for("ios"), 3);
        assert_eq!(consumer.poll_batch(10, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_delivers_and_queues() {
        let h = harness(&["web"]);
        h.presence.register(2, "ios", "gw-a").await.unwrap();
        h.presence.register(2, "web", "gw-b").await.unwrap();
        let consumer = h.bus.consumer(topics::OFFLINE_MSG);

        let result = h.router.route_private(private("m1", 1, 2)).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Delivered);
        // The failed device's copy waits on the offline queue
        assert_eq!(consumer.poll_batch(10, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sequence_order_across_paths() {
        let h = harness(&[]);
        // First message offline, then the user connects
        let r1 = h.router.route_private(private("m1", 1, 2)).await.unwrap();
        h.presence.register(2, "ios", "gw-a").await.unwrap();
        let r2 = h.router.route_private(private("m2", 1, 2)).await.unwrap();

        assert_eq!(r1.status, DeliveryStatus::Offline);
        assert_eq!(r2.status, DeliveryStatus::Delivered);
        assert!(r2.sequence > r1.sequence);
    }

    #[tokio::test]
    async fn test_group_routes_to_bus() {
        let h = harness(&[]);
        let consumer = h.bus.consumer(topics::GROUP_MSG);

        let result = h
            .router
            .route_group(GroupMessage {
                msg_id: "g1".into(),
                sender: 1,
                group_id: 77,
                content: "hi all".into(),
                ts: Utc::now(),
                metadata: None,
            })
            .await
            .unwrap();
        assert_eq!(result.status, DeliveryStatus::Pending);

        let records = consumer.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(records.len(), 1);
        let event: GroupMessageEvent = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(event.group_id, 77);
    }

    #[tokio::test]
    async fn test_validation_rejects() {
        let h = harness(&[]);
        assert!(h.router.route_private(private("", 1, 2)).await.is_err());
        assert!(h.router.route_private(private("m", 0, 2)).await.is_err());

        let mut too_long = private("m", 1, 2);
        too_long.content = "x".repeat(5000);
        assert!(h.router.route_private(too_long).await.is_err());
    }

    #[tokio::test]
    async fn test_get_status_reads_cache() {
        let h = harness(&[]);
        let result = h.router.route_private(private("m1", 1, 2)).await.unwrap();

        let status = h.router.get_status("m1", 2).await.unwrap().unwrap();
        assert_eq!(status.sequence, result.sequence);
        assert_eq!(status.status, DeliveryStatus::Offline);
        assert!(h.router.get_status("unknown", 2).await.unwrap().is_none());
    }
}
