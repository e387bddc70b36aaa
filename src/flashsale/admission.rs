//! Admission Gate - per-SKU token-bucket front door
//!
//! Lazy bucket over the fast store: the first acquire materializes it
//! at full capacity, each acquire refills by elapsed time and takes
//! one token. Negative token count is queue depth, clamped at
//! -capacity, and maps to a retry eta for the client.
//!
//! Failure rule: a fast-store error NEVER grants. It degrades to
//! Queuing with a small fixed eta so clients retry while the store
//! recovers - overload here must not become an oversell there.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use super::error::FlashSaleError;
use crate::config::AdmissionConfig;
use crate::core_types::{SkuId, UserId};
use crate::store::{FastStore, TokenOutcome};

/// What the gate tells the caller. The token is an opaque admission
/// receipt echoed back to the client for tracing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Granted { token: String },
    Queuing { eta_secs: u32, token: String },
    SoldOut,
}

/// Captcha gate window, fixed at one minute
const REQUEST_WINDOW_SECS: u64 = 60;

pub struct AdmissionGate {
    store: Arc<dyn FastStore>,
    config: AdmissionConfig,
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn FastStore>, config: AdmissionConfig) -> Self {
        Self { store, config }
    }

    /// Rate-limited admission for one (user, sku) request.
    pub async fn try_acquire(&self, _user_id: UserId, sku_id: SkuId) -> AdmissionDecision {
        let now_ms = Utc::now().timestamp_millis();
        let outcome = self
            .store
            .acquire_token(
                sku_id,
                self.config.token_rate,
                self.config.token_capacity,
                now_ms,
            )
            .await;

        match outcome {
            Ok(TokenOutcome::Granted { .. }) => AdmissionDecision::Granted {
                token: admission_token(),
            },
            Ok(TokenOutcome::Queued { depth }) => AdmissionDecision::Queuing {
                eta_secs: eta_for_depth(depth, self.config.token_rate),
                token: admission_token(),
            },
            Ok(TokenOutcome::SoldOut) => AdmissionDecision::SoldOut,
            Err(e) => {
                warn!(sku_id, error = %e, "Fast store down; degrading admission to Queuing");
                AdmissionDecision::Queuing {
                    eta_secs: self.config.degraded_eta_secs,
                    token: admission_token(),
                }
            }
        }
    }

    /// Flag the SKU sold out and drop its bucket so no further
    /// acquires succeed.
    pub async fn notify_sold_out(&self, sku_id: SkuId) -> Result<(), FlashSaleError> {
        self.store.set_sold_out(sku_id).await?;
        self.store.drop_bucket(sku_id).await?;
        tracing::info!(sku_id, "Admission closed: sold out");
        Ok(())
    }

    /// Write the per-SKU rate/capacity keys read by the acquire
    /// script. Called at activity start.
    pub async fn configure(
        &self,
        sku_id: SkuId,
        rate: u32,
        capacity: u32,
    ) -> Result<(), FlashSaleError> {
        self.store.configure_bucket(sku_id, rate, capacity).await?;
        Ok(())
    }

    /// Captcha gate: above the per-minute threshold a request must
    /// carry a valid single-use captcha token. Fails open on store
    /// errors - the token bucket still bounds throughput.
    pub async fn check_captcha(
        &self,
        user_id: UserId,
        captcha_token: Option<&str>,
    ) -> Result<(), FlashSaleError> {
        let count = match self
            .store
            .bump_request_count(user_id, REQUEST_WINDOW_SECS)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(user_id, error = %e, "Request counter unavailable; skipping captcha gate");
                return Ok(());
            }
        };
        if count <= self.config.captcha_threshold {
            return Ok(());
        }
        match captcha_token {
            Some(token) if self.store.take_captcha(user_id, token).await? => Ok(()),
            _ => Err(FlashSaleError::CaptchaRequired),
        }
    }

    /// Issue a single-use captcha token. Verification of the actual
    /// challenge happens upstream; this only seeds the single-use
    /// entry the gate consumes.
    pub async fn issue_captcha(&self, user_id: UserId) -> Result<String, FlashSaleError> {
        let token = Uuid::new_v4().simple().to_string();
        self.store
            .put_captcha(user_id, &token, self.config.captcha_ttl_secs)
            .await?;
        Ok(token)
    }
}

fn admission_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// eta = ceil(depth / rate), at least one second
fn eta_for_depth(depth: u64, rate: u32) -> u32 {
    let rate = rate.max(1) as u64;
    depth.div_ceil(rate).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn gate_with(config: AdmissionConfig) -> AdmissionGate {
        AdmissionGate::new(Arc::new(MemoryStore::new()), config)
    }

    #[test]
    fn test_eta_for_depth() {
        assert_eq!(eta_for_depth(1, 100), 1);
        assert_eq!(eta_for_depth(100, 100), 1);
        assert_eq!(eta_for_depth(101, 100), 2);
        assert_eq!(eta_for_depth(5, 0), 5);
    }

    #[tokio::test]
    async fn test_grant_then_queue() {
        let gate = gate_with(AdmissionConfig {
            token_rate: 1,
            token_capacity: 2,
            ..AdmissionConfig::default()
        });

        assert!(matches!(
            gate.try_acquire(1, 10).await,
            AdmissionDecision::Granted { .. }
        ));
        assert!(matches!(
            gate.try_acquire(2, 10).await,
            AdmissionDecision::Granted { .. }
        ));
        match gate.try_acquire(3, 10).await {
            AdmissionDecision::Queuing { eta_secs, .. } => assert_eq!(eta_secs, 1),
            other => panic!("expected Queuing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sold_out_stops_acquires() {
        let gate = gate_with(AdmissionConfig::default());
        gate.notify_sold_out(10).await.unwrap();
        assert_eq!(gate.try_acquire(1, 10).await, AdmissionDecision::SoldOut);
    }

    #[tokio::test]
    async fn test_captcha_gate_triggers_and_consumes() {
        let gate = gate_with(AdmissionConfig {
            captcha_threshold: 2,
            ..AdmissionConfig::default()
        });

        // Under the threshold: no captcha needed
        assert!(gate.check_captcha(7, None).await.is_ok());
        assert!(gate.check_captcha(7, None).await.is_ok());
        // Third request in the window requires one
        assert!(matches!(
            gate.check_captcha(7, None).await,
            Err(FlashSaleError::CaptchaRequired)
        ));

        let token = gate.issue_captcha(7).await.unwrap();
        assert!(gate.check_captcha(7, Some(&token)).await.is_ok());
        // Single use
        assert!(matches!(
            gate.check_captcha(7, Some(&token)).await,
            Err(FlashSaleError::CaptchaRequired)
        ));
    }
}
