//! Gateway push client
//!
//! The router delivers fast-path messages by calling the access
//! gateway that holds the recipient's connection. Every call carries
//! a per-attempt deadline; retry policy lives in the router, not
//! here.

use std::time::Duration;

use async_trait::async_trait;

use super::error::ImError;
use super::types::DeliveryPush;

#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Push one message to one device via its gateway. Must resolve
    /// within the configured deadline, success or not.
    async fn push(
        &self,
        gateway_id: &str,
        device_id: &str,
        push: &DeliveryPush,
    ) -> Result<(), ImError>;
}

/// HTTP push to the gateway's internal delivery endpoint
pub struct HttpGatewayClient {
    client: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new(push_timeout: Duration) -> Result<Self, ImError> {
        let client = reqwest::Client::builder()
            .timeout(push_timeout)
            .build()
            .map_err(|e| ImError::System(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn push(
        &self,
        gateway_id: &str,
        device_id: &str,
        push: &DeliveryPush,
    ) -> Result<(), ImError> {
        let url = format!("http://{gateway_id}/internal/push/{device_id}");
        let response = self
            .client
            .post(&url)
            .json(push)
            .send()
            .await
            .map_err(|e| ImError::GatewayPush(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ImError::GatewayPush(format!(
                "gateway {gateway_id} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
