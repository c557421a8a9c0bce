//! Bandwidth metering for dedicated gateways
//!
//! A dedicated gateway bills its tenant for bytes served from the CDN. After
//! each successful ranged fetch the service reports the block size to the
//! pinning service. Reports are fire-and-forget: a lost report never fails a
//! read.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{BlockServiceError, Result};

/// Header carrying the gateway's API key
pub const API_KEY_HEADER: &str = "blockservice-API-Key";

/// Usage event sent to the pinning service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BandwidthUsage {
    /// Bytes served
    pub amount: u64,
    /// Content hash of the block served
    pub cid: String,
}

/// Receives bandwidth usage reports
#[async_trait]
pub trait UsageReporter: Send + Sync {
    async fn report_usage(&self, usage: BandwidthUsage) -> Result<()>;
}

/// Reports usage to the pinning service's hourly bandwidth endpoint
pub struct HttpUsageReporter {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpUsageReporter {
    pub fn new(
        pinning_service_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BlockServiceError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: format!(
                "{}/api/hourlyUsage/bandwidth/",
                pinning_service_url.trim_end_matches('/')
            ),
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl UsageReporter for HttpUsageReporter {
    async fn report_usage(&self, usage: BandwidthUsage) -> Result<()> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&usage)
            .send()
            .await
            .map_err(BlockServiceError::metering)?;

        if !response.status().is_success() {
            return Err(BlockServiceError::metering(format!(
                "HTTP {}",
                response.status()
            )));
        }

        debug!(amount = usage.amount, cid = %usage.cid, "Reported bandwidth usage");
        Ok(())
    }
}
