use std::sync::Arc;
use std::time::Duration;

use super::HsClient;
use crate::config::{ClientConfig, SelectionPolicy};
use crate::error::HsResult;
use crate::pool::SessionPool;
use crate::session::{Connector, TcpConnector};
use crate::supervisor::{BackoffPolicy, Clock, TokioClock};

pub struct HsClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    clock: Option<Arc<dyn Clock>>,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl HsClientBuilder {
    pub fn new(host: &str, port: u16) -> Self {
        Self::from_config(ClientConfig::new(host, port))
    }

    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            connector: None,
            clock: None,
        }
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = millis(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = Some(millis(timeout));
        self
    }

    /// How long an operation waits for a Ready session before failing
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout_ms = Some(millis(timeout));
        self
    }

    /// Fail immediately when no session is Ready instead of waiting
    pub fn fail_fast(mut self) -> Self {
        self.config.acquire_timeout_ms = None;
        self
    }

    pub fn selection(mut self, policy: SelectionPolicy) -> Self {
        self.config.selection = policy;
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.backoff = policy;
        self
    }

    pub fn auth_key(mut self, key: &str) -> Self {
        self.config.auth_key = Some(key.to_string());
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Replace the TCP transport, e.g. with in-memory streams
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the clock that paces reconnect attempts
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn build(self) -> HsResult<HsClient> {
        let connector = self.connector.unwrap_or_else(|| Arc::new(TcpConnector));
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let pool = SessionPool::connect(self.config, connector, clock).await?;
        Ok(HsClient::from_pool(pool))
    }
}
