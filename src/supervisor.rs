//! Reconnect supervisor
//!
//! A background task fed by session-closed events. For every broken slot it
//! reconnects with exponential backoff, replays the index registry onto the
//! new session and only then hands it back to the pool as Ready.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{HsError, HsResult};
use crate::pool::SessionPool;
use crate::session::SessionEvent;

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// `None` keeps retrying until the client is shut down
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_initial_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt may follow the given failed attempt
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    pub fn validate(&self) -> HsResult<()> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(HsError::Config(
                "backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.initial_ms > self.max_ms {
            return Err(HsError::Config(
                "backoff initial delay exceeds its maximum".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(HsError::Config(
                "backoff max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Source of delays for the supervisor; swapped out in tests
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct Supervisor {
    pool: Weak<SessionPool>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(pool: Weak<SessionPool>, policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            policy,
            clock,
        }
    }

    /// Run until shutdown is signalled or the pool is dropped
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let Some(pool) = self.pool.upgrade() else { break };
                    if pool.is_shut_down() {
                        break;
                    }
                    if !pool.is_current(event.slot, event.session_id) {
                        debug!(slot = event.slot, session = event.session_id, "ignoring event for a replaced session");
                        continue;
                    }
                    if !pool.begin_reconnect(event.slot) {
                        continue;
                    }
                    info!(slot = event.slot, "session lost ({}), reconnecting", event.reason);
                    tasks.spawn(reconnect_slot(
                        self.pool.clone(),
                        event.slot,
                        self.policy.clone(),
                        self.clock.clone(),
                        shutdown.clone(),
                    ));
                }
            }
        }

        tasks.abort_all();
        debug!("reconnect supervisor stopped");
    }
}

async fn reconnect_slot(
    pool: Weak<SessionPool>,
    slot: usize,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let Some(p) = pool.upgrade() else { return };
        if p.is_shut_down() || *shutdown.borrow() {
            return;
        }

        match p.establish(slot).await {
            Ok(session_id) => {
                info!(slot, session = session_id, attempt, "session restored");
                return;
            }
            Err(HsError::Shutdown) => return,
            Err(e) => warn!(slot, attempt, "reconnect attempt failed: {}", e),
        }

        if !policy.allows_retry(attempt) {
            error!(slot, attempt, "giving up on session slot");
            p.mark_failed(slot);
            return;
        }
        drop(p);

        let delay = policy.delay_for(attempt);
        tokio::select! {
            _ = clock.sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}
