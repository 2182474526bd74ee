//! HandlerSocket client facade
//!
//! [`HsClient`] validates arguments, routes operations through the session
//! pool and turns decoded responses into [`ResultSet`]s and counts.
//!
//! # Example
//!
//! ```rust,no_run
//! use handlersocket::{FindOperator, HsClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), handlersocket::HsError> {
//!     let client = HsClient::connect("localhost", 9999, 4).await?;
//!
//!     let columns = ["user_id", "user_name", "user_email", "age"];
//!     client.open_index(1, "test", "test_user", "NAME_MAIL_INDEX", &columns).await?;
//!
//!     client.insert(1, &["0", "yuehua", "test@gmail.com", "25"]).await?;
//!     for row in client.find(1, &["yuehua", "test@gmail.com"]).await? {
//!         println!("age = {:?}", row.get_by_name("age"));
//!     }
//!
//!     let deleted = client.delete(1, &["yuehua"], FindOperator::Eq).await?;
//!     println!("deleted {} rows", deleted);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Ordering
//!
//! Requests on one session are answered in the order they were written, but
//! a pooled client spreads consecutive calls over different sessions. When a
//! later call must observe an earlier one (insert then find, update then
//! find), run both through [`HsClient::pin`].

mod builder;
mod index;
mod result;
mod rows;

pub use builder::HsClientBuilder;
pub use index::IndexSession;
pub use result::{ResultSet, Row};
pub use rows::FindOptions;

use std::sync::Arc;

use crate::error::{HsError, HsResult};
use crate::pool::SessionPool;
use crate::protocol::{Request, WireResponse};
use crate::session::{Session, SessionState};

#[derive(Clone)]
pub struct HsClient {
    pool: Arc<SessionPool>,
    /// Set on clients returned by [`HsClient::pin`]
    pinned: Option<Arc<Session>>,
}

impl HsClient {
    /// Connect `pool_size` persistent sessions to `host:port`
    pub async fn connect(host: &str, port: u16, pool_size: usize) -> HsResult<Self> {
        HsClientBuilder::new(host, port)
            .pool_size(pool_size)
            .build()
            .await
    }

    pub fn builder(host: &str, port: u16) -> HsClientBuilder {
        HsClientBuilder::new(host, port)
    }

    pub(crate) fn from_pool(pool: Arc<SessionPool>) -> Self {
        Self { pool, pinned: None }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Number of sessions currently eligible for operations
    pub fn ready_sessions(&self) -> usize {
        self.pool.ready_count()
    }

    /// A client whose operations all run on one session, in call order.
    ///
    /// The pinned session is not replaced on disconnect: once it breaks, its
    /// operations fail with a retrying connection error and the caller pins
    /// again.
    pub async fn pin(&self) -> HsResult<HsClient> {
        let session = self.pool.acquire().await?;
        Ok(Self {
            pool: self.pool.clone(),
            pinned: Some(session),
        })
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// State of the pinned session, if any
    pub fn pinned_state(&self) -> Option<SessionState> {
        self.pinned.as_ref().map(|s| s.state())
    }

    pub(crate) async fn execute(&self, request: Request) -> HsResult<WireResponse> {
        match &self.pinned {
            None => self.pool.execute(request).await,
            Some(session) => {
                if self.pool.is_shut_down() {
                    return Err(HsError::Shutdown);
                }
                let descriptor = self.pool.describe_target(&request)?;
                SessionPool::execute_on(session, &descriptor, request).await
            }
        }
    }

    /// Close every session and stop reconnecting. Idempotent.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
