//! Asynchronous client for the HandlerSocket protocol.
//!
//! A pool of persistent TCP sessions pipelines requests to a HandlerSocket
//! server. Indexes are opened once through [`HsClient::open_index`] and are
//! re-opened automatically on every session that reconnects.

pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use client::{FindOptions, HsClient, HsClientBuilder, IndexSession, ResultSet, Row};
pub use config::{ClientConfig, SelectionPolicy};
pub use error::{ErrorKind, HsError, HsResult};
pub use pool::SessionPool;
pub use protocol::{FindOperator, ModifyOperation};
pub use registry::{IndexDescriptor, IndexRegistry};
pub use session::{Connector, Session, SessionState, TcpConnector};
pub use supervisor::{BackoffPolicy, Clock, TokioClock};
