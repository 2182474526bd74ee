//! Pool of persistent sessions behind one logical client.
//!
//! Each slot holds at most one session. Operations go to a Ready session
//! picked by the configured [`SelectionPolicy`]; broken sessions stay in
//! their slot, excluded from selection, until the supervisor installs a
//! replacement that has re-opened every registered index.
//!
//! There is no ordering across sessions. Callers that need an insert to be
//! visible to the next find must pin both to one session (see
//! [`crate::client::HsClient::pin`]).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, SelectionPolicy};
use crate::error::{HsError, HsResult};
use crate::protocol::{Request, WireResponse};
use crate::registry::{IndexDescriptor, IndexRegistry, Registration};
use crate::session::{Connector, Session, SessionEvent, SessionOptions, SessionState};
use crate::supervisor::{Clock, Supervisor};

#[derive(Default)]
struct Slot {
    session: RwLock<Option<Arc<Session>>>,
    reconnecting: AtomicBool,
    failed: AtomicBool,
}

enum Install {
    Installed,
    NeedsReplay,
    Lost,
    ShutDown,
}

pub struct SessionPool {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<IndexRegistry>,
    slots: Vec<Slot>,
    cursor: AtomicUsize,
    ready: Notify,
    events: mpsc::UnboundedSender<SessionEvent>,
    shut_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    /// Open `config.pool_size` sessions and start the reconnect supervisor.
    ///
    /// Slots that fail to connect are handed to the supervisor straight away.
    /// Fails only when not a single session could be established.
    pub async fn connect(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> HsResult<Arc<Self>> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slots = (0..config.pool_size).map(|_| Slot::default()).collect();

        let pool = Arc::new(Self {
            connector,
            registry: Arc::new(IndexRegistry::new()),
            slots,
            cursor: AtomicUsize::new(0),
            ready: Notify::new(),
            events: events_tx,
            shut_down: AtomicBool::new(false),
            shutdown_tx,
            supervisor: parking_lot::Mutex::new(None),
            config,
        });

        let supervisor = Supervisor::new(
            Arc::downgrade(&pool),
            pool.config.backoff.clone(),
            clock,
        );
        *pool.supervisor.lock() = Some(tokio::spawn(supervisor.run(events_rx, shutdown_rx)));

        let attempts = (0..pool.slots.len()).map(|slot| {
            let pool = pool.clone();
            async move { (slot, pool.establish(slot).await) }
        });
        let results = futures::future::join_all(attempts).await;

        let mut first_error = None;
        for (slot, result) in results {
            if let Err(e) = result {
                warn!(slot, "initial connection failed: {}", e);
                let _ = pool.events.send(SessionEvent {
                    slot,
                    session_id: 0,
                    reason: e.to_string(),
                });
                first_error.get_or_insert(e);
            }
        }

        if pool.ready_count() == 0 {
            pool.shutdown().await;
            return Err(first_error
                .unwrap_or_else(|| HsError::Connect("no session could be established".into())));
        }

        info!(
            addr = %pool.config.address(),
            ready = pool.ready_count(),
            size = pool.size(),
            "session pool connected"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> {
        &self.registry
    }

    /// Configured number of sessions
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn ready_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                slot.session
                    .read()
                    .as_ref()
                    .is_some_and(|s| s.is_ready())
            })
            .count()
    }

    /// State of the session in each slot; `None` for an empty slot
    pub fn session_states(&self) -> Vec<Option<SessionState>> {
        self.slots
            .iter()
            .map(|slot| slot.session.read().as_ref().map(|s| s.state()))
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> HsResult<()> {
        if self.is_shut_down() {
            Err(HsError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn all_failed(&self) -> bool {
        self.slots.iter().all(|slot| slot.failed.load(Ordering::SeqCst))
    }

    /// Register the index and open it on every Ready session.
    ///
    /// The registration stays pending, invisible to operations and replay,
    /// until a server accepts the open. When no session is Ready the call
    /// waits for one like any operation, and the server's answer on that
    /// session decides the outcome.
    pub async fn open_index(&self, descriptor: IndexDescriptor) -> HsResult<bool> {
        self.ensure_running()?;
        let index_id = descriptor.index_id;
        let registration = self.registry.register(descriptor.clone())?;

        match self.broadcast_open(&descriptor).await {
            Ok(()) => {
                self.registry.confirm(&descriptor)?;
                Ok(true)
            }
            Err(e) => {
                if registration == Registration::New && self.registry.rollback(index_id) {
                    debug!(index_id, "open_index failed, dropping registration: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn broadcast_open(&self, descriptor: &IndexDescriptor) -> HsResult<()> {
        let mut sessions = self.ready_sessions();
        if sessions.is_empty() {
            sessions.push(self.acquire().await?);
        }
        try_join_all(sessions.iter().map(|s| s.open_index(descriptor))).await?;
        debug!(
            index_id = descriptor.index_id,
            sessions = sessions.len(),
            "index opened: {}",
            descriptor
        );
        Ok(())
    }

    /// Run a find/insert/modify request on any Ready session
    pub async fn execute(&self, request: Request) -> HsResult<WireResponse> {
        self.ensure_running()?;
        let descriptor = self.describe_target(&request)?;
        let session = self.acquire().await?;
        Self::execute_on(&session, &descriptor, request).await
    }

    pub(crate) fn describe_target(&self, request: &Request) -> HsResult<Arc<IndexDescriptor>> {
        let index_id = request
            .index_id()
            .ok_or_else(|| HsError::invalid("request does not target an index"))?;
        self.registry.describe(index_id)
    }

    /// Run a request on a specific session, opening the index there first if
    /// the session has not seen it yet
    pub(crate) async fn execute_on(
        session: &Session,
        descriptor: &IndexDescriptor,
        request: Request,
    ) -> HsResult<WireResponse> {
        if !session.has_opened(descriptor.index_id) {
            session.open_index(descriptor).await?;
        }
        session.request(request).await
    }

    fn ready_sessions(&self) -> Vec<Arc<Session>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.session.read().clone())
            .filter(|s| s.is_ready())
            .collect()
    }

    fn select_ready(&self) -> Option<Arc<Session>> {
        let n = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let mut candidates = (0..n).filter_map(|i| {
            self.slots[(start + i) % n]
                .session
                .read()
                .clone()
                .filter(|s| s.is_ready())
        });

        match self.config.selection {
            SelectionPolicy::RoundRobin => candidates.next(),
            SelectionPolicy::LeastPending => candidates.min_by_key(|s| s.pending_len()),
        }
    }

    /// Pick a Ready session, waiting up to the acquire timeout if none is
    pub async fn acquire(&self) -> HsResult<Arc<Session>> {
        self.ensure_running()?;
        if let Some(session) = self.select_ready() {
            return Ok(session);
        }
        if self.all_failed() {
            return Err(HsError::ConnectionFailed(
                "every session slot has exhausted its reconnect attempts".to_string(),
            ));
        }
        let Some(timeout) = self.config.acquire_timeout() else {
            return Err(HsError::Unavailable);
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_running()?;
            if let Some(session) = self.select_ready() {
                return Ok(session);
            }
            if self.all_failed() {
                return Err(HsError::ConnectionFailed(
                    "every session slot has exhausted its reconnect attempts".to_string(),
                ));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(HsError::Unavailable);
            }
        }
    }

    fn session_options(&self, slot: usize) -> SessionOptions {
        SessionOptions {
            addr: self.config.address(),
            slot,
            connect_timeout: self.config.connect_timeout(),
            request_timeout: self.config.request_timeout(),
            max_frame_size: self.config.max_frame_size,
            auth_key: self.config.auth_key.clone(),
            events: Some(self.events.clone()),
        }
    }

    /// Connect a fresh session for `slot`, replay the registry onto it and
    /// install it as Ready. Returns the new session id.
    pub(crate) async fn establish(&self, slot: usize) -> HsResult<u64> {
        self.ensure_running()?;
        let session = Session::open(self.connector.as_ref(), self.session_options(slot)).await?;

        loop {
            let generation = match self.replay(&session).await {
                Ok(generation) => generation,
                Err(e) => {
                    session.close().await;
                    return Err(e);
                }
            };
            match self.install(slot, &session, generation) {
                Install::Installed => return Ok(session.id()),
                Install::NeedsReplay => {
                    debug!(slot, session = session.id(), "registry changed during replay");
                    continue;
                }
                Install::Lost => {
                    session.close().await;
                    return Err(HsError::ConnectionLost(
                        "session failed before it could be installed".to_string(),
                    ));
                }
                Install::ShutDown => {
                    session.close().await;
                    return Err(HsError::Shutdown);
                }
            }
        }
    }

    /// Open every confirmed index the session lacks. Returns the registry
    /// generation the replay brought the session up to.
    async fn replay(&self, session: &Session) -> HsResult<u64> {
        let (generation, descriptors) = self.registry.versioned_snapshot();
        let missing: Vec<Arc<IndexDescriptor>> = descriptors
            .into_iter()
            .filter(|d| !session.has_opened(d.index_id))
            .collect();
        if missing.is_empty() {
            return Ok(generation);
        }

        debug!(session = session.id(), indexes = missing.len(), "replaying index registrations");
        try_join_all(missing.iter().map(|d| session.open_index(d))).await?;
        Ok(generation)
    }

    fn install(&self, slot: usize, session: &Arc<Session>, replayed: u64) -> Install {
        // the registry stays read-locked until the session is visible as
        // Ready, so a confirmation either lands before the check or finds
        // the session among the Ready ones
        let (registry, generation) = self.registry.hold_generation();
        if generation != replayed {
            return Install::NeedsReplay;
        }

        let slot_ref = &self.slots[slot];
        let mut current = slot_ref.session.write();
        if self.is_shut_down() {
            return Install::ShutDown;
        }
        if session.state().is_terminal() {
            return Install::Lost;
        }

        session.set_state(SessionState::Ready);
        let previous = current.replace(session.clone());
        slot_ref.reconnecting.store(false, Ordering::SeqCst);
        slot_ref.failed.store(false, Ordering::SeqCst);
        drop(current);
        drop(registry);

        if let Some(previous) = previous {
            debug!(slot, replaced = previous.id(), state = %previous.state(), "session replaced");
        }
        self.ready.notify_waiters();
        Install::Installed
    }

    /// Whether `session_id` is what currently occupies `slot` (0 for empty)
    pub(crate) fn is_current(&self, slot: usize, session_id: u64) -> bool {
        self.slots.get(slot).is_some_and(|s| {
            s.session.read().as_ref().map_or(0, |session| session.id()) == session_id
        })
    }

    /// Claim a slot for reconnection; false if a reconnect is already running
    pub(crate) fn begin_reconnect(&self, slot: usize) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| !s.reconnecting.swap(true, Ordering::SeqCst))
    }

    pub(crate) fn mark_failed(&self, slot: usize) {
        if let Some(s) = self.slots.get(slot) {
            s.failed.store(true, Ordering::SeqCst);
            s.reconnecting.store(false, Ordering::SeqCst);
        }
        // wake waiters so they can report the permanent failure
        self.ready.notify_waiters();
    }

    /// Close every session and stop the supervisor. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let sessions: Vec<Arc<Session>> = self
            .slots
            .iter()
            .filter_map(|slot| slot.session.write().take())
            .collect();
        for session in &sessions {
            session.close().await;
        }

        self.ready.notify_waiters();
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        info!(sessions = sessions.len(), "session pool shut down");
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FindOperator;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn find(index_id: i32, key: &str) -> Request {
        Request::Find {
            index_id,
            operator: FindOperator::Eq,
            keys: vec![Some(key.to_string())],
            limit: 1,
            offset: 0,
        }
    }

    #[tokio::test]
    async fn test_execute_on_opens_missing_index_once() {
        let (client, server) = tokio::io::duplex(4096);
        let session = Session::from_stream(Box::new(client), SessionOptions::new("duplex"));
        session.set_state(SessionState::Ready);
        let descriptor =
            IndexDescriptor::new(4, "test", "test_user", "PRIMARY", &["user_id"]).unwrap();

        let peer = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut lines = Vec::new();
            for _ in 0..3 {
                let mut line = String::new();
                server.read_line(&mut line).await.unwrap();
                let reply: &[u8] = if line.starts_with("P\t") {
                    b"0\t1\n"
                } else {
                    b"0\t1\t7\n"
                };
                server.get_mut().write_all(reply).await.unwrap();
                lines.push(line);
            }
            lines
        });

        assert!(!session.has_opened(4));
        for _ in 0..2 {
            let response = SessionPool::execute_on(&session, &descriptor, find(4, "7"))
                .await
                .unwrap();
            assert_eq!(response.row_count(), 1);
        }
        assert!(session.has_opened(4));

        let lines = peer.await.unwrap();
        assert_eq!(lines[0], "P\t4\ttest\ttest_user\tPRIMARY\tuser_id\n");
        assert_eq!(lines[1], "4\t=\t1\t7\t1\t0\n");
        assert_eq!(lines[2], "4\t=\t1\t7\t1\t0\n");
    }
}
