//! One persistent, pipelined connection to a HandlerSocket server.
//!
//! The protocol carries no request identifiers. Every request written on the
//! wire pushes a pending marker onto a FIFO queue, and every response line is
//! matched against the oldest marker. Writes are serialized by an async lock
//! and the marker is queued under that same lock, so queue order always equals
//! wire order.
//!
//! A response that cannot be parsed leaves the byte stream unrecoverable; the
//! session goes Broken and the pool's supervisor replaces it. Server-reported
//! errors are ordinary results and leave the session healthy.

pub mod transport;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{HsError, HsResult};
use crate::protocol::{
    decode_response, encode_request, next_frame, OperationKind, Request, ResponseShape,
    WireResponse, MAX_FRAME_SIZE,
};
use crate::registry::IndexDescriptor;

pub use transport::{Connector, SessionStream, TcpConnector};

const READ_BUFFER_SIZE: usize = 8 * 1024;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Transport is up, handshake (auth) in progress
    Connecting = 0,
    /// Handshake done, registered indexes are being re-opened
    Replaying = 1,
    /// Eligible for pool selection
    Ready = 2,
    /// Transport failed; waiting to be replaced
    Broken = 3,
    /// Explicitly closed
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Replaying,
            2 => SessionState::Ready,
            3 => SessionState::Broken,
            _ => SessionState::Closed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Broken | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Replaying => "replaying",
            SessionState::Ready => "ready",
            SessionState::Broken => "broken",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lifecycle notification sent to the reconnect supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub slot: usize,
    pub session_id: u64,
    pub reason: String,
}

/// Per-session settings derived from the client configuration
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub addr: String,
    pub slot: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub max_frame_size: usize,
    pub auth_key: Option<String>,
    pub events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionOptions {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            slot: 0,
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
            max_frame_size: MAX_FRAME_SIZE,
            auth_key: None,
            events: None,
        }
    }
}

struct PendingRequest {
    kind: OperationKind,
    shape: ResponseShape,
    responder: oneshot::Sender<HsResult<WireResponse>>,
}

struct Shared {
    id: u64,
    slot: usize,
    addr: String,
    max_frame_size: usize,
    state: AtomicU8,
    /// Also guards state transitions out of the live states, so a request can
    /// never be queued after the queue has been failed.
    pending: parking_lot::Mutex<VecDeque<PendingRequest>>,
    opened: parking_lot::Mutex<HashSet<i32>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn on_bytes_received(&self, buf: &mut Vec<u8>) -> HsResult<()> {
        while let Some(line) = next_frame(buf, self.max_frame_size)? {
            let head = self.pending.lock().pop_front();
            let Some(pending) = head else {
                return Err(HsError::frame("response received with no request outstanding"));
            };

            let result = decode_response(&line, pending.shape);
            if let Err(e) = &result {
                if e.is_fatal_to_session() {
                    let err = e.clone();
                    let _ = pending.responder.send(result);
                    return Err(err);
                }
            }

            if pending.responder.send(result).is_err() {
                debug!(
                    session = self.id,
                    kind = %pending.kind,
                    "discarding late response for an abandoned request"
                );
            }
        }
        Ok(())
    }

    fn on_closed(&self, reason: String) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            if self.state().is_terminal() {
                return;
            }
            self.state.store(SessionState::Broken as u8, Ordering::SeqCst);
            pending.drain(..).collect()
        };

        warn!(
            session = self.id,
            slot = self.slot,
            addr = %self.addr,
            in_flight = drained.len(),
            "session broken: {}",
            reason
        );

        for pending in drained {
            let _ = pending
                .responder
                .send(Err(HsError::ConnectionLost(reason.clone())));
        }

        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent {
                slot: self.slot,
                session_id: self.id,
                reason,
            });
        }
    }
}

/// Resolves when the response matching one request has been decoded
#[derive(Debug)]
pub struct ResponseHandle {
    rx: oneshot::Receiver<HsResult<WireResponse>>,
    kind: OperationKind,
}

impl ResponseHandle {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub async fn wait(self) -> HsResult<WireResponse> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(HsError::ConnectionLost("session dropped".to_string())))
    }

    /// Wait at most `timeout`.
    ///
    /// On expiry the queue slot is left in place; the protocol cannot cancel a
    /// request, and removing the slot would shift every later response onto
    /// the wrong caller. The late response is discarded when it arrives.
    pub async fn wait_timeout(self, timeout: Duration) -> HsResult<WireResponse> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(result) => result
                .unwrap_or_else(|_| Err(HsError::ConnectionLost("session dropped".to_string()))),
            Err(_) => Err(HsError::Timeout(timeout)),
        }
    }
}

/// Breaks the session if a write future is dropped before the frame is fully
/// on the wire; a half-written frame cannot be resynchronized.
struct WriteInProgress<'a> {
    shared: &'a Shared,
    finished: bool,
}

impl Drop for WriteInProgress<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.shared
                .on_closed("request cancelled while being written".to_string());
        }
    }
}

pub struct Session {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<WriteHalf<SessionStream>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    request_timeout: Option<Duration>,
}

impl Session {
    /// Connect, authenticate if configured, and leave the session in
    /// `Replaying`, ready for its indexes to be opened.
    pub async fn open(connector: &dyn Connector, options: SessionOptions) -> HsResult<Arc<Self>> {
        let stream = match tokio::time::timeout(
            options.connect_timeout,
            connector.connect(&options.addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(HsError::Connect(format!(
                    "Failed to connect to {}: {}",
                    options.addr, e
                )))
            }
            Err(_) => {
                return Err(HsError::Connect(format!(
                    "Timed out connecting to {} after {:?}",
                    options.addr, options.connect_timeout
                )))
            }
        };

        let auth_key = options.auth_key.clone();
        let session = Self::from_stream(stream, options);

        if let Some(key) = auth_key {
            if let Err(e) = session.request(Request::Auth { key }).await {
                session.close().await;
                return Err(e);
            }
        }

        session.set_state(SessionState::Replaying);
        debug!(session = session.id(), slot = session.slot(), "session connected");
        Ok(session)
    }

    /// Wrap an already established stream. The session starts in `Connecting`.
    pub fn from_stream(stream: SessionStream, options: SessionOptions) -> Arc<Self> {
        let (read, write) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            slot: options.slot,
            addr: options.addr,
            max_frame_size: options.max_frame_size,
            state: AtomicU8::new(SessionState::Connecting as u8),
            pending: parking_lot::Mutex::new(VecDeque::new()),
            opened: parking_lot::Mutex::new(HashSet::new()),
            events: options.events,
        });

        let reader = tokio::spawn(read_loop(shared.clone(), read));

        Arc::new(Self {
            shared,
            writer: tokio::sync::Mutex::new(write),
            reader: parking_lot::Mutex::new(Some(reader)),
            request_timeout: options.request_timeout,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn slot(&self) -> usize {
        self.shared.slot
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Requests written but not yet answered
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn has_opened(&self, index_id: i32) -> bool {
        self.shared.opened.lock().contains(&index_id)
    }

    pub fn opened_index_ids(&self) -> HashSet<i32> {
        self.shared.opened.lock().clone()
    }

    /// Move between the live states; terminal states are left alone
    pub(crate) fn set_state(&self, state: SessionState) {
        let _pending = self.shared.pending.lock();
        if !self.shared.state().is_terminal() {
            self.shared.state.store(state as u8, Ordering::SeqCst);
        }
    }

    /// Write a request and return a handle for its response.
    ///
    /// Safe to call from many tasks at once. Callers do not wait for earlier
    /// responses before writing; the protocol is pipelined.
    pub async fn send(&self, request: Request) -> HsResult<ResponseHandle> {
        let frame = encode_request(&request)?;
        let kind = request.kind();
        let (tx, rx) = oneshot::channel();

        let mut writer = self.writer.lock().await;
        {
            let mut pending = self.shared.pending.lock();
            match self.shared.state() {
                SessionState::Broken => {
                    return Err(HsError::ConnectionLost(format!(
                        "session {} is broken",
                        self.shared.id
                    )))
                }
                SessionState::Closed => return Err(HsError::Shutdown),
                _ => {}
            }
            pending.push_back(PendingRequest {
                kind,
                shape: kind.response_shape(),
                responder: tx,
            });
        }

        let mut guard = WriteInProgress {
            shared: &self.shared,
            finished: false,
        };
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        guard.finished = true;
        drop(writer);

        if let Err(e) = written {
            // fails the marker queued above along with everything else
            self.shared.on_closed(format!("write failed: {}", e));
        }

        trace!(session = self.shared.id, kind = %kind, bytes = frame.len(), "request written");
        Ok(ResponseHandle { rx, kind })
    }

    /// Send and wait, honoring the configured request timeout
    pub async fn request(&self, request: Request) -> HsResult<WireResponse> {
        let handle = self.send(request).await?;
        match self.request_timeout {
            Some(timeout) => handle.wait_timeout(timeout).await,
            None => handle.wait().await,
        }
    }

    /// Open an index on this connection and remember that it is open
    pub async fn open_index(&self, descriptor: &IndexDescriptor) -> HsResult<()> {
        self.request(Request::open_index(descriptor)).await?;
        self.shared.opened.lock().insert(descriptor.index_id);
        Ok(())
    }

    /// Feed received bytes; complete frames resolve pending handles in order.
    ///
    /// Normally driven by the session's own read task. An error means the
    /// stream is unusable and the session has to be dropped.
    pub fn on_bytes_received(&self, buf: &mut Vec<u8>) -> HsResult<()> {
        self.shared.on_bytes_received(buf)
    }

    /// Transport went away: fail everything in flight and notify the supervisor
    pub fn on_closed(&self, reason: &str) {
        self.shared.on_closed(reason.to_string());
    }

    /// Close the session for good. Pending handles fail with `Shutdown`.
    pub async fn close(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.shared.pending.lock();
            if self.shared.state() == SessionState::Closed {
                return;
            }
            self.shared
                .state
                .store(SessionState::Closed as u8, Ordering::SeqCst);
            pending.drain(..).collect()
        };
        for pending in drained {
            let _ = pending.responder.send(Err(HsError::Shutdown));
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        // a writer stuck on a full socket keeps the lock; dropping the
        // session releases the transport in that case
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
        debug!(session = self.shared.id, slot = self.shared.slot, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("slot", &self.shared.slot)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: ReadHalf<SessionStream>) {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_BUFFER_SIZE);
    loop {
        if buf.capacity() - buf.len() < READ_BUFFER_SIZE / 2 {
            buf.reserve(READ_BUFFER_SIZE);
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                shared.on_closed("connection closed by server".to_string());
                break;
            }
            Ok(_) => {
                if let Err(e) = shared.on_bytes_received(&mut buf) {
                    shared.on_closed(e.to_string());
                    break;
                }
            }
            Err(e) => {
                shared.on_closed(format!("read failed: {}", e));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FindOperator, ResponseBody};
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    fn find(index_id: i32, key: &str) -> Request {
        Request::Find {
            index_id,
            operator: FindOperator::Eq,
            keys: vec![Some(key.to_string())],
            limit: 1,
            offset: 0,
        }
    }

    fn delete(index_id: i32, key: &str) -> Request {
        Request::Modify {
            index_id,
            operator: FindOperator::Eq,
            keys: vec![Some(key.to_string())],
            limit: 1,
            offset: 0,
            operation: crate::protocol::ModifyOperation::Delete,
            values: vec![],
        }
    }

    fn pair(
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> (Arc<Session>, BufReader<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut options = SessionOptions::new("duplex");
        options.events = events;
        let session = Session::from_stream(Box::new(client), options);
        session.set_state(SessionState::Ready);
        (session, BufReader::new(server))
    }

    async fn read_request(server: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_pipelined_responses_resolve_in_write_order() {
        let (session, mut server) = pair(None);

        let h1 = session.send(find(1, "a")).await.unwrap();
        let h2 = session.send(delete(1, "b")).await.unwrap();
        let h3 = session.send(find(1, "c")).await.unwrap();
        assert_eq!(session.pending_len(), 3);

        assert_eq!(read_request(&mut server).await, "1\t=\t1\ta\t1\t0\n");
        assert_eq!(read_request(&mut server).await, "1\t=\t1\tb\t1\t0\tD\n");
        assert_eq!(read_request(&mut server).await, "1\t=\t1\tc\t1\t0\n");

        server
            .get_mut()
            .write_all(b"0\t1\ta\n0\t1\t1\n0\t1\n")
            .await
            .unwrap();

        let r1 = h1.wait().await.unwrap();
        assert_eq!(r1.body, ResponseBody::Rows(vec![vec![Some("a".into())]]));
        assert_eq!(h2.wait().await.unwrap().body, ResponseBody::Count(1));
        assert_eq!(h3.wait().await.unwrap().row_count(), 0);
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_partial_frames_are_buffered() {
        let (client, _server) = tokio::io::duplex(1024);
        let session = Session::from_stream(Box::new(client), SessionOptions::new("duplex"));
        let handle = session.send(find(1, "x")).await.unwrap();

        let mut buf = b"0\t2\tx".to_vec();
        session.on_bytes_received(&mut buf).unwrap();
        assert_eq!(session.pending_len(), 1);

        buf.extend_from_slice(b"\t\x00\n");
        session.on_bytes_received(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(session.pending_len(), 0);

        let response = handle.wait().await.unwrap();
        assert_eq!(
            response.body,
            ResponseBody::Rows(vec![vec![Some("x".into()), None]])
        );
    }

    #[tokio::test]
    async fn test_server_error_keeps_session_healthy() {
        let (session, mut server) = pair(None);

        let handle = session.send(find(1001, "k")).await.unwrap();
        read_request(&mut server).await;
        server.get_mut().write_all(b"2\t1\tstmtnum\n").await.unwrap();

        let err = handle.wait().await.unwrap_err();
        assert_eq!(
            err,
            HsError::Server {
                code: 2,
                message: "stmtnum".into()
            }
        );
        assert_eq!(session.state(), SessionState::Ready);

        let handle = session.send(find(1, "k")).await.unwrap();
        read_request(&mut server).await;
        server.get_mut().write_all(b"0\t1\n").await.unwrap();
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_frame_breaks_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (session, mut server) = pair(Some(tx));

        let h1 = session.send(delete(1, "a")).await.unwrap();
        let h2 = session.send(find(1, "b")).await.unwrap();
        read_request(&mut server).await;
        server.get_mut().write_all(b"0\t1\tnot-a-number\n").await.unwrap();

        assert!(matches!(h1.wait().await, Err(HsError::Frame(_))));
        assert!(matches!(h2.wait().await, Err(HsError::ConnectionLost(_))));
        assert_eq!(session.state(), SessionState::Broken);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, session.id());

        assert!(matches!(
            session.send(find(1, "c")).await,
            Err(HsError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_fatal() {
        let (client, _server) = tokio::io::duplex(1024);
        let session = Session::from_stream(Box::new(client), SessionOptions::new("duplex"));
        let mut buf = b"0\t1\n".to_vec();
        assert!(matches!(
            session.on_bytes_received(&mut buf),
            Err(HsError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_fails_in_flight_and_notifies_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (session, server) = pair(Some(tx));

        let handle = session.send(find(1, "a")).await.unwrap();
        drop(server);

        assert!(matches!(
            handle.wait().await,
            Err(HsError::ConnectionLost(_))
        ));
        assert_eq!(session.state(), SessionState::Broken);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.slot, 0);
        session.on_closed("again");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timed_out_slot_stays_queued() {
        let (session, mut server) = pair(None);

        let slow = session.send(find(1, "slow")).await.unwrap();
        let err = slow.wait_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, HsError::Timeout(Duration::from_millis(20)));
        assert_eq!(session.pending_len(), 1);

        let next = session.send(delete(1, "next")).await.unwrap();
        read_request(&mut server).await;
        read_request(&mut server).await;

        // late answer for "slow" is discarded, "next" still gets its own
        server
            .get_mut()
            .write_all(b"0\t1\tslow\n0\t1\t7\n")
            .await
            .unwrap();
        assert_eq!(next.wait().await.unwrap().body, ResponseBody::Count(7));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_close_fails_pending_with_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (session, _server) = pair(Some(tx));

        let handle = session.send(find(1, "a")).await.unwrap();
        session.close().await;

        assert_eq!(handle.wait().await.unwrap_err(), HsError::Shutdown);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.send(find(1, "b")).await.unwrap_err(), HsError::Shutdown);
        // closing is not a failure, the supervisor is not told
        assert!(rx.try_recv().is_err());
        session.close().await;
    }

    #[tokio::test]
    async fn test_open_index_marks_session() {
        let (session, mut server) = pair(None);
        let descriptor =
            IndexDescriptor::new(4, "test", "test_user", "PRIMARY", &["user_id"]).unwrap();

        let open = {
            let session = session.clone();
            let descriptor = descriptor.clone();
            tokio::spawn(async move { session.open_index(&descriptor).await })
        };
        assert_eq!(
            read_request(&mut server).await,
            "P\t4\ttest\ttest_user\tPRIMARY\tuser_id\n"
        );
        server.get_mut().write_all(b"0\t1\n").await.unwrap();
        open.await.unwrap().unwrap();
        assert!(session.has_opened(4));
        assert!(!session.has_opened(5));
    }
}
