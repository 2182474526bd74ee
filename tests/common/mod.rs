//! Common test utilities for client integration tests
//!
//! Provides an in-process HandlerSocket server with in-memory tables, plus
//! helpers for building clients against it and waiting on pool state.

#![allow(dead_code)]

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use handlersocket::protocol::{
    decode_request, encode_error, encode_response, next_frame, Field, FindOperator,
    ModifyOperation, Request, WireResponse, MAX_FRAME_SIZE,
};
use handlersocket::{BackoffPolicy, HsClient, HsClientBuilder, HsResult};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

pub const DB: &str = "test";
pub const TABLE: &str = "test_user";
pub const USER_COLUMNS: [&str; 4] = ["user_id", "user_name", "user_email", "age"];

type Row = HashMap<String, Field>;

#[derive(Default)]
struct Table {
    /// index name -> key columns
    indexes: HashMap<String, Vec<String>>,
    rows: Vec<Row>,
}

#[derive(Clone)]
struct OpenedIndex {
    table: (String, String),
    key_columns: Vec<String>,
    columns: Vec<String>,
}

#[derive(Default)]
struct Stats {
    accepted: AtomicUsize,
    active: AtomicUsize,
    requests: AtomicUsize,
    opens: AtomicUsize,
}

struct Shared {
    tables: Mutex<HashMap<(String, String), Table>>,
    stats: Stats,
    auth_key: Option<String>,
    delay_ms: AtomicU64,
    slow_opens: AtomicUsize,
    slow_open_ms: AtomicU64,
}

struct ActiveGuard(Arc<Shared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// HandlerSocket look-alike listening on 127.0.0.1
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    listener: Mutex<Option<AbortHandle>>,
    connections: Arc<Mutex<Vec<AbortHandle>>>,
}

impl MockServer {
    /// Server with the `test.test_user` table and its two indexes
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Server that rejects every request until `A 1 key` is sent
    pub async fn with_auth(key: &str) -> Self {
        Self::start_with(Some(key.to_string())).await
    }

    async fn start_with(auth_key: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");

        let server = Self {
            addr,
            shared: Arc::new(Shared {
                tables: Mutex::new(HashMap::new()),
                stats: Stats::default(),
                auth_key,
                delay_ms: AtomicU64::new(0),
                slow_opens: AtomicUsize::new(0),
                slow_open_ms: AtomicU64::new(0),
            }),
            listener: Mutex::new(None),
            connections: Arc::new(Mutex::new(Vec::new())),
        };
        server.define_table(
            DB,
            TABLE,
            &[
                ("PRIMARY", &["user_id"]),
                ("NAME_MAIL_INDEX", &["user_name", "user_email"]),
            ],
        );
        server.accept_on(listener);
        server
    }

    pub fn define_table(&self, db: &str, table: &str, indexes: &[(&str, &[&str])]) {
        let mut tables = self.shared.tables.lock();
        let entry = tables
            .entry((db.to_string(), table.to_string()))
            .or_default();
        for (name, columns) in indexes {
            entry.indexes.insert(
                name.to_string(),
                columns.iter().map(|c| c.to_string()).collect(),
            );
        }
    }

    fn accept_on(&self, listener: TcpListener) {
        let shared = self.shared.clone();
        let connections = self.connections.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.stats.accepted.fetch_add(1, Ordering::SeqCst);
                shared.stats.active.fetch_add(1, Ordering::SeqCst);
                let guard = ActiveGuard(shared.clone());
                let task = tokio::spawn(async move {
                    let _ = serve(stream, &guard.0).await;
                });
                connections.lock().push(task.abort_handle());
            }
        });
        *self.listener.lock() = Some(handle.abort_handle());
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted since start
    pub fn accepted(&self) -> usize {
        self.shared.stats.accepted.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.shared.stats.active.load(Ordering::SeqCst)
    }

    /// Request lines received, auth and open requests included
    pub fn requests(&self) -> usize {
        self.shared.stats.requests.load(Ordering::SeqCst)
    }

    pub fn open_requests(&self) -> usize {
        self.shared.stats.opens.load(Ordering::SeqCst)
    }

    pub fn row_count(&self, db: &str, table: &str) -> usize {
        self.shared
            .tables
            .lock()
            .get(&(db.to_string(), table.to_string()))
            .map_or(0, |t| t.rows.len())
    }

    /// Hold every response back by `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.shared
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hold back the answers to the next `count` open-index requests only
    pub fn slow_next_opens(&self, count: usize, delay: Duration) {
        self.shared
            .slow_open_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self.shared.slow_opens.store(count, Ordering::SeqCst);
    }

    /// Close every client connection but keep accepting new ones
    pub fn drop_connections(&self) {
        for handle in self.connections.lock().drain(..) {
            handle.abort();
        }
    }

    /// Stop listening and close every connection
    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.drop_connections();
    }

    /// Listen again on the same port, keeping table contents
    pub async fn restart(&self) {
        self.stop();
        let mut attempts = 0;
        let listener = loop {
            match TcpListener::bind(self.addr).await {
                Ok(listener) => break listener,
                Err(_) if attempts < 50 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("cannot rebind {}: {}", self.addr, e),
            }
        };
        self.accept_on(listener);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(mut stream: TcpStream, shared: &Shared) -> HsResult<()> {
    let mut opened: HashMap<i32, OpenedIndex> = HashMap::new();
    let mut authed = shared.auth_key.is_none();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        while let Some(line) = next_frame(&mut buf, MAX_FRAME_SIZE)? {
            shared.stats.requests.fetch_add(1, Ordering::SeqCst);
            let mut delay = shared.delay_ms.load(Ordering::SeqCst);
            let reply = match decode_request(&line) {
                Ok(request) => {
                    if matches!(request, Request::OpenIndex { .. }) && take_slow_open(shared) {
                        delay += shared.slow_open_ms.load(Ordering::SeqCst);
                    }
                    respond(shared, &mut opened, &mut authed, request)
                }
                Err(_) => encode_error(2, "cmd"),
            };

            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            stream.write_all(&reply).await?;
        }
    }
}

fn take_slow_open(shared: &Shared) -> bool {
    shared
        .slow_opens
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn respond(
    shared: &Shared,
    opened: &mut HashMap<i32, OpenedIndex>,
    authed: &mut bool,
    request: Request,
) -> Vec<u8> {
    if let Request::Auth { key } = &request {
        return if shared.auth_key.as_deref().map_or(true, |k| k == key) {
            *authed = true;
            encode_response(&WireResponse::ack())
        } else {
            encode_error(3, "authfail")
        };
    }
    if !*authed {
        return encode_error(3, "unauth");
    }

    match request {
        Request::Auth { .. } => encode_response(&WireResponse::ack()),
        Request::OpenIndex {
            index_id,
            database,
            table,
            index_name,
            columns,
        } => {
            shared.stats.opens.fetch_add(1, Ordering::SeqCst);
            let tables = shared.tables.lock();
            let key = (database, table);
            let Some(key_columns) = tables.get(&key).and_then(|t| t.indexes.get(&index_name))
            else {
                return encode_error(2, "open_table");
            };
            opened.insert(
                index_id,
                OpenedIndex {
                    table: key.clone(),
                    key_columns: key_columns.clone(),
                    columns,
                },
            );
            encode_response(&WireResponse::ack())
        }
        Request::Insert { index_id, values } => {
            let Some(index) = opened.get(&index_id) else {
                return encode_error(2, "stmtnum");
            };
            let mut tables = shared.tables.lock();
            let table = tables.entry(index.table.clone()).or_default();
            let row: Row = index.columns.iter().cloned().zip(values).collect();
            table.rows.push(row);
            encode_response(&WireResponse::ack())
        }
        Request::Find {
            index_id,
            operator,
            keys,
            limit,
            offset,
        } => {
            let Some(index) = opened.get(&index_id) else {
                return encode_error(2, "stmtnum");
            };
            let tables = shared.tables.lock();
            let rows = tables.get(&index.table).map_or(Vec::new(), |table| {
                matching(table, index, operator, &keys, limit, offset)
                    .into_iter()
                    .map(|i| project(&table.rows[i], &index.columns))
                    .collect()
            });
            encode_response(&WireResponse::rows(index.columns.len(), rows))
        }
        Request::Modify {
            index_id,
            operator,
            keys,
            limit,
            offset,
            operation,
            values,
        } => {
            let Some(index) = opened.get(&index_id) else {
                return encode_error(2, "stmtnum");
            };
            let mut tables = shared.tables.lock();
            let Some(table) = tables.get_mut(&index.table) else {
                return encode_response(&WireResponse::count(0));
            };
            let mut hits = matching(table, index, operator, &keys, limit, offset);
            let count = hits.len() as u64;

            match operation {
                ModifyOperation::Delete => {
                    hits.sort_unstable_by(|a, b| b.cmp(a));
                    for i in hits {
                        table.rows.remove(i);
                    }
                }
                ModifyOperation::Update => {
                    for i in hits {
                        for (column, value) in index.columns.iter().zip(values.iter()) {
                            table.rows[i].insert(column.clone(), value.clone());
                        }
                    }
                }
                ModifyOperation::Increment | ModifyOperation::Decrement => {
                    let sign = if operation == ModifyOperation::Increment { 1 } else { -1 };
                    for i in hits {
                        for (column, delta) in index.columns.iter().zip(values.iter()) {
                            let delta: i64 = delta.as_deref().and_then(|d| d.parse().ok()).unwrap_or(0);
                            let current: i64 = table.rows[i]
                                .get(column)
                                .and_then(|v| v.as_deref())
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0);
                            table.rows[i].insert(
                                column.clone(),
                                Some((current + sign * delta).to_string()),
                            );
                        }
                    }
                }
            }
            encode_response(&WireResponse::count(count))
        }
    }
}

fn compare_field(a: &Field, b: &Field) -> CmpOrdering {
    match (a.as_deref(), b.as_deref()) {
        (Some(a), Some(b)) => match (a.parse::<i64>(), b.parse::<i64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        },
        (a, b) => a.cmp(&b),
    }
}

fn compare_key(row: &Row, key_columns: &[String], keys: &[Field]) -> CmpOrdering {
    for (column, key) in key_columns.iter().zip(keys) {
        let value = row.get(column).cloned().flatten();
        match compare_field(&value, key) {
            CmpOrdering::Equal => continue,
            other => return other,
        }
    }
    CmpOrdering::Equal
}

fn compare_rows(a: &Row, b: &Row, key_columns: &[String]) -> CmpOrdering {
    for column in key_columns {
        let left = a.get(column).cloned().flatten();
        let right = b.get(column).cloned().flatten();
        match compare_field(&left, &right) {
            CmpOrdering::Equal => continue,
            other => return other,
        }
    }
    CmpOrdering::Equal
}

/// Row positions matched by a find, in scan order, after offset and limit
fn matching(
    table: &Table,
    index: &OpenedIndex,
    operator: FindOperator,
    keys: &[Field],
    limit: u32,
    offset: u32,
) -> Vec<usize> {
    let mut hits: Vec<usize> = (0..table.rows.len())
        .filter(|&i| {
            let ord = compare_key(&table.rows[i], &index.key_columns, keys);
            match operator {
                FindOperator::Eq => ord == CmpOrdering::Equal,
                FindOperator::Gt => ord == CmpOrdering::Greater,
                FindOperator::Ge => ord != CmpOrdering::Less,
                FindOperator::Lt => ord == CmpOrdering::Less,
                FindOperator::Le => ord != CmpOrdering::Greater,
            }
        })
        .collect();

    hits.sort_by(|&a, &b| compare_rows(&table.rows[a], &table.rows[b], &index.key_columns));
    if matches!(operator, FindOperator::Lt | FindOperator::Le) {
        hits.reverse();
    }

    hits.into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect()
}

fn project(row: &Row, columns: &[String]) -> Vec<Field> {
    columns
        .iter()
        .map(|c| row.get(c).cloned().flatten())
        .collect()
}

// ============================================================================
// Client helpers
// ============================================================================

/// Backoff tuned for tests: retries every few milliseconds, forever
pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_ms: 10,
        max_ms: 50,
        multiplier: 2.0,
        max_attempts: None,
    }
}

pub fn builder(server: &MockServer, pool_size: usize) -> HsClientBuilder {
    HsClient::builder(&server.host(), server.port())
        .pool_size(pool_size)
        .connect_timeout(Duration::from_secs(2))
        .acquire_timeout(Duration::from_secs(5))
        .backoff(fast_backoff())
}

pub async fn client(server: &MockServer, pool_size: usize) -> HsClient {
    builder(server, pool_size)
        .build()
        .await
        .expect("client connects to mock server")
}

/// Open index 1 on `test.test_user` through NAME_MAIL_INDEX
pub async fn open_users(client: &HsClient) {
    client
        .open_index(1, DB, TABLE, "NAME_MAIL_INDEX", &USER_COLUMNS)
        .await
        .expect("open index 1");
}

/// Poll `condition` every 10ms, panicking after `timeout`
pub async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, condition: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
