//! Line codec for the HandlerSocket text protocol.
//!
//! A frame is one line: tokens separated by TAB and terminated by LF. Bytes
//! `0x00..=0x0f` inside a token are written as `0x01` followed by the byte
//! plus `0x40`, so TAB and LF never appear inside a token. A token holding a
//! single `0x00` byte is NULL.

use super::command::{Field, Request};
use super::response::{ResponseBody, WireResponse};
use super::types::{FindOperator, ModifyOperation, ResponseShape};
use crate::error::{HsError, HsResult};

pub const TOKEN_SEPARATOR: u8 = b'\t';
pub const FRAME_TERMINATOR: u8 = b'\n';
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const ESCAPE_PREFIX: u8 = 0x01;
const ESCAPE_SHIFT: u8 = 0x40;
const NULL_TOKEN: u8 = 0x00;

/// Encode a request as a complete, LF-terminated frame
pub fn encode_request(request: &Request) -> HsResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);

    match request {
        Request::Auth { key } => {
            buf.push(b'A');
            push_raw(&mut buf, b"1");
            push_field(&mut buf, Some(key.as_str()));
        }
        Request::OpenIndex {
            index_id,
            database,
            table,
            index_name,
            columns,
        } => {
            if let Some(bad) = columns.iter().find(|c| c.contains(',')) {
                return Err(HsError::invalid(format!(
                    "column name '{}' must not contain ','",
                    bad
                )));
            }
            buf.push(b'P');
            push_raw(&mut buf, index_id.to_string().as_bytes());
            push_field(&mut buf, Some(database.as_str()));
            push_field(&mut buf, Some(table.as_str()));
            push_field(&mut buf, Some(index_name.as_str()));
            push_field(&mut buf, Some(columns.join(",").as_str()));
        }
        Request::Find {
            index_id,
            operator,
            keys,
            limit,
            offset,
        } => {
            push_find_prefix(&mut buf, *index_id, *operator, keys, *limit, *offset);
        }
        Request::Insert { index_id, values } => {
            buf.extend_from_slice(index_id.to_string().as_bytes());
            push_raw(&mut buf, b"+");
            push_fields(&mut buf, values);
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
            push_find_prefix(&mut buf, *index_id, *operator, keys, *limit, *offset);
            push_raw(&mut buf, operation.as_str().as_bytes());
            for value in values {
                push_field(&mut buf, value.as_deref());
            }
        }
    }

    buf.push(FRAME_TERMINATOR);

    if buf.len() > MAX_FRAME_SIZE {
        return Err(HsError::invalid(format!(
            "request of {} bytes exceeds the {} byte frame limit",
            buf.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(buf)
}

fn push_find_prefix(
    buf: &mut Vec<u8>,
    index_id: i32,
    operator: FindOperator,
    keys: &[Field],
    limit: u32,
    offset: u32,
) {
    buf.extend_from_slice(index_id.to_string().as_bytes());
    push_raw(buf, operator.as_str().as_bytes());
    push_fields(buf, keys);
    push_raw(buf, limit.to_string().as_bytes());
    push_raw(buf, offset.to_string().as_bytes());
}

/// Writes `<n> <f1> ... <fn>`
fn push_fields(buf: &mut Vec<u8>, fields: &[Field]) {
    push_raw(buf, fields.len().to_string().as_bytes());
    for field in fields {
        push_field(buf, field.as_deref());
    }
}

fn push_raw(buf: &mut Vec<u8>, token: &[u8]) {
    buf.push(TOKEN_SEPARATOR);
    buf.extend_from_slice(token);
}

fn push_field(buf: &mut Vec<u8>, field: Option<&str>) {
    buf.push(TOKEN_SEPARATOR);
    match field {
        None => buf.push(NULL_TOKEN),
        Some(value) => escape_into(buf, value.as_bytes()),
    }
}

fn escape_into(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b < 0x10 {
            buf.push(ESCAPE_PREFIX);
            buf.push(b + ESCAPE_SHIFT);
        } else {
            buf.push(b);
        }
    }
}

/// Decode a single escaped token back into a field.
///
/// Invalid UTF-8 is replaced with U+FFFD rather than rejected.
pub fn unescape(token: &[u8]) -> HsResult<Field> {
    if token == [NULL_TOKEN] {
        return Ok(None);
    }

    let mut out = Vec::with_capacity(token.len());
    let mut iter = token.iter();
    while let Some(&b) = iter.next() {
        match b {
            ESCAPE_PREFIX => match iter.next() {
                Some(&next) if (ESCAPE_SHIFT..ESCAPE_SHIFT + 0x10).contains(&next) => {
                    out.push(next - ESCAPE_SHIFT)
                }
                Some(&next) => {
                    return Err(HsError::frame(format!(
                        "invalid escape sequence 0x01 0x{:02x}",
                        next
                    )))
                }
                None => return Err(HsError::frame("dangling escape byte at end of token")),
            },
            b if b < 0x10 => {
                return Err(HsError::frame(format!(
                    "unescaped control byte 0x{:02x} in token",
                    b
                )))
            }
            b => out.push(b),
        }
    }

    Ok(Some(String::from_utf8_lossy(&out).into_owned()))
}

/// Split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still partial. The returned line
/// does not include the terminator.
pub fn next_frame(buf: &mut Vec<u8>, max_frame_size: usize) -> HsResult<Option<Vec<u8>>> {
    match buf.iter().position(|&b| b == FRAME_TERMINATOR) {
        Some(pos) => {
            if pos > max_frame_size {
                return Err(HsError::frame(format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    pos, max_frame_size
                )));
            }
            let mut line: Vec<u8> = buf.drain(..=pos).collect();
            line.pop();
            Ok(Some(line))
        }
        None if buf.len() > max_frame_size => Err(HsError::frame(format!(
            "no frame terminator within {} bytes",
            max_frame_size
        ))),
        None => Ok(None),
    }
}

fn parse_number<T: std::str::FromStr>(token: &[u8], what: &str) -> HsResult<T> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .ok_or_else(|| {
            HsError::frame(format!(
                "expected {} but got '{}'",
                what,
                String::from_utf8_lossy(token)
            ))
        })
}

/// Decode one response line according to the shape its request expects.
///
/// A non-zero status becomes [`HsError::Server`]; anything that does not
/// parse becomes [`HsError::Frame`].
pub fn decode_response(line: &[u8], shape: ResponseShape) -> HsResult<WireResponse> {
    let mut tokens = line.split(|&b| b == TOKEN_SEPARATOR);

    let status: i32 = match tokens.next() {
        Some(t) if !t.is_empty() => parse_number(t, "a status code")?,
        _ => return Err(HsError::frame("empty response line")),
    };
    let columns: usize = match tokens.next() {
        Some(t) => parse_number(t, "a column count")?,
        None => return Err(HsError::frame("response truncated after status code")),
    };

    let rest = tokens.map(unescape).collect::<HsResult<Vec<Field>>>()?;

    if status != 0 {
        let message = rest.into_iter().flatten().collect::<Vec<_>>().join(" ");
        let message = if message.is_empty() {
            format!("error code {}", status)
        } else {
            message
        };
        return Err(HsError::Server {
            code: status,
            message,
        });
    }

    let body = match shape {
        ResponseShape::Ack => ResponseBody::Ack,
        ResponseShape::Count => match rest.as_slice() {
            [Some(n)] => ResponseBody::Count(parse_number(n.as_bytes(), "an affected-row count")?),
            _ => {
                return Err(HsError::frame(format!(
                    "expected a single count field, got {} fields",
                    rest.len()
                )))
            }
        },
        ResponseShape::Rows => {
            if columns == 0 {
                if !rest.is_empty() {
                    return Err(HsError::frame("fields present in a zero-column response"));
                }
                ResponseBody::Rows(Vec::new())
            } else if rest.len() % columns != 0 {
                return Err(HsError::frame(format!(
                    "{} fields do not divide into rows of {} columns",
                    rest.len(),
                    columns
                )));
            } else {
                ResponseBody::Rows(rest.chunks(columns).map(|row| row.to_vec()).collect())
            }
        }
    };

    Ok(WireResponse {
        status,
        columns,
        body,
    })
}

/// Encode a successful response line (server side)
pub fn encode_response(response: &WireResponse) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(response.status.to_string().as_bytes());
    match &response.body {
        ResponseBody::Ack => push_raw(&mut buf, b"1"),
        ResponseBody::Count(n) => {
            push_raw(&mut buf, b"1");
            push_raw(&mut buf, n.to_string().as_bytes());
        }
        ResponseBody::Rows(rows) => {
            push_raw(&mut buf, response.columns.to_string().as_bytes());
            for field in rows.iter().flatten() {
                push_field(&mut buf, field.as_deref());
            }
        }
    }
    buf.push(FRAME_TERMINATOR);
    buf
}

/// Encode an error response line (server side)
pub fn encode_error(code: i32, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + message.len());
    buf.extend_from_slice(code.to_string().as_bytes());
    push_raw(&mut buf, b"1");
    push_field(&mut buf, Some(message));
    buf.push(FRAME_TERMINATOR);
    buf
}

/// Decode a request line (server side)
pub fn decode_request(line: &[u8]) -> HsResult<Request> {
    let tokens: Vec<&[u8]> = line.split(|&b| b == TOKEN_SEPARATOR).collect();
    let text = |i: usize, what: &str| -> HsResult<String> {
        let token = tokens
            .get(i)
            .ok_or_else(|| HsError::frame(format!("request truncated before {}", what)))?;
        unescape(token)?.ok_or_else(|| HsError::frame(format!("{} must not be NULL", what)))
    };

    match tokens.first().copied() {
        Some(b"P") => Ok(Request::OpenIndex {
            index_id: parse_number(tokens.get(1).copied().unwrap_or_default(), "an index id")?,
            database: text(2, "database")?,
            table: text(3, "table")?,
            index_name: text(4, "index name")?,
            columns: text(5, "columns")?
                .split(',')
                .map(str::to_string)
                .collect(),
        }),
        Some(b"A") => Ok(Request::Auth {
            key: text(2, "auth key")?,
        }),
        Some(id) => {
            let index_id: i32 = parse_number(id, "an index id")?;
            let op = text(1, "operator")?;
            let count: usize = parse_number(tokens.get(2).copied().unwrap_or_default(), "a field count")?;
            let end = 3 + count;
            if tokens.len() < end {
                return Err(HsError::frame("request truncated inside field list"));
            }
            let values = tokens[3..end]
                .iter()
                .map(|t| unescape(t))
                .collect::<HsResult<Vec<Field>>>()?;

            if op == "+" {
                return Ok(Request::Insert { index_id, values });
            }

            let operator: FindOperator = op.parse().map_err(|_| HsError::frame(format!("unknown operator '{}'", op)))?;
            let limit = match tokens.get(end) {
                Some(t) => parse_number(t, "a limit")?,
                None => 1,
            };
            let offset = match tokens.get(end + 1) {
                Some(t) => parse_number(t, "an offset")?,
                None => 0,
            };

            let operation = match tokens.get(end + 2).copied() {
                None => {
                    return Ok(Request::Find {
                        index_id,
                        operator,
                        keys: values,
                        limit,
                        offset,
                    })
                }
                Some(b"U") => ModifyOperation::Update,
                Some(b"D") => ModifyOperation::Delete,
                Some(b"+") => ModifyOperation::Increment,
                Some(b"-") => ModifyOperation::Decrement,
                Some(other) => {
                    return Err(HsError::frame(format!(
                        "unknown modify operation '{}'",
                        String::from_utf8_lossy(other)
                    )))
                }
            };
            let new_values = tokens[end + 3..]
                .iter()
                .map(|t| unescape(t))
                .collect::<HsResult<Vec<Field>>>()?;

            Ok(Request::Modify {
                index_id,
                operator,
                keys: values,
                limit,
                offset,
                operation,
                values: new_values,
            })
        }
        None => Err(HsError::frame("empty request line")),
    }
}
