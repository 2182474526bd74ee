use super::command::Field;
use crate::error::{HsError, HsResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Ack,
    Count(u64),
    Rows(Vec<Vec<Field>>),
}

/// A decoded, successful response line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub status: i32,
    pub columns: usize,
    pub body: ResponseBody,
}

impl WireResponse {
    pub fn ack() -> Self {
        Self {
            status: 0,
            columns: 1,
            body: ResponseBody::Ack,
        }
    }

    pub fn count(count: u64) -> Self {
        Self {
            status: 0,
            columns: 1,
            body: ResponseBody::Count(count),
        }
    }

    pub fn rows(columns: usize, rows: Vec<Vec<Field>>) -> Self {
        Self {
            status: 0,
            columns,
            body: ResponseBody::Rows(rows),
        }
    }

    /// Number of rows carried, or the affected-row count for modifications
    pub fn row_count(&self) -> u64 {
        match &self.body {
            ResponseBody::Ack => 0,
            ResponseBody::Count(n) => *n,
            ResponseBody::Rows(rows) => rows.len() as u64,
        }
    }

    pub(crate) fn into_rows(self) -> HsResult<Vec<Vec<Field>>> {
        match self.body {
            ResponseBody::Rows(rows) => Ok(rows),
            other => Err(HsError::frame(format!("expected rows, got {:?}", other))),
        }
    }

    pub(crate) fn into_count(self) -> HsResult<u64> {
        match self.body {
            ResponseBody::Count(n) => Ok(n),
            other => Err(HsError::frame(format!("expected a count, got {:?}", other))),
        }
    }
}
