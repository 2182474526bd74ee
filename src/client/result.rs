use std::str::FromStr;
use std::sync::Arc;

use crate::error::{HsError, HsResult};
use crate::protocol::Field;

/// One row returned by a find, in the column order the index was opened with.
///
/// Values are text. Column bytes that are not valid UTF-8 (latin1 data,
/// binary blobs) come back with U+FFFD in place of the invalid sequences, so
/// such columns do not round trip; use a UTF-8 connection charset on the
/// server for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Field>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Field] {
        &self.values
    }

    /// Value at a 0-based position; `None` for NULL or out of range
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn get_by_name(&self, name: &str) -> Option<&str> {
        self.position(name).and_then(|i| self.get(i))
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    /// Parse the value at `index`, e.g. `row.parse::<i64>(3)`
    pub fn parse<T: FromStr>(&self, index: usize) -> HsResult<T> {
        let raw = match self.values.get(index) {
            None => {
                return Err(HsError::invalid(format!(
                    "column {} out of range for a row of {}",
                    index,
                    self.values.len()
                )))
            }
            Some(None) => return Err(HsError::invalid(format!("column {} is NULL", index))),
            Some(Some(raw)) => raw,
        };
        raw.parse::<T>()
            .map_err(|_| HsError::invalid(format!("cannot parse column {} value '{}'", index, raw)))
    }

    pub fn parse_by_name<T: FromStr>(&self, name: &str) -> HsResult<T> {
        let index = self
            .position(name)
            .ok_or_else(|| HsError::invalid(format!("no column named '{}'", name)))?;
        self.parse(index)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Rows of one find response, handed out one at a time
#[derive(Debug)]
pub struct ResultSet {
    columns: Arc<[String]>,
    rows: std::vec::IntoIter<Vec<Field>>,
}

impl ResultSet {
    pub(crate) fn new(columns: &[String], rows: Vec<Vec<Field>>) -> Self {
        Self {
            columns: columns.into(),
            rows: rows.into_iter(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows not yet consumed
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.len() == 0
    }
}

impl Iterator for ResultSet {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next().map(|values| Row {
            columns: self.columns.clone(),
            values,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for ResultSet {}
