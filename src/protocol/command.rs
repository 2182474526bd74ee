use super::types::{FindOperator, ModifyOperation, OperationKind};
use crate::registry::IndexDescriptor;

/// A single field on the wire. `None` is SQL NULL.
pub type Field = Option<String>;

/// One HandlerSocket request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Auth {
        key: String,
    },
    OpenIndex {
        index_id: i32,
        database: String,
        table: String,
        index_name: String,
        columns: Vec<String>,
    },
    Find {
        index_id: i32,
        operator: FindOperator,
        keys: Vec<Field>,
        limit: u32,
        offset: u32,
    },
    Insert {
        index_id: i32,
        values: Vec<Field>,
    },
    Modify {
        index_id: i32,
        operator: FindOperator,
        keys: Vec<Field>,
        limit: u32,
        offset: u32,
        operation: ModifyOperation,
        values: Vec<Field>,
    },
}

impl Request {
    pub fn open_index(descriptor: &IndexDescriptor) -> Self {
        Request::OpenIndex {
            index_id: descriptor.index_id,
            database: descriptor.database.clone(),
            table: descriptor.table.clone(),
            index_name: descriptor.index_name.clone(),
            columns: descriptor.columns.clone(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Request::Auth { .. } => OperationKind::Auth,
            Request::OpenIndex { .. } => OperationKind::OpenIndex,
            Request::Find { .. } => OperationKind::Find,
            Request::Insert { .. } => OperationKind::Insert,
            Request::Modify { operation, .. } => OperationKind::Modify(*operation),
        }
    }

    /// Index the request targets, if any
    pub fn index_id(&self) -> Option<i32> {
        match self {
            Request::Auth { .. } => None,
            Request::OpenIndex { index_id, .. }
            | Request::Find { index_id, .. }
            | Request::Insert { index_id, .. }
            | Request::Modify { index_id, .. } => Some(*index_id),
        }
    }
}

/// Wraps plain strings as non-NULL fields
pub(crate) fn fields<S: AsRef<str>>(values: &[S]) -> Vec<Field> {
    values.iter().map(|v| Some(v.as_ref().to_string())).collect()
}
