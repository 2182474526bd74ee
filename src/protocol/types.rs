use std::fmt;
use std::str::FromStr;

use crate::error::HsError;

/// Comparison applied between the supplied key values and the index columns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FindOperator {
    #[default]
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl FindOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindOperator::Eq => "=",
            FindOperator::Gt => ">",
            FindOperator::Ge => ">=",
            FindOperator::Lt => "<",
            FindOperator::Le => "<=",
        }
    }
}

impl fmt::Display for FindOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FindOperator {
    type Err = HsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" | "eq" => Ok(FindOperator::Eq),
            ">" | "gt" => Ok(FindOperator::Gt),
            ">=" | "ge" => Ok(FindOperator::Ge),
            "<" | "lt" => Ok(FindOperator::Lt),
            "<=" | "le" => Ok(FindOperator::Le),
            other => Err(HsError::invalid(format!("unknown find operator '{}'", other))),
        }
    }
}

/// Modification applied to the rows matched by a find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Update,
    Delete,
    Increment,
    Decrement,
}

impl ModifyOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifyOperation::Update => "U",
            ModifyOperation::Delete => "D",
            ModifyOperation::Increment => "+",
            ModifyOperation::Decrement => "-",
        }
    }
}

/// Request kinds, used for logging and to pick the expected response shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Auth,
    OpenIndex,
    Find,
    Insert,
    Modify(ModifyOperation),
}

impl OperationKind {
    pub fn response_shape(&self) -> ResponseShape {
        match self {
            OperationKind::Auth | OperationKind::OpenIndex | OperationKind::Insert => {
                ResponseShape::Ack
            }
            OperationKind::Find => ResponseShape::Rows,
            OperationKind::Modify(_) => ResponseShape::Count,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Auth => f.write_str("auth"),
            OperationKind::OpenIndex => f.write_str("open_index"),
            OperationKind::Find => f.write_str("find"),
            OperationKind::Insert => f.write_str("insert"),
            OperationKind::Modify(ModifyOperation::Update) => f.write_str("update"),
            OperationKind::Modify(ModifyOperation::Delete) => f.write_str("delete"),
            OperationKind::Modify(ModifyOperation::Increment) => f.write_str("increment"),
            OperationKind::Modify(ModifyOperation::Decrement) => f.write_str("decrement"),
        }
    }
}

/// What a successful response line is expected to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Status only; any trailing fields are ignored
    Ack,
    /// A single affected-row count
    Count,
    /// `numcolumns`-wide rows, flattened
    Rows,
}
