use super::{HsClient, ResultSet};
use crate::error::{HsError, HsResult};
use crate::protocol::command::fields;
use crate::protocol::{Field, FindOperator, ModifyOperation, Request};

/// Comparison, limit and offset applied by find and the modifying operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindOptions {
    pub operator: FindOperator,
    pub limit: u32,
    pub offset: u32,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            operator: FindOperator::Eq,
            limit: 1,
            offset: 0,
        }
    }
}

impl FindOptions {
    pub fn new(operator: FindOperator) -> Self {
        Self {
            operator,
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

fn check_keys(keys: &[Field]) -> HsResult<()> {
    if keys.is_empty() {
        return Err(HsError::invalid("at least one key value is required"));
    }
    Ok(())
}

// Extra trailing values are left to the server, which stores the opened
// columns and ignores the rest.
fn check_values(values: &[Field]) -> HsResult<()> {
    if values.is_empty() {
        return Err(HsError::invalid("at least one value is required"));
    }
    Ok(())
}

impl HsClient {
    /// Insert one row. `values` follow the column order of the opened index.
    pub async fn insert<S: AsRef<str>>(&self, index_id: i32, values: &[S]) -> HsResult<bool> {
        self.insert_fields(index_id, fields(values)).await
    }

    /// Insert one row where `None` stands for NULL
    pub async fn insert_fields(&self, index_id: i32, values: Vec<Field>) -> HsResult<bool> {
        self.pool.registry().describe(index_id)?;
        check_values(&values)?;
        self.execute(Request::Insert { index_id, values }).await?;
        Ok(true)
    }

    /// Rows whose index key equals `keys`, at most one by default
    pub async fn find<S: AsRef<str>>(&self, index_id: i32, keys: &[S]) -> HsResult<ResultSet> {
        self.find_with(index_id, keys, FindOptions::default()).await
    }

    pub async fn find_with<S: AsRef<str>>(
        &self,
        index_id: i32,
        keys: &[S],
        options: FindOptions,
    ) -> HsResult<ResultSet> {
        let descriptor = self.pool.registry().describe(index_id)?;
        let keys = fields(keys);
        check_keys(&keys)?;

        let response = self
            .execute(Request::Find {
                index_id,
                operator: options.operator,
                keys,
                limit: options.limit,
                offset: options.offset,
            })
            .await?;
        Ok(ResultSet::new(&descriptor.columns, response.into_rows()?))
    }

    /// Replace the matched row with `values`; returns the affected row count
    pub async fn update<S: AsRef<str>, T: AsRef<str>>(
        &self,
        index_id: i32,
        keys: &[S],
        values: &[T],
        operator: FindOperator,
    ) -> HsResult<u64> {
        self.update_with(index_id, keys, values, FindOptions::new(operator))
            .await
    }

    pub async fn update_with<S: AsRef<str>, T: AsRef<str>>(
        &self,
        index_id: i32,
        keys: &[S],
        values: &[T],
        options: FindOptions,
    ) -> HsResult<u64> {
        self.modify(index_id, keys, ModifyOperation::Update, fields(values), options)
            .await
    }

    /// Delete the matched row; returns the affected row count
    pub async fn delete<S: AsRef<str>>(
        &self,
        index_id: i32,
        keys: &[S],
        operator: FindOperator,
    ) -> HsResult<u64> {
        self.delete_with(index_id, keys, FindOptions::new(operator))
            .await
    }

    pub async fn delete_with<S: AsRef<str>>(
        &self,
        index_id: i32,
        keys: &[S],
        options: FindOptions,
    ) -> HsResult<u64> {
        self.modify(index_id, keys, ModifyOperation::Delete, Vec::new(), options)
            .await
    }

    /// Add `deltas` to the numeric columns of the matched row
    pub async fn increment<S: AsRef<str>, T: AsRef<str>>(
        &self,
        index_id: i32,
        keys: &[S],
        deltas: &[T],
        operator: FindOperator,
    ) -> HsResult<u64> {
        self.modify(
            index_id,
            keys,
            ModifyOperation::Increment,
            fields(deltas),
            FindOptions::new(operator),
        )
        .await
    }

    /// Subtract `deltas` from the numeric columns of the matched row
    pub async fn decrement<S: AsRef<str>, T: AsRef<str>>(
        &self,
        index_id: i32,
        keys: &[S],
        deltas: &[T],
        operator: FindOperator,
    ) -> HsResult<u64> {
        self.modify(
            index_id,
            keys,
            ModifyOperation::Decrement,
            fields(deltas),
            FindOptions::new(operator),
        )
        .await
    }

    async fn modify<S: AsRef<str>>(
        &self,
        index_id: i32,
        keys: &[S],
        operation: ModifyOperation,
        values: Vec<Field>,
        options: FindOptions,
    ) -> HsResult<u64> {
        self.pool.registry().describe(index_id)?;
        let keys = fields(keys);
        check_keys(&keys)?;
        if operation != ModifyOperation::Delete {
            check_values(&values)?;
        }

        let response = self
            .execute(Request::Modify {
                index_id,
                operator: options.operator,
                keys,
                limit: options.limit,
                offset: options.offset,
                operation,
                values,
            })
            .await?;
        response.into_count()
    }
}
