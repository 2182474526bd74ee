use std::sync::Arc;

use super::{FindOptions, HsClient, ResultSet};
use crate::error::HsResult;
use crate::protocol::FindOperator;
use crate::registry::IndexDescriptor;

impl HsClient {
    /// Bind `index_id` to an index and open it on every Ready session.
    ///
    /// Re-opening an id with the same descriptor sends the open again;
    /// binding it to a different one fails with
    /// [`crate::HsError::IndexConflict`]. Sessions that reconnect later open
    /// every registered index before serving.
    pub async fn open_index<S: AsRef<str>>(
        &self,
        index_id: i32,
        database: &str,
        table: &str,
        index_name: &str,
        columns: &[S],
    ) -> HsResult<bool> {
        let descriptor = IndexDescriptor::new(index_id, database, table, index_name, columns)?;
        self.pool.open_index(descriptor).await
    }

    /// Operations bound to one opened index
    pub fn index(&self, index_id: i32) -> HsResult<IndexSession> {
        let descriptor = self.pool.registry().describe(index_id)?;
        Ok(IndexSession {
            client: self.clone(),
            descriptor,
        })
    }
}

/// Handle over a single opened index, so callers stop repeating its id
#[derive(Clone)]
pub struct IndexSession {
    client: HsClient,
    descriptor: Arc<IndexDescriptor>,
}

impl IndexSession {
    pub fn id(&self) -> i32 {
        self.descriptor.index_id
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn client(&self) -> &HsClient {
        &self.client
    }

    pub async fn find<S: AsRef<str>>(&self, keys: &[S]) -> HsResult<ResultSet> {
        self.client.find(self.id(), keys).await
    }

    pub async fn find_with<S: AsRef<str>>(
        &self,
        keys: &[S],
        options: FindOptions,
    ) -> HsResult<ResultSet> {
        self.client.find_with(self.id(), keys, options).await
    }

    pub async fn insert<S: AsRef<str>>(&self, values: &[S]) -> HsResult<bool> {
        self.client.insert(self.id(), values).await
    }

    pub async fn update<S: AsRef<str>, T: AsRef<str>>(
        &self,
        keys: &[S],
        values: &[T],
        operator: FindOperator,
    ) -> HsResult<u64> {
        self.client.update(self.id(), keys, values, operator).await
    }

    pub async fn delete<S: AsRef<str>>(&self, keys: &[S], operator: FindOperator) -> HsResult<u64> {
        self.client.delete(self.id(), keys, operator).await
    }

    pub async fn increment<S: AsRef<str>, T: AsRef<str>>(
        &self,
        keys: &[S],
        deltas: &[T],
        operator: FindOperator,
    ) -> HsResult<u64> {
        self.client.increment(self.id(), keys, deltas, operator).await
    }

    pub async fn decrement<S: AsRef<str>, T: AsRef<str>>(
        &self,
        keys: &[S],
        deltas: &[T],
        operator: FindOperator,
    ) -> HsResult<u64> {
        self.client.decrement(self.id(), keys, deltas, operator).await
    }
}
