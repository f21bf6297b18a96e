use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use cqlmux_cql::frame::response::result::{Prepared, PreparedMetadata, ResultMetadata};
use cqlmux_cql::value::SerializedValues;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::errors::RequestAttemptError;
use crate::routing::PartitionKey;

/// A statement prepared on one node.
#[derive(Debug, Clone)]
pub struct PreparedHandle {
    id: Bytes,
    statement: String,
    node: SocketAddr,
    metadata: PreparedMetadata,
    result_metadata: Arc<ResultMetadata>,
}

impl PreparedHandle {
    pub(crate) fn new(statement: &str, node: SocketAddr, prepared: Prepared) -> Self {
        PreparedHandle {
            id: prepared.id,
            statement: statement.to_owned(),
            node,
            metadata: prepared.prepared_metadata,
            result_metadata: prepared.result_metadata,
        }
    }

    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// The node this handle is valid on.
    pub fn node(&self) -> SocketAddr {
        self.node
    }

    pub fn metadata(&self) -> &PreparedMetadata {
        &self.metadata
    }

    pub fn result_metadata(&self) -> &Arc<ResultMetadata> {
        &self.result_metadata
    }

    /// Number of bind markers in the statement.
    pub fn values_count(&self) -> usize {
        self.metadata.col_count
    }

    /// Picks the partition key out of the bound values, using the key
    /// indexes the node reported. `None` if the node reported none or a key
    /// component is missing or null.
    pub fn partition_key(&self, values: &SerializedValues) -> Option<PartitionKey> {
        if self.metadata.pk_indexes.is_empty() {
            return None;
        }
        let mut indexes = self.metadata.pk_indexes.clone();
        indexes.sort_by_key(|pk| pk.sequence);

        let mut key = PartitionKey::new();
        for pk in indexes {
            let component = values.get(pk.index as usize)??;
            key.push(Bytes::copy_from_slice(component));
        }
        Some(key)
    }
}

/// Prepared statements of every node, keyed by (statement text, node).
///
/// Concurrent callers asking for the same key share one PREPARE. Entries
/// are never evicted; a failed prepare leaves no entry behind.
#[derive(Debug, Default)]
pub(crate) struct PreparedStatementCache {
    entries: DashMap<(String, SocketAddr), Arc<OnceCell<Arc<PreparedHandle>>>>,
}

impl PreparedStatementCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub(crate) fn get(&self, node: SocketAddr, statement: &str) -> Option<Arc<PreparedHandle>> {
        self.entries
            .get(&(statement.to_owned(), node))
            .and_then(|cell| cell.get().cloned())
    }

    /// Returns the cached handle, or runs `prepare` to create it. While one
    /// caller prepares, others for the same key wait for its outcome.
    pub(crate) async fn get_or_prepare<F, Fut>(
        &self,
        node: SocketAddr,
        statement: &str,
        prepare: F,
    ) -> Result<Arc<PreparedHandle>, RequestAttemptError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PreparedHandle, RequestAttemptError>>,
    {
        // Clone the cell out; the shard lock must not be held across .await.
        let cell = self
            .entries
            .entry((statement.to_owned(), node))
            .or_default()
            .clone();

        cell.get_or_try_init(|| async move {
            debug!(node = %node, statement, "Prepared statement cache miss");
            prepare().await.map(Arc::new)
        })
        .await
        .cloned()
    }

    /// Forgets the handle of `statement` on `node`, after the node reported
    /// it does not know the id anymore.
    pub(crate) fn invalidate(&self, node: SocketAddr, statement: &str) {
        self.entries.remove(&(statement.to_owned(), node));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use cqlmux_cql::frame::response::result::PartitionKeyIndex;
    use cqlmux_cql::frame::response::error::DbError;

    use super::*;
    use crate::utils::test_utils::setup_tracing;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn handle(statement: &str, node: SocketAddr, pk: &[(u16, u16)], cols: usize) -> PreparedHandle {
        PreparedHandle {
            id: Bytes::from(format!("{}@{}", statement, node)),
            statement: statement.to_owned(),
            node,
            metadata: PreparedMetadata {
                flags: 0,
                col_count: cols,
                pk_indexes: pk
                    .iter()
                    .map(|&(index, sequence)| PartitionKeyIndex { index, sequence })
                    .collect(),
                col_specs: Vec::new(),
            },
            result_metadata: Arc::new(ResultMetadata::mock_empty()),
        }
    }

    #[tokio::test]
    async fn concurrent_prepares_share_one_call() {
        setup_tracing();
        let cache = PreparedStatementCache::new();
        let calls = AtomicUsize::new(0);
        let statement = "SELECT v FROM ks.t WHERE k = ?";

        let calls = &calls;
        let prepare = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(handle(statement, addr(9042), &[], 1))
        };
        let (a, b, c) = tokio::join!(
            cache.get_or_prepare(addr(9042), statement, prepare),
            cache.get_or_prepare(addr(9042), statement, prepare),
            cache.get_or_prepare(addr(9042), statement, prepare),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn each_node_gets_its_own_entry() {
        setup_tracing();
        let cache = PreparedStatementCache::new();
        let statement = "INSERT INTO ks.t (k, v) VALUES (?, ?)";

        let first = cache
            .get_or_prepare(addr(9042), statement, move || async move {
                Ok(handle(statement, addr(9042), &[], 2))
            })
            .await
            .unwrap();
        let second = cache
            .get_or_prepare(addr(9043), statement, move || async move {
                Ok(handle(statement, addr(9043), &[], 2))
            })
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert_ne!(first.id(), second.id());
        assert_eq!(cache.get(addr(9043), statement).unwrap().node(), addr(9043));
        assert!(cache.get(addr(9044), statement).is_none());
    }

    #[tokio::test]
    async fn failed_prepare_is_retried_by_the_next_caller() {
        setup_tracing();
        let cache = PreparedStatementCache::new();
        let statement = "SELECT * FROM ks.missing";

        let failed = cache
            .get_or_prepare(addr(9042), statement, move || async move {
                Err(RequestAttemptError::DbError(
                    DbError::Invalid,
                    "unconfigured table missing".to_owned(),
                ))
            })
            .await;
        assert_matches!(failed, Err(RequestAttemptError::DbError(DbError::Invalid, _)));
        assert_eq!(cache.len(), 0);

        let prepared = cache
            .get_or_prepare(addr(9042), statement, move || async move {
                Ok(handle(statement, addr(9042), &[], 0))
            })
            .await;
        assert!(prepared.is_ok());
        assert_eq!(cache.len(), 1);

        cache.invalidate(addr(9042), statement);
        assert!(cache.get(addr(9042), statement).is_none());
    }

    #[test]
    fn partition_key_follows_key_sequence() {
        let prepared = handle(
            "UPDATE ks.t SET v = ? WHERE b = ? AND a = ?",
            addr(9042),
            &[(2, 0), (1, 1)],
            3,
        );
        let mut values = SerializedValues::new();
        values.add_raw(Some(Bytes::from_static(b"value")));
        values.add_raw(Some(Bytes::from_static(b"bb")));
        values.add_raw(Some(Bytes::from_static(b"a")));

        let key = prepared.partition_key(&values).unwrap();
        assert_eq!(key.components(), &[Bytes::from_static(b"a"), Bytes::from_static(b"bb")]);

        let mut with_null = SerializedValues::new();
        with_null.add_raw(None);
        with_null.add_raw(None);
        with_null.add_raw(Some(Bytes::from_static(b"a")));
        assert!(prepared.partition_key(&with_null).is_none());

        let keyless = handle("SELECT * FROM ks.t", addr(9042), &[], 0);
        assert!(keyless.partition_key(&SerializedValues::new()).is_none());
    }
}
