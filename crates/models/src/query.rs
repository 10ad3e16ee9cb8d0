use crate::{ClusteringKey, DecoratedKey, Mutation, Partition};
use bytes::Bytes;
use std::collections::BTreeMap;

/// A single-partition read: which partition, and how much of it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReadCommand {
    pub keyspace: String,
    pub table: String,
    pub key: DecoratedKey,
    /// Read timestamp in microseconds; tombstones and liveness are judged
    /// against it.
    pub timestamp: i64,
    pub per_partition_limit: u32,
    pub row_limit: u32,
    pub partition_limit: u32,
}

impl ReadCommand {
    pub fn new(keyspace: &str, table: &str, key: DecoratedKey, timestamp: i64) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            key,
            timestamp,
            per_partition_limit: u32::MAX,
            row_limit: u32::MAX,
            partition_limit: 1,
        }
    }

    pub fn with_row_limit(mut self, limit: u32) -> Self {
        self.row_limit = limit;
        self
    }

    pub fn with_per_partition_limit(mut self, limit: u32) -> Self {
        self.per_partition_limit = limit;
        self
    }
}

/// Digest of a query result; replicas agree iff their digests are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResultDigest(pub [u8; 16]);

/// One live row of a query result, fully materialized.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResultRow {
    pub partition_key: Bytes,
    pub clustering_key: ClusteringKey,
    pub cells: BTreeMap<String, Bytes>,
}

/// Result of a data read at one replica.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct QueryResult {
    pub rows: Vec<ResultRow>,
    /// Highest write timestamp observed while building the result.
    pub last_modified: i64,
    /// The replica stopped early on a row or memory limit.
    pub short_read: bool,
}

impl QueryResult {
    /// Digest over the logical content, stable across replicas holding the
    /// same data.
    pub fn digest(&self) -> ResultDigest {
        let mut ctx = md5::Context::new();
        for row in &self.rows {
            ctx.consume(&row.partition_key);
            ctx.consume(&row.clustering_key);
            for (column, value) in &row.cells {
                ctx.consume(column.as_bytes());
                ctx.consume(value);
            }
        }
        ResultDigest(ctx.compute().0)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A partition as sent for mutation-level reconciliation, with the flags
/// the reconciler needs to reason about early termination.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReconcilablePartition {
    pub key: DecoratedKey,
    pub partition: Partition,
    pub live_row_count: u32,
    /// The replica exhausted this partition (no further rows exist there).
    pub reached_partition_end: bool,
}

/// Reply to a mutation-level read: raw partitions in ring order.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ReconcilableResult {
    pub partitions: Vec<ReconcilablePartition>,
    /// The replica exhausted every partition of the command's range.
    pub reached_end: bool,
    pub short_read: bool,
}

/// Flatten a reconciled partition into result rows, newest-limit aware.
pub fn rows_of(key: &DecoratedKey, partition: &Partition, limit: usize) -> Vec<ResultRow> {
    let mut out = Vec::new();
    for (ck, row) in &partition.rows {
        if !row.is_live(partition.tombstone) {
            continue;
        }
        let shade = row.tombstone.max(partition.tombstone);
        let cells = row
            .cells
            .iter()
            .filter_map(|(column, cell)| {
                let live = cell.value.is_some() && shade.map_or(true, |ts| cell.timestamp > ts);
                live.then(|| (column.clone(), cell.value.clone().unwrap()))
            })
            .collect();
        out.push(ResultRow {
            partition_key: key.key.clone(),
            clustering_key: ck.clone(),
            cells,
        });
        if out.len() >= limit {
            break;
        }
    }
    out
}

/// Convenience used by repair writes: wrap a partition diff as a mutation.
pub fn repair_mutation(command: &ReadCommand, key: DecoratedKey, diff: Partition) -> Mutation {
    Mutation {
        keyspace: command.keyspace.clone(),
        table: command.table.clone(),
        key,
        partition: diff,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Cell, Row};
    use partition::Token;

    fn result(rows: &[(&str, &str)]) -> QueryResult {
        QueryResult {
            rows: rows
                .iter()
                .map(|(ck, v)| ResultRow {
                    partition_key: Bytes::from_static(b"pk"),
                    clustering_key: Bytes::copy_from_slice(ck.as_bytes()),
                    cells: BTreeMap::from([("v".to_string(), Bytes::copy_from_slice(v.as_bytes()))]),
                })
                .collect(),
            last_modified: 1,
            short_read: false,
        }
    }

    #[test]
    fn equal_content_equal_digest() {
        assert_eq!(result(&[("a", "1")]).digest(), result(&[("a", "1")]).digest());
        assert_ne!(result(&[("a", "1")]).digest(), result(&[("a", "2")]).digest());
        assert_ne!(
            result(&[("a", "1")]).digest(),
            result(&[("a", "1"), ("b", "2")]).digest()
        );
    }

    #[test]
    fn rows_of_skips_dead_rows_and_honors_limit() {
        let key = DecoratedKey::new(Token::from_u64(1), "pk".as_bytes().to_vec());
        let partition = Partition::default()
            .with_row(
                Bytes::from_static(b"a"),
                Row::default().with_cell("v", Cell::live(1, "x")),
            )
            .with_row(
                Bytes::from_static(b"b"),
                Row::default().with_cell("v", Cell::tombstone(2)),
            )
            .with_row(
                Bytes::from_static(b"c"),
                Row::default().with_cell("v", Cell::live(3, "y")),
            );

        let rows = rows_of(&key, &partition, 10);
        assert_eq!(rows.len(), 2);

        let rows = rows_of(&key, &partition, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].clustering_key, Bytes::from_static(b"a"));
    }
}
