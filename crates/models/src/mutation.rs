use bytes::Bytes;
use partition::Token;
use std::collections::BTreeMap;

/// A partition key paired with its ring token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: Bytes,
}

impl DecoratedKey {
    pub fn new(token: Token, key: impl Into<Bytes>) -> Self {
        Self {
            token,
            key: key.into(),
        }
    }
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub type ClusteringKey = Bytes;

/// A named column value with its write timestamp. `value: None` is a cell
/// tombstone.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Cell {
    pub timestamp: i64,
    pub value: Option<Bytes>,
}

impl Cell {
    pub fn live(timestamp: i64, value: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            value: Some(value.into()),
        }
    }

    pub fn tombstone(timestamp: i64) -> Self {
        Self {
            timestamp,
            value: None,
        }
    }

    // Later timestamp wins; on a tie the tombstone shades the value, and
    // equal-liveness ties break on the value bytes for determinism.
    fn supersedes(&self, other: &Cell) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match (&self.value, &other.value) {
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (a, b) => a > b,
            },
        }
    }
}

/// Clustered row: cells keyed by column name, plus an optional row-level
/// deletion timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Row {
    pub tombstone: Option<i64>,
    pub cells: BTreeMap<String, Cell>,
}

impl Row {
    pub fn with_cell(mut self, column: &str, cell: Cell) -> Self {
        self.cells.insert(column.to_string(), cell);
        self
    }

    fn apply(&mut self, other: &Row) {
        self.tombstone = self.tombstone.max(other.tombstone);
        for (column, cell) in &other.cells {
            match self.cells.get_mut(column) {
                Some(existing) if !cell.supersedes(existing) => {}
                Some(existing) => *existing = cell.clone(),
                None => {
                    self.cells.insert(column.clone(), cell.clone());
                }
            }
        }
    }

    /// A row is live when at least one cell survives every shading
    /// tombstone.
    pub fn is_live(&self, partition_tombstone: Option<i64>) -> bool {
        let shade = self.tombstone.max(partition_tombstone);
        self.cells.values().any(|c| {
            c.value.is_some() && shade.map_or(true, |ts| c.timestamp > ts)
        })
    }

    pub fn max_timestamp(&self) -> i64 {
        self.cells
            .values()
            .map(|c| c.timestamp)
            .chain(self.tombstone)
            .max()
            .unwrap_or(i64::MIN)
    }
}

/// All writes to one partition: an optional partition-level deletion and
/// clustered rows in clustering order.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Partition {
    pub tombstone: Option<i64>,
    pub rows: BTreeMap<ClusteringKey, Row>,
}

impl Partition {
    pub fn with_row(mut self, clustering: impl Into<ClusteringKey>, row: Row) -> Self {
        self.rows.insert(clustering.into(), row);
        self
    }

    /// Merge `other` into `self` cell-by-cell.
    pub fn apply(&mut self, other: &Partition) {
        self.tombstone = self.tombstone.max(other.tombstone);
        for (ck, row) in &other.rows {
            self.rows.entry(ck.clone()).or_default().apply(row);
        }
    }

    pub fn live_row_count(&self) -> usize {
        self.rows
            .values()
            .filter(|r| r.is_live(self.tombstone))
            .count()
    }

    /// Clustering key of the last live row, if any.
    pub fn last_live_clustering(&self) -> Option<&ClusteringKey> {
        self.rows
            .iter()
            .rev()
            .find(|(_, r)| r.is_live(self.tombstone))
            .map(|(ck, _)| ck)
    }

    pub fn max_timestamp(&self) -> i64 {
        self.rows
            .values()
            .map(Row::max_timestamp)
            .chain(self.tombstone)
            .max()
            .unwrap_or(i64::MIN)
    }

    /// What `self` holds that `other` is missing or holds stale: the
    /// partition to write to bring `other` up to date, or `None` when
    /// `other` already covers `self`.
    pub fn difference(&self, other: &Partition) -> Option<Partition> {
        let mut out = Partition::default();
        if self.tombstone > other.tombstone {
            out.tombstone = self.tombstone;
        }
        for (ck, row) in &self.rows {
            let their_row = other.rows.get(ck);
            let mut missing = Row {
                tombstone: (row.tombstone > their_row.and_then(|r| r.tombstone))
                    .then_some(row.tombstone)
                    .flatten(),
                cells: BTreeMap::new(),
            };
            for (column, cell) in &row.cells {
                let theirs = their_row.and_then(|r| r.cells.get(column));
                if theirs.map_or(true, |t| cell.supersedes(t)) {
                    missing.cells.insert(column.clone(), cell.clone());
                }
            }
            if missing.tombstone.is_some() || !missing.cells.is_empty() {
                out.rows.insert(ck.clone(), missing);
            }
        }
        (out.tombstone.is_some() || !out.rows.is_empty()).then_some(out)
    }

    /// Approximate wire footprint, used for memory accounting.
    pub fn serialized_size(&self) -> usize {
        let mut size = 16;
        for (ck, row) in &self.rows {
            size += ck.len() + 16;
            for (column, cell) in &row.cells {
                size += column.len() + 16 + cell.value.as_ref().map_or(0, |v| v.len());
            }
        }
        size
    }
}

/// A write against one partition of one table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Mutation {
    pub keyspace: String,
    pub table: String,
    pub key: DecoratedKey,
    pub partition: Partition,
}

impl Mutation {
    pub fn serialized_size(&self) -> usize {
        self.keyspace.len() + self.table.len() + self.key.key.len() + self.partition.serialized_size()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ck(s: &str) -> ClusteringKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn later_timestamp_wins() {
        let mut p = Partition::default().with_row(ck("r"), Row::default().with_cell("v", Cell::live(1, "old")));
        p.apply(&Partition::default().with_row(ck("r"), Row::default().with_cell("v", Cell::live(2, "new"))));
        assert_eq!(
            p.rows[&ck("r")].cells["v"],
            Cell::live(2, "new")
        );
    }

    #[test]
    fn tombstone_wins_timestamp_tie() {
        let mut p = Partition::default().with_row(ck("r"), Row::default().with_cell("v", Cell::live(5, "x")));
        p.apply(&Partition::default().with_row(ck("r"), Row::default().with_cell("v", Cell::tombstone(5))));
        assert_eq!(p.rows[&ck("r")].cells["v"], Cell::tombstone(5));
        assert_eq!(p.live_row_count(), 0);
    }

    #[test]
    fn partition_tombstone_shades_older_rows() {
        let p = Partition {
            tombstone: Some(10),
            rows: BTreeMap::from([
                (ck("old"), Row::default().with_cell("v", Cell::live(5, "x"))),
                (ck("new"), Row::default().with_cell("v", Cell::live(11, "y"))),
            ]),
        };
        assert_eq!(p.live_row_count(), 1);
        assert_eq!(p.last_live_clustering(), Some(&ck("new")));
    }

    #[test]
    fn difference_holds_exactly_the_missing_cells() {
        let full = Partition::default()
            .with_row(ck("a"), Row::default().with_cell("v", Cell::live(1, "a")))
            .with_row(ck("b"), Row::default().with_cell("v", Cell::live(2, "b")));
        let partial = Partition::default()
            .with_row(ck("a"), Row::default().with_cell("v", Cell::live(1, "a")));

        let diff = full.difference(&partial).unwrap();
        assert_eq!(
            diff,
            Partition::default().with_row(ck("b"), Row::default().with_cell("v", Cell::live(2, "b")))
        );
        // And nothing is owed the other way.
        assert_eq!(partial.difference(&full), None);
    }

    #[test]
    fn merge_is_commutative_on_these_inputs() {
        let a = Partition::default().with_row(ck("r"), Row::default().with_cell("v", Cell::live(3, "a")));
        let b = Partition::default().with_row(ck("r"), Row::default().with_cell("w", Cell::live(4, "b")));

        let mut ab = a.clone();
        ab.apply(&b);
        let mut ba = b.clone();
        ba.apply(&a);
        assert_eq!(ab, ba);
    }
}
