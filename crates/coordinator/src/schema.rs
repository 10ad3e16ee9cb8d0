use models::{DecoratedKey, KeyspaceDef, Mutation, QueryResult, ReadCommand, TableDef};
use models::{ReconcilablePartition, ReconcilableResult};
use partition::Partitioner;
use placement::ReplicationStrategy;
use rpc::SchemaVersion;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The schema surface the coordinator consults: keyspace replication and
/// per-table read tuning. Definition management (CQL, migrations) lives
/// outside the core.
pub struct SchemaRegistry {
    partitioner: Arc<dyn Partitioner>,
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    keyspaces: HashMap<String, (KeyspaceDef, ReplicationStrategy)>,
    tables: HashMap<(String, String), TableDef>,
    version: uuid::Uuid,
}

impl SchemaRegistry {
    pub fn new(partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            partitioner,
            inner: Mutex::new(Tables::default()),
        }
    }

    pub fn partitioner(&self) -> &Arc<dyn Partitioner> {
        &self.partitioner
    }

    pub fn add_keyspace(&self, def: KeyspaceDef) -> Result<(), placement::Error> {
        let strategy = ReplicationStrategy::from_def(&def)?;
        let mut inner = self.inner.lock().unwrap();
        inner.keyspaces.insert(def.name.clone(), (def, strategy));
        inner.version = uuid::Uuid::new_v4();
        Ok(())
    }

    pub fn add_table(&self, def: TableDef) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tables
            .insert((def.keyspace.clone(), def.name.clone()), def);
        inner.version = uuid::Uuid::new_v4();
    }

    pub fn strategy(&self, keyspace: &str) -> Option<ReplicationStrategy> {
        let inner = self.inner.lock().unwrap();
        inner.keyspaces.get(keyspace).map(|(_, s)| s.clone())
    }

    pub fn keyspaces(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.keyspaces.keys().cloned().collect()
    }

    pub fn table(&self, keyspace: &str, table: &str) -> Option<TableDef> {
        let inner = self.inner.lock().unwrap();
        inner
            .tables
            .get(&(keyspace.to_string(), table.to_string()))
            .cloned()
    }

    pub fn version(&self) -> SchemaVersion {
        SchemaVersion(self.inner.lock().unwrap().version)
    }

    /// The full definition set, as pushed to (or pulled by) peers.
    pub fn dump(&self) -> rpc::SchemaUpdate {
        let inner = self.inner.lock().unwrap();
        rpc::SchemaUpdate {
            keyspaces: inner.keyspaces.values().map(|(def, _)| def.clone()).collect(),
            tables: inner.tables.values().cloned().collect(),
        }
    }

    /// Apply a peer's definition push. Unknown strategies are rejected;
    /// everything else replaces the local definition wholesale.
    pub fn apply_update(&self, update: rpc::SchemaUpdate) -> Result<(), placement::Error> {
        for def in update.keyspaces {
            self.add_keyspace(def)?;
        }
        for def in update.tables {
            self.add_table(def);
        }
        Ok(())
    }

    /// Decorate a partition key with its token under the cluster
    /// partitioner.
    pub fn decorate(&self, key: impl Into<bytes::Bytes>) -> DecoratedKey {
        let key = key.into();
        DecoratedKey {
            token: self.partitioner.token_of(&key),
            key,
        }
    }
}

/// The local storage engine, an external collaborator: the coordinator
/// only needs apply, the three read shapes, truncate, and a range hash
/// for repair.
#[async_trait::async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    async fn apply(&self, mutation: &Mutation) -> rpc::Result<()>;
    async fn read(&self, command: &ReadCommand) -> rpc::Result<QueryResult>;
    async fn read_reconcilable(&self, command: &ReadCommand) -> rpc::Result<ReconcilableResult>;
    async fn truncate(&self, keyspace: &str, table: &str) -> rpc::Result<()>;
    async fn checksum_range(
        &self,
        keyspace: &str,
        table: &str,
        range: &partition::TokenRange,
    ) -> rpc::Result<u64>;
}

/// Sink for hinted writes toward dead replicas. The durable hint store is
/// external; the coordinator only reports intents and respects the
/// sink's backpressure error.
pub trait HintSink: Send + Sync + 'static {
    /// Record a hint; an `Overloaded` error means the hint ceiling is
    /// reached and the write should fail instead.
    fn store_hint(&self, target: models::Endpoint, mutation: &Mutation) -> rpc::Result<()>;
}

/// Discards hints; used where hinted handoff is disabled.
pub struct NoHints;

impl HintSink for NoHints {
    fn store_hint(&self, target: models::Endpoint, _mutation: &Mutation) -> rpc::Result<()> {
        tracing::trace!(%target, "hinted handoff disabled, dropping hint");
        Ok(())
    }
}

/// Bounded in-memory hint buffer. Past the ceiling, further hints are
/// refused with `Overloaded` and the write fails instead of queueing
/// unbounded work.
pub struct MemHints {
    ceiling: usize,
    hints: Mutex<Vec<(models::Endpoint, Mutation)>>,
}

impl MemHints {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            hints: Mutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.hints.lock().unwrap().len()
    }

    pub fn drain_for(&self, target: models::Endpoint) -> Vec<Mutation> {
        let mut hints = self.hints.lock().unwrap();
        let mut out = Vec::new();
        hints.retain(|(ep, mutation)| {
            if *ep == target {
                out.push(mutation.clone());
                false
            } else {
                true
            }
        });
        out
    }
}

impl HintSink for MemHints {
    fn store_hint(&self, target: models::Endpoint, mutation: &Mutation) -> rpc::Result<()> {
        let mut hints = self.hints.lock().unwrap();
        if hints.len() >= self.ceiling {
            return Err(rpc::Error::Overloaded(format!(
                "hint buffer at ceiling ({})",
                self.ceiling
            )));
        }
        hints.push((target, mutation.clone()));
        metrics::gauge!("coordinator_hints_pending").set(hints.len() as f64);
        Ok(())
    }
}

/// In-memory wide-column store backing replica behavior in tests and
/// standalone runs.
#[derive(Default)]
pub struct MemStore {
    tables: Mutex<HashMap<(String, String), std::collections::BTreeMap<DecoratedKey, models::Partition>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct fixture loading for tests.
    pub fn put(&self, keyspace: &str, table: &str, key: DecoratedKey, partition: models::Partition) {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry((keyspace.to_string(), table.to_string()))
            .or_default()
            .entry(key)
            .or_default()
            .apply(&partition);
    }

    pub fn get(&self, keyspace: &str, table: &str, key: &DecoratedKey) -> Option<models::Partition> {
        let tables = self.tables.lock().unwrap();
        tables
            .get(&(keyspace.to_string(), table.to_string()))?
            .get(key)
            .cloned()
    }
}

#[async_trait::async_trait]
impl StorageEngine for MemStore {
    async fn apply(&self, mutation: &Mutation) -> rpc::Result<()> {
        self.put(
            &mutation.keyspace,
            &mutation.table,
            mutation.key.clone(),
            mutation.partition.clone(),
        );
        Ok(())
    }

    async fn read(&self, command: &ReadCommand) -> rpc::Result<QueryResult> {
        let partition = self
            .get(&command.keyspace, &command.table, &command.key)
            .unwrap_or_default();
        let limit = command
            .row_limit
            .min(command.per_partition_limit)
            .max(1) as usize;
        let rows = models::rows_of(&command.key, &partition, limit);
        let live = partition.live_row_count();
        Ok(QueryResult {
            last_modified: partition.max_timestamp(),
            short_read: live > rows.len(),
            rows,
        })
    }

    async fn read_reconcilable(&self, command: &ReadCommand) -> rpc::Result<ReconcilableResult> {
        let partition = self
            .get(&command.keyspace, &command.table, &command.key)
            .unwrap_or_default();
        let live = partition.live_row_count() as u32;
        Ok(ReconcilableResult {
            partitions: vec![ReconcilablePartition {
                key: command.key.clone(),
                live_row_count: live,
                reached_partition_end: true,
                partition,
            }],
            reached_end: true,
            short_read: false,
        })
    }

    async fn truncate(&self, keyspace: &str, table: &str) -> rpc::Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.remove(&(keyspace.to_string(), table.to_string()));
        Ok(())
    }

    async fn checksum_range(
        &self,
        keyspace: &str,
        table: &str,
        range: &partition::TokenRange,
    ) -> rpc::Result<u64> {
        let tables = self.tables.lock().unwrap();
        let mut ctx = md5::Context::new();
        if let Some(partitions) = tables.get(&(keyspace.to_string(), table.to_string())) {
            for (key, partition) in partitions {
                if !range.contains(&key.token) {
                    continue;
                }
                ctx.consume(&key.key);
                let body = serde_json::to_vec(partition)
                    .map_err(|e| rpc::Error::ServerError(e.to_string()))?;
                ctx.consume(&body);
            }
        }
        let digest = ctx.compute().0;
        Ok(u64::from_be_bytes(digest[..8].try_into().expect("md5 is 16 bytes")))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{Cell, Partition, Row};
    use partition::Murmur3Partitioner;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(Arc::new(Murmur3Partitioner::new(1, 0).unwrap()))
    }

    #[test]
    fn schema_version_changes_on_ddl() {
        let schema = registry();
        let v0 = schema.version();
        schema.add_keyspace(KeyspaceDef::simple("ks", 3)).unwrap();
        let v1 = schema.version();
        assert_ne!(v0, v1);
        schema.add_table(TableDef::new("ks", "t"));
        assert_ne!(v1, schema.version());
    }

    #[test]
    fn hint_buffer_enforces_its_ceiling() {
        let schema = registry();
        let hints = MemHints::new(2);
        let target = models::Endpoint::parse("10.0.0.9").unwrap();
        let mutation = Mutation {
            keyspace: "ks".to_string(),
            table: "t".to_string(),
            key: schema.decorate("pk".as_bytes().to_vec()),
            partition: Partition::default(),
        };

        hints.store_hint(target, &mutation).unwrap();
        hints.store_hint(target, &mutation).unwrap();
        let err = hints.store_hint(target, &mutation).unwrap_err();
        assert!(matches!(err, rpc::Error::Overloaded(_)));

        assert_eq!(hints.drain_for(target).len(), 2);
        assert_eq!(hints.pending(), 0);
        // Draining frees room again.
        hints.store_hint(target, &mutation).unwrap();
    }

    #[tokio::test]
    async fn mem_store_round_trip() {
        let schema = registry();
        let store = MemStore::new();
        let key = schema.decorate("pk".as_bytes().to_vec());
        let mutation = Mutation {
            keyspace: "ks".to_string(),
            table: "t".to_string(),
            key: key.clone(),
            partition: Partition::default().with_row(
                bytes::Bytes::from_static(b"row1"),
                Row::default().with_cell("v", Cell::live(1, "x")),
            ),
        };
        store.apply(&mutation).await.unwrap();

        let command = ReadCommand::new("ks", "t", key, 10);
        let result = store.read(&command).await.unwrap();
        assert_eq!(result.rows.len(), 1);
        assert!(!result.short_read);
        assert_eq!(result.last_modified, 1);
    }
}
