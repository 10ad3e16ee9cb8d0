use models::{
    ClusteringKey, DecoratedKey, Endpoint, Mutation, Partition, QueryResult, ReadCommand,
    ReconcilableResult,
};
use std::collections::BTreeSet;

/// One replica's mutation-level answer.
#[derive(Debug, Clone)]
pub struct ReplicaReply {
    pub from: Endpoint,
    pub result: ReconcilableResult,
}

/// Follow-up the reconciler asks for when replica responses cannot prove
/// the result complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Re-read with this per-partition limit.
    PerPartition(u32),
    /// Re-read with this total row limit.
    Total(u32),
}

/// Outcome of merging replica responses: the client-facing rows, what each
/// replica is owed to catch up, and whether the result is short or needs a
/// wider retry.
#[derive(Debug)]
pub struct Reconciled {
    pub result: QueryResult,
    pub diffs: Vec<(Endpoint, Mutation)>,
    pub retry: Option<Retry>,
}

/// Growth schedule for limit retries: `min(max, t²/l + 1)`, falling back
/// to `t + 1` when nothing live was observed.
pub fn retry_limit(target: u32, observed_live: u32, max: u32) -> u32 {
    if target == 0 {
        return 1.min(max.max(1));
    }
    if observed_live == 0 {
        return target.saturating_add(1).min(max);
    }
    let grown = (target as u64 * target as u64 / observed_live as u64).saturating_add(1);
    grown.min(max as u64) as u32
}

struct Version<'a> {
    partition: Option<&'a Partition>,
    reached_partition_end: bool,
    short_read: bool,
}

/// Merge replica responses partition-by-partition.
///
/// Per partition the merge applies every replica's version into one
/// accumulator; each replica's diff against the accumulator feeds repair
/// writes. Short-read and incomplete-information detection run against
/// the last (highest) partition, the only one a limit can have cut.
pub fn resolve(command: &ReadCommand, replies: &[ReplicaReply]) -> Reconciled {
    let mut keys: BTreeSet<DecoratedKey> = BTreeSet::new();
    for reply in replies {
        for p in &reply.result.partitions {
            keys.insert(p.key.clone());
        }
    }

    let mut diffs: Vec<(Endpoint, Mutation)> = Vec::new();
    let mut merged_partitions: Vec<(DecoratedKey, Partition)> = Vec::new();

    for key in &keys {
        let versions: Vec<(Endpoint, Version)> = replies
            .iter()
            .map(|reply| {
                let sent = reply.result.partitions.iter().find(|p| &p.key == key);
                (
                    reply.from,
                    Version {
                        partition: sent.map(|p| &p.partition),
                        reached_partition_end: sent.map_or(false, |p| p.reached_partition_end),
                        short_read: reply.result.short_read,
                    },
                )
            })
            .collect();

        let mut merged = Partition::default();
        for (_, version) in &versions {
            if let Some(p) = version.partition {
                merged.apply(p);
            }
        }

        for (from, version) in &versions {
            let empty = Partition::default();
            let theirs = version.partition.unwrap_or(&empty);
            if let Some(diff) = merged.difference(theirs) {
                diffs.push((
                    *from,
                    Mutation {
                        keyspace: command.keyspace.clone(),
                        table: command.table.clone(),
                        key: key.clone(),
                        partition: diff,
                    },
                ));
            }
        }
        merged_partitions.push((key.clone(), merged));
    }

    // Materialize rows under the command's limits.
    let per_partition_limit = command.per_partition_limit.max(1) as usize;
    let mut rows = Vec::new();
    let mut last_partition_live = 0usize;
    let mut last_partition_cut_by_per_partition = false;
    for (key, merged) in &merged_partitions {
        let live = merged.live_row_count();
        let room = (command.row_limit as usize).saturating_sub(rows.len());
        let limit = per_partition_limit.min(room);
        let produced = models::rows_of(key, merged, limit.max(1).min(room.max(1)));
        last_partition_live = live;
        last_partition_cut_by_per_partition = live > per_partition_limit.min(room);
        if room == 0 {
            break;
        }
        rows.extend(produced);
        if rows.len() >= command.row_limit as usize {
            break;
        }
    }

    let last_modified = merged_partitions
        .iter()
        .map(|(_, p)| p.max_timestamp())
        .max()
        .unwrap_or(i64::MIN);

    // Short-read handling on the last partition.
    let mut short_read = false;
    let mut retry = None;
    if let Some((last_key, last_merged)) = merged_partitions.last() {
        let last_versions: Vec<(Endpoint, Version)> = replies
            .iter()
            .map(|reply| {
                let sent = reply
                    .result
                    .partitions
                    .iter()
                    .find(|p| &p.key == last_key);
                (
                    reply.from,
                    Version {
                        partition: sent.map(|p| &p.partition),
                        reached_partition_end: sent.map_or(false, |p| p.reached_partition_end),
                        short_read: reply.result.short_read,
                    },
                )
            })
            .collect();

        // Replicas which stopped early under their own limits allow a
        // trimmed (short) result: cut at the lowest last key any short
        // replica reached.
        let short_last_keys: Vec<ClusteringKey> = last_versions
            .iter()
            .filter(|(_, v)| v.short_read && !v.reached_partition_end)
            .filter_map(|(_, v)| v.partition.and_then(last_sent_clustering))
            .collect();
        if let Some(cut) = short_last_keys.into_iter().min() {
            let before = rows.len();
            rows.retain(|row| {
                row.partition_key != last_key.key || row.clustering_key <= cut
            });
            if rows.len() < before || last_partition_live > rows.len() {
                short_read = true;
            }
        } else {
            // No allowed trim: check whether any replica's data provably
            // stops before the reconciled horizon without covering it.
            let last_reconciled = last_merged.last_live_clustering().cloned();
            let incomplete = last_versions.iter().any(|(_, v)| {
                if v.reached_partition_end {
                    return false;
                }
                let Some(p) = v.partition else { return false };
                match (last_sent_clustering(p), &last_reconciled) {
                    (Some(replica_last), Some(reconciled_last)) => {
                        replica_last < *reconciled_last
                    }
                    (None, Some(_)) => true,
                    _ => false,
                }
            });
            if incomplete {
                let max = u32::MAX;
                retry = if last_partition_cut_by_per_partition {
                    Some(Retry::PerPartition(retry_limit(
                        command.per_partition_limit,
                        last_partition_live as u32,
                        max,
                    )))
                } else if rows.len() >= command.row_limit as usize {
                    Some(Retry::Total(retry_limit(
                        command.row_limit,
                        rows.len() as u32,
                        max,
                    )))
                } else {
                    None
                };
            }
        }
    }

    Reconciled {
        result: QueryResult {
            rows,
            last_modified,
            short_read,
        },
        diffs,
        retry,
    }
}

fn last_sent_clustering(p: &Partition) -> Option<ClusteringKey> {
    p.rows.keys().next_back().cloned()
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use models::{Cell, ReconcilablePartition, Row};
    use partition::Token;
    use pretty_assertions::assert_eq;

    fn ep(s: &str) -> Endpoint {
        Endpoint::parse(s).unwrap()
    }

    fn key() -> DecoratedKey {
        DecoratedKey::new(Token::from_u64(42), "pk".as_bytes().to_vec())
    }

    fn row(v: &str, ts: i64) -> Row {
        Row::default().with_cell("v", Cell::live(ts, v.as_bytes().to_vec()))
    }

    fn partition_of(rows: &[(&str, i64)]) -> Partition {
        let mut p = Partition::default();
        for (ck, ts) in rows {
            p.rows
                .insert(Bytes::copy_from_slice(ck.as_bytes()), row(ck, *ts));
        }
        p
    }

    fn reply(from: &str, p: Partition, reached_end: bool, short: bool) -> ReplicaReply {
        let live = p.live_row_count() as u32;
        ReplicaReply {
            from: ep(from),
            result: ReconcilableResult {
                partitions: vec![ReconcilablePartition {
                    key: key(),
                    partition: p,
                    live_row_count: live,
                    reached_partition_end: reached_end,
                }],
                reached_end: true,
                short_read: short,
            },
        }
    }

    fn command(row_limit: u32) -> ReadCommand {
        ReadCommand::new("ks", "t", key(), 1_000_000).with_row_limit(row_limit)
    }

    #[test]
    fn merge_unions_replica_rows_and_queues_diffs() {
        // Replica 2 is missing row "b".
        let replies = vec![
            reply("10.0.0.1", partition_of(&[("a", 1), ("b", 2), ("c", 3)]), true, false),
            reply("10.0.0.2", partition_of(&[("a", 1), ("c", 3)]), true, false),
            reply("10.0.0.3", partition_of(&[("a", 1), ("b", 2), ("c", 3)]), true, false),
        ];
        let out = resolve(&command(100), &replies);

        let cks: Vec<_> = out
            .result
            .rows
            .iter()
            .map(|r| String::from_utf8_lossy(&r.clustering_key).to_string())
            .collect();
        assert_eq!(cks, vec!["a", "b", "c"]);
        assert!(!out.result.short_read);
        assert!(out.retry.is_none());

        // Only replica 2 is owed anything, and exactly row "b".
        assert_eq!(out.diffs.len(), 1);
        let (owed, mutation) = &out.diffs[0];
        assert_eq!(*owed, ep("10.0.0.2"));
        assert_eq!(
            mutation.partition.rows.keys().cloned().collect::<Vec<_>>(),
            vec![Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn newest_timestamp_wins_across_replicas() {
        let stale = partition_of(&[("a", 1)]);
        let mut fresh = Partition::default();
        fresh.rows.insert(
            Bytes::from_static(b"a"),
            Row::default().with_cell("v", Cell::live(9, "new")),
        );
        let replies = vec![
            reply("10.0.0.1", stale, true, false),
            reply("10.0.0.2", fresh, true, false),
        ];
        let out = resolve(&command(10), &replies);
        assert_eq!(out.result.rows.len(), 1);
        assert_eq!(
            out.result.rows[0].cells["v"],
            Bytes::from_static(b"new")
        );
        // The stale replica owes the newer cell.
        assert_eq!(out.diffs.len(), 1);
        assert_eq!(out.diffs[0].0, ep("10.0.0.1"));
    }

    #[test]
    fn short_replicas_trim_to_the_lowest_last_key() {
        // Both replicas stopped early with different horizons; the result
        // is cut at the lower one and flagged short.
        let r1 = partition_of(&[("a", 1), ("b", 1), ("c", 1), ("d", 1)]);
        let r2 = partition_of(&[("a", 1), ("b", 1)]);
        let replies = vec![
            reply("10.0.0.1", r1, false, true),
            reply("10.0.0.2", r2, false, true),
        ];
        let out = resolve(&command(100), &replies);

        let cks: Vec<_> = out
            .result
            .rows
            .iter()
            .map(|r| String::from_utf8_lossy(&r.clustering_key).to_string())
            .collect();
        assert_eq!(cks, vec!["a", "b"]);
        assert!(out.result.short_read);
        assert!(out.retry.is_none());
    }

    #[test]
    fn undershooting_replica_without_short_flag_requests_retry() {
        // Replica 2 sent fewer rows than the reconciled horizon, did not
        // reach the partition end, and claimed no short read: the result
        // cannot be proven complete under the row limit.
        let r1 = partition_of(&[("a", 1), ("b", 1), ("c", 1)]);
        let r2 = partition_of(&[("a", 1)]);
        let replies = vec![
            reply("10.0.0.1", r1, true, false),
            reply("10.0.0.2", r2, false, false),
        ];
        let out = resolve(&command(3), &replies);
        assert_eq!(out.retry, Some(Retry::Total(retry_limit(3, 3, u32::MAX))));
    }

    #[test]
    fn retry_limit_growth() {
        assert_eq!(retry_limit(100, 40, u32::MAX), 251);
        assert_eq!(retry_limit(100, 0, u32::MAX), 101);
        assert_eq!(retry_limit(100, 40, 200), 200);
        assert_eq!(retry_limit(10, 10, u32::MAX), 11);
    }

    #[test]
    fn empty_partition_on_one_replica_owes_everything() {
        let full = partition_of(&[("a", 1), ("b", 2)]);
        let replies = vec![
            reply("10.0.0.1", full.clone(), true, false),
            reply("10.0.0.2", Partition::default(), true, false),
        ];
        let out = resolve(&command(10), &replies);
        assert_eq!(out.diffs.len(), 1);
        assert_eq!(out.diffs[0].0, ep("10.0.0.2"));
        assert_eq!(out.diffs[0].1.partition, full);
    }

    #[test]
    fn tombstones_flow_through_reconciliation() {
        let alive = partition_of(&[("a", 1)]);
        let mut deleted = Partition::default();
        deleted.rows.insert(
            Bytes::from_static(b"a"),
            Row::default().with_cell("v", Cell::tombstone(5)),
        );
        let replies = vec![
            reply("10.0.0.1", alive, true, false),
            reply("10.0.0.2", deleted, true, false),
        ];
        let out = resolve(&command(10), &replies);
        // The delete wins; nothing surfaces to the client.
        assert!(out.result.rows.is_empty());
        // The replica still holding the live cell is owed the tombstone.
        assert_eq!(out.diffs.len(), 1);
        assert_eq!(out.diffs[0].0, ep("10.0.0.1"));
    }
}
