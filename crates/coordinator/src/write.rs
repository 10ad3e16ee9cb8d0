use crate::{Inner, StorageProxy};
use models::{ConsistencyLevel, Endpoint, Mutation, WriteType};
use placement::ReplicationStrategy;
use rpc::{CallMeta, CounterMutationRequest, Error, MutationRequest, Result, TruncateRequest};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Queued-bytes ceiling above which new writes are throttled.
pub(crate) const QUEUED_WRITE_BYTES_CEILING: usize = 6 * 1024 * 1024;

// How a handler counts acknowledgements toward its consistency level.
pub(crate) enum AckPolicy {
    /// Every replica counts.
    Generic,
    /// Only the coordinator's datacenter counts.
    DcLocal,
    /// Per-datacenter countdown; an ack counts while its datacenter still
    /// owes responses.
    DcSync { remaining: HashMap<String, usize> },
}

pub(crate) struct WriteHandler {
    pub cl: ConsistencyLevel,
    pub write_type: WriteType,
    pub block_for: usize,
    pub policy: AckPolicy,
    pub targets: BTreeSet<Endpoint>,
    pub cl_acks: usize,
    pub cl_achieved: bool,
    pub in_background: bool,
    pub size: usize,
    pub mutation: Arc<Mutation>,
    pub done: Option<oneshot::Sender<()>>,
}

impl WriteHandler {
    fn accepts(&mut self, from: Endpoint, inner: &Inner) -> bool {
        match &mut self.policy {
            AckPolicy::Generic => true,
            AckPolicy::DcLocal => {
                from == inner.local
                    || inner.topology.datacenter(from) == inner.cfg.local_dc
            }
            AckPolicy::DcSync { remaining } => {
                let dc = inner.topology.datacenter(from);
                match remaining.get_mut(&dc) {
                    Some(owed) if *owed > 0 => {
                        *owed -= 1;
                        true
                    }
                    _ => false,
                }
            }
        }
    }
}

impl StorageProxy {
    /// Coordinate one mutation at `cl`: resolve replicas, enforce
    /// availability, dispatch, and wait for `block_for` acknowledgements
    /// within the write timeout.
    #[tracing::instrument(level = "trace", skip(self, mutation), fields(cl = %cl))]
    pub async fn mutate(&self, mutation: Mutation, cl: ConsistencyLevel) -> Result<()> {
        self.mutate_with_type(mutation, cl, WriteType::Simple, false)
            .await
    }

    pub(crate) async fn mutate_with_type(
        &self,
        mutation: Mutation,
        cl: ConsistencyLevel,
        write_type: WriteType,
        pre_applied_local: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        let strategy = inner
            .schema
            .strategy(&mutation.keyspace)
            .ok_or_else(|| Error::Invalid(format!("unknown keyspace '{}'", mutation.keyspace)))?;

        let tm = inner.ring.borrow().clone();
        let natural = strategy.natural_endpoints(&mutation.key.token, &tm, inner.topology.as_ref());
        let mut pending = tm.pending_endpoints_for(&mutation.keyspace, &mutation.key.token);
        pending.retain(|ep| !natural.contains(ep));

        let mut live: Vec<Endpoint> = Vec::new();
        let mut dead: Vec<Endpoint> = Vec::new();
        for ep in natural.iter().chain(pending.iter()) {
            if inner.liveness.is_alive(*ep) {
                live.push(*ep);
            } else {
                dead.push(*ep);
            }
        }

        self.assure_sufficient_live_nodes(cl, &strategy, &live, &pending)?;

        let (id, rx) = self.register_write_handler(
            cl,
            write_type,
            &strategy,
            Arc::new(mutation),
            live.iter().copied().collect(),
            &pending,
        );

        // Dead replicas get hints now; at CL=ANY a hint counts as a
        // response.
        let mut hinted = 0usize;
        for ep in &dead {
            let mutation = {
                let writes = inner.writes.lock().unwrap();
                writes.handlers.get(&id).map(|h| h.mutation.clone())
            };
            let Some(mutation) = mutation else { break };
            match inner.hints.store_hint(*ep, &mutation) {
                Ok(()) => hinted += 1,
                Err(error) => {
                    self.abort_write_handler(id);
                    return Err(error);
                }
            }
        }
        if cl == ConsistencyLevel::Any && hinted > 0 {
            self.signal_hints(id, hinted);
        }

        self.send_to_targets(id, &live, pre_applied_local).await;
        self.wait_for_write(id, rx).await
    }

    /// Raise `Unavailable` unless enough eligible replicas are alive to
    /// possibly satisfy `cl`, pending joiners included.
    pub fn assure_sufficient_live_nodes(
        &self,
        cl: ConsistencyLevel,
        strategy: &ReplicationStrategy,
        live: &[Endpoint],
        pending: &[Endpoint],
    ) -> Result<()> {
        if cl == ConsistencyLevel::Any {
            // Hints stand in for replicas at ANY; it cannot be
            // unavailable.
            return Ok(());
        }
        let inner = &self.inner;
        let local_dc = inner.cfg.local_dc.as_str();
        let topology = inner.topology.as_ref();
        let base = placement::block_for(cl, strategy, topology, local_dc);

        let (alive, required) = if cl.is_datacenter_local() {
            let alive = live
                .iter()
                .filter(|ep| topology.datacenter(**ep) == local_dc)
                .count();
            let pending_local = pending
                .iter()
                .filter(|ep| topology.datacenter(**ep) == local_dc)
                .count();
            (alive, base + pending_local)
        } else {
            (live.len(), base + pending.len())
        };

        if alive < required {
            tracing::trace!(%cl, required, alive, "insufficient live replicas");
            return Err(Error::Unavailable {
                cl,
                required,
                alive,
            });
        }
        Ok(())
    }

    pub(crate) fn register_write_handler(
        &self,
        cl: ConsistencyLevel,
        write_type: WriteType,
        strategy: &ReplicationStrategy,
        mutation: Arc<Mutation>,
        targets: BTreeSet<Endpoint>,
        pending: &[Endpoint],
    ) -> (u64, oneshot::Receiver<()>) {
        let inner = &self.inner;
        let topology = inner.topology.as_ref();
        let local_dc = inner.cfg.local_dc.as_str();
        let base = placement::block_for(cl, strategy, topology, local_dc);

        let (policy, block_for) = if cl.is_datacenter_local() {
            let pending_local = pending
                .iter()
                .filter(|ep| topology.datacenter(**ep) == local_dc)
                .count();
            (AckPolicy::DcLocal, base + pending_local)
        } else if cl == ConsistencyLevel::EachQuorum
            && matches!(strategy, ReplicationStrategy::NetworkTopology { .. })
        {
            let mut remaining: HashMap<String, usize> = HashMap::new();
            let mut total = 0;
            for dc in strategy.datacenters().unwrap_or_default() {
                let pending_in_dc = pending
                    .iter()
                    .filter(|ep| topology.datacenter(**ep) == dc)
                    .count();
                let owed = strategy.replication_factor_in(dc) / 2 + 1 + pending_in_dc;
                total += owed;
                remaining.insert(dc.to_string(), owed);
            }
            (AckPolicy::DcSync { remaining }, total)
        } else {
            (AckPolicy::Generic, base + pending.len())
        };

        let size = mutation.serialized_size();
        let (tx, rx) = oneshot::channel();
        let id = inner.stats.next_id.fetch_add(1, Ordering::Relaxed);
        let handler = WriteHandler {
            cl,
            write_type,
            block_for,
            policy,
            targets,
            cl_acks: 0,
            cl_achieved: false,
            in_background: false,
            size,
            mutation,
            done: Some(tx),
        };
        {
            let mut writes = inner.writes.lock().unwrap();
            writes.handlers.insert(id, handler);
        }
        inner.stats.queued_write_bytes.fetch_add(size, Ordering::Relaxed);
        metrics::counter!("coordinator_write_attempts").increment(1);
        (id, rx)
    }

    async fn send_to_targets(&self, id: u64, live: &[Endpoint], pre_applied_local: bool) {
        let inner = &self.inner;
        let mutation = {
            let writes = inner.writes.lock().unwrap();
            match writes.handlers.get(&id) {
                Some(h) => h.mutation.clone(),
                None => return,
            }
        };

        let mut remote_by_dc: HashMap<String, Vec<Endpoint>> = HashMap::new();
        for ep in live {
            if *ep == inner.local {
                if pre_applied_local {
                    self.got_response(id, inner.local);
                } else {
                    match inner.engine.apply(&mutation).await {
                        Ok(()) => self.got_response(id, inner.local),
                        Err(error) => {
                            tracing::error!(%error, "local mutation apply failed");
                        }
                    }
                }
            } else {
                remote_by_dc
                    .entry(inner.topology.datacenter(*ep))
                    .or_default()
                    .push(*ep);
            }
        }

        for (dc, members) in remote_by_dc {
            let is_local_dc = dc == inner.cfg.local_dc;
            if is_local_dc || !inner.cfg.cross_dc_forwarding || members.len() == 1 {
                for ep in members {
                    self.send_mutation(id, ep, &mutation, Vec::new()).await;
                }
            } else {
                // One relay per remote datacenter carries the mutation for
                // its datacenter-mates, saving WAN sends.
                let relay = members[0];
                let forward = members[1..].to_vec();
                self.send_mutation(id, relay, &mutation, forward).await;
            }
        }
    }

    async fn send_mutation(
        &self,
        id: u64,
        to: Endpoint,
        mutation: &Arc<Mutation>,
        forward_to: Vec<Endpoint>,
    ) {
        let inner = &self.inner;
        let req = MutationRequest {
            mutation: (**mutation).clone(),
            response_id: id,
            shard: inner.shard,
            reply_to: inner.local,
            forward_to,
        };
        let meta = CallMeta::new(inner.local);
        if let Err(error) = inner.transport.mutation(to, req, meta).await {
            // Transport failures behave like peer death; the write will
            // time out or complete on other replicas.
            if error.is_transport() {
                tracing::trace!(%to, %error, "mutation send failed");
                metrics::counter!("coordinator_write_transport_errors").increment(1);
            } else {
                tracing::error!(%to, %error, "mutation send rejected");
            }
        }
    }

    async fn wait_for_write(&self, id: u64, rx: oneshot::Receiver<()>) -> Result<()> {
        let timeout = self.inner.cfg.write_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                self.spawn_background_reaper(id);
                Ok(())
            }
            Ok(Err(_closed)) => Err(Error::ServerError(
                "write handler dropped before completion".to_string(),
            )),
            Err(_elapsed) => self.on_write_timeout(id),
        }
    }

    // The ack and the timeout race; slab presence decides the winner.
    fn on_write_timeout(&self, id: u64) -> Result<()> {
        let inner = &self.inner;
        let removed = {
            let mut writes = inner.writes.lock().unwrap();
            writes.handlers.remove(&id)
        };
        let Some(handler) = removed else {
            // Completed concurrently with the deadline: the caller gets
            // the success it raced against.
            return Ok(());
        };
        self.finish_handler_accounting(&handler);
        if handler.cl_achieved {
            // Consistency was reached; only the background wait or the
            // throttle queue outlived the deadline.
            return Ok(());
        }

        // Unresponsive targets get hints; at CL=ANY those hints satisfy
        // the request even now.
        let mut hinted = 0usize;
        for ep in &handler.targets {
            if inner.hints.store_hint(*ep, &handler.mutation).is_ok() {
                hinted += 1;
            }
        }
        if handler.cl == ConsistencyLevel::Any && hinted > 0 {
            tracing::trace!("wrote hints to satisfy CL=ANY after no replica acknowledged");
            return Ok(());
        }

        metrics::counter!("coordinator_write_timeouts").increment(1);
        tracing::debug!(
            cl = %handler.cl,
            received = handler.cl_acks,
            block_for = handler.block_for,
            "write timed out"
        );
        Err(Error::WriteTimeout {
            cl: handler.cl,
            received: handler.cl_acks,
            block_for: handler.block_for,
            write_type: handler.write_type,
        })
    }

    // Second deadline for a handler that achieved its consistency level
    // but still waits on stragglers in the background.
    fn spawn_background_reaper(&self, id: u64) {
        let this = self.clone();
        let timeout = self.inner.cfg.write_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let removed = {
                let mut writes = this.inner.writes.lock().unwrap();
                writes.handlers.remove(&id)
            };
            if let Some(handler) = removed {
                tracing::trace!(
                    targets = handler.targets.len(),
                    "write not acknowledged by all replicas after achieving its consistency level"
                );
                this.finish_handler_accounting(&handler);
                this.unthrottle();
            }
        });
    }

    /// Record one replica acknowledgement. Duplicate and late
    /// acknowledgements are no-ops.
    pub fn got_response(&self, id: u64, from: Endpoint) {
        let inner = &self.inner;
        let mut finished: Option<WriteHandler> = None;
        {
            let mut writes = inner.writes.lock().unwrap();
            let Some(handler) = writes.handlers.get_mut(&id) else {
                return;
            };
            if !handler.targets.remove(&from) {
                return;
            }
            if handler.accepts(from, inner) {
                handler.cl_acks += 1;
            }
            if !handler.cl_achieved && handler.cl_acks >= handler.block_for {
                handler.cl_achieved = true;
                if self.need_throttle_writes() {
                    metrics::counter!("coordinator_throttled_writes").increment(1);
                    writes.throttled.push_back(id);
                } else {
                    let handler = writes.handlers.get_mut(&id).unwrap();
                    Self::promote_to_background(inner, handler);
                }
            }
            if writes
                .handlers
                .get(&id)
                .is_some_and(|h| h.targets.is_empty())
            {
                finished = writes.handlers.remove(&id);
            }
        }
        if let Some(handler) = finished {
            self.finish_handler_accounting(&handler);
            self.unthrottle();
        }
    }

    // Hints counting toward CL=ANY.
    fn signal_hints(&self, id: u64, count: usize) {
        let inner = &self.inner;
        let mut writes = inner.writes.lock().unwrap();
        let Some(handler) = writes.handlers.get_mut(&id) else {
            return;
        };
        handler.cl_acks += count;
        if !handler.cl_achieved && handler.cl_acks >= handler.block_for {
            handler.cl_achieved = true;
            Self::promote_to_background(inner, handler);
        }
    }

    fn abort_write_handler(&self, id: u64) {
        let removed = {
            let mut writes = self.inner.writes.lock().unwrap();
            writes.handlers.remove(&id)
        };
        if let Some(handler) = removed {
            self.finish_handler_accounting(&handler);
        }
    }

    // Move a handler whose consistency level is satisfied out of the
    // foreground byte budget and resolve the caller.
    fn promote_to_background(inner: &Inner, handler: &mut WriteHandler) {
        if handler.in_background {
            return;
        }
        handler.in_background = true;
        inner
            .stats
            .queued_write_bytes
            .fetch_sub(handler.size, Ordering::Relaxed);
        inner
            .stats
            .background_write_bytes
            .fetch_add(handler.size, Ordering::Relaxed);
        inner.stats.background_writes.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("coordinator_background_writes").increment(1.0);
        if let Some(done) = handler.done.take() {
            let _ = done.send(());
        }
    }

    fn finish_handler_accounting(&self, handler: &WriteHandler) {
        let stats = &self.inner.stats;
        if handler.in_background {
            stats
                .background_write_bytes
                .fetch_sub(handler.size, Ordering::Relaxed);
            stats.background_writes.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!("coordinator_background_writes").decrement(1.0);
        } else {
            stats
                .queued_write_bytes
                .fetch_sub(handler.size, Ordering::Relaxed);
        }
    }

    pub fn need_throttle_writes(&self) -> bool {
        let stats = &self.inner.stats;
        stats.background_write_bytes.load(Ordering::Relaxed)
            > self.inner.cfg.memory_budget / 10
            || stats.queued_write_bytes.load(Ordering::Relaxed) > QUEUED_WRITE_BYTES_CEILING
    }

    /// Release throttled handlers while the byte budgets allow.
    pub(crate) fn unthrottle(&self) {
        let inner = &self.inner;
        loop {
            if self.need_throttle_writes() {
                return;
            }
            let mut writes = inner.writes.lock().unwrap();
            let Some(id) = writes.throttled.pop_front() else {
                return;
            };
            if let Some(handler) = writes.handlers.get_mut(&id) {
                Self::promote_to_background(inner, handler);
            }
        }
    }

    pub fn in_flight_writes(&self) -> usize {
        self.inner.writes.lock().unwrap().handlers.len()
    }

    pub fn background_writes(&self) -> usize {
        self.inner.stats.background_writes.load(Ordering::Relaxed)
    }

    // ---- counters ----

    /// Counter writes funnel through a single leader replica which applies
    /// the mutation and then replicates the resulting delta at `cl`.
    pub async fn counter_mutate(
        &self,
        mutations: Vec<Mutation>,
        cl: ConsistencyLevel,
    ) -> Result<()> {
        for mutation in mutations {
            let leader = self.find_counter_leader(&mutation)?;
            if leader == self.inner.local {
                self.apply_counter_as_leader(mutation, cl).await?;
            } else {
                let req = CounterMutationRequest {
                    mutations: vec![mutation],
                    cl,
                };
                let meta = CallMeta::new(self.inner.local);
                let timeout = self.inner.cfg.counter_write_timeout;
                match tokio::time::timeout(
                    timeout,
                    self.inner.transport.counter_mutation(leader, req, meta),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_elapsed) => {
                        return Err(Error::WriteTimeout {
                            cl,
                            received: 0,
                            block_for: 1,
                            write_type: WriteType::Counter,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    // Leader preference: self when replica, else a random live replica in
    // the local datacenter, else the closest live replica.
    fn find_counter_leader(&self, mutation: &Mutation) -> Result<Endpoint> {
        use rand::seq::SliceRandom;
        let inner = &self.inner;
        let strategy = inner
            .schema
            .strategy(&mutation.keyspace)
            .ok_or_else(|| Error::Invalid(format!("unknown keyspace '{}'", mutation.keyspace)))?;
        let tm = inner.ring.borrow().clone();
        let natural = strategy.natural_endpoints(&mutation.key.token, &tm, inner.topology.as_ref());
        let live: Vec<Endpoint> = natural
            .iter()
            .copied()
            .filter(|ep| inner.liveness.is_alive(*ep))
            .collect();
        if live.is_empty() {
            return Err(Error::Unavailable {
                cl: ConsistencyLevel::One,
                required: 1,
                alive: 0,
            });
        }
        if live.contains(&inner.local) {
            return Ok(inner.local);
        }
        let dc_local: Vec<Endpoint> = live
            .iter()
            .copied()
            .filter(|ep| inner.topology.datacenter(*ep) == inner.cfg.local_dc)
            .collect();
        if let Some(ep) = dc_local.choose(&mut rand::thread_rng()) {
            return Ok(*ep);
        }
        let mut sorted = live;
        inner.topology.sort_by_proximity(inner.local, &mut sorted);
        Ok(sorted[0])
    }

    pub(crate) async fn apply_counter_as_leader(
        &self,
        mutation: Mutation,
        cl: ConsistencyLevel,
    ) -> Result<()> {
        self.inner.engine.apply(&mutation).await?;
        self.mutate_with_type(mutation, cl, WriteType::Counter, true)
            .await
    }

    // ---- atomic batches ----

    /// Atomic batch: persist the batch to datacenter-local batchlog
    /// replicas first, run the writes, then reclaim the batchlog row.
    pub async fn batch_mutate(
        &self,
        mutations: Vec<Mutation>,
        cl: ConsistencyLevel,
    ) -> Result<()> {
        let batch_id = uuid::Uuid::new_v4();
        let targets = self.batchlog_targets(cl)?;

        let log_write = crate::batchlog_mutation(&self.inner.schema, batch_id, &mutations);
        self.mutate_to_fixed_targets(
            log_write,
            ConsistencyLevel::One,
            WriteType::BatchLog,
            targets.clone(),
        )
        .await?;

        let writes = mutations
            .into_iter()
            .map(|m| self.mutate_with_type(m, cl, WriteType::Batch, false));
        futures::future::try_join_all(writes).await?;

        // Reclaim in the background at ANY; a lost tombstone only costs a
        // replay.
        let remove = crate::batchlog_remove_mutation(&self.inner.schema, batch_id);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(error) = this
                .mutate_to_fixed_targets(
                    remove,
                    ConsistencyLevel::Any,
                    WriteType::Simple,
                    targets,
                )
                .await
            {
                tracing::debug!(%error, %batch_id, "batchlog reclaim failed");
            }
        });
        Ok(())
    }

    // Batchlog rows go to live members of the coordinator's datacenter.
    // With nobody else available the local node stands in, but only at
    // CL=ANY.
    fn batchlog_targets(&self, cl: ConsistencyLevel) -> Result<Vec<Endpoint>> {
        use rand::seq::SliceRandom;
        let inner = &self.inner;
        let tm = inner.ring.borrow().clone();
        let mut candidates: Vec<Endpoint> = tm
            .normal_endpoints()
            .into_iter()
            .filter(|ep| {
                *ep != inner.local
                    && inner.liveness.is_alive(*ep)
                    && inner.topology.datacenter(*ep) == inner.cfg.local_dc
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(2);
        if candidates.is_empty() {
            if cl == ConsistencyLevel::Any {
                return Ok(vec![inner.local]);
            }
            return Err(Error::Unavailable {
                cl: ConsistencyLevel::One,
                required: 1,
                alive: 0,
            });
        }
        Ok(candidates)
    }

    pub(crate) async fn mutate_to_fixed_targets(
        &self,
        mutation: Mutation,
        cl: ConsistencyLevel,
        write_type: WriteType,
        targets: Vec<Endpoint>,
    ) -> Result<()> {
        let strategy = ReplicationStrategy::Simple {
            replication_factor: targets.len().max(1),
        };
        let (id, rx) = self.register_write_handler(
            cl,
            write_type,
            &strategy,
            Arc::new(mutation),
            targets.iter().copied().collect(),
            &[],
        );
        self.send_to_targets(id, &targets, false).await;
        self.wait_for_write(id, rx).await
    }

    // ---- truncate ----

    /// Truncate a table on every member; refuses while any member is down
    /// since a missed truncation resurrects data.
    pub async fn truncate(&self, keyspace: &str, table: &str) -> Result<()> {
        let inner = &self.inner;
        let members = inner.ring.borrow().clone().normal_endpoints();
        if members
            .iter()
            .any(|ep| *ep != inner.local && !inner.liveness.is_alive(*ep))
        {
            return Err(Error::TruncateError(
                "cannot truncate while cluster members are down".to_string(),
            ));
        }
        let timeout = inner.cfg.truncate_timeout;
        let calls = members.into_iter().map(|ep| {
            let req = TruncateRequest {
                keyspace: keyspace.to_string(),
                table: table.to_string(),
            };
            async move {
                if ep == inner.local {
                    inner.engine.truncate(keyspace, table).await
                } else {
                    let meta = CallMeta::new(inner.local);
                    inner.transport.truncate(ep, req, meta).await
                }
            }
        });
        match tokio::time::timeout(timeout, futures::future::try_join_all(calls)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(Error::TruncateError(error.to_string())),
            Err(_elapsed) => Err(Error::TruncateError("truncate timed out".to_string())),
        }
    }
}
