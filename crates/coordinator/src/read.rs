use crate::reconcile::{self, ReplicaReply, Retry};
use crate::StorageProxy;
use futures::stream::{FuturesUnordered, StreamExt};
use models::{
    ConsistencyLevel, Endpoint, QueryResult, ReadCommand, ReadRepairDecision, ResultDigest,
    SpeculativeRetry, TableDef,
};
use rand::Rng;
use rpc::{CallMeta, Error, ReadDataRequest, Result};
use std::sync::atomic::Ordering;
use std::time::Duration;

// How the executor treats the extra replica.
enum SpecMode {
    Never,
    /// Dispatch to the extra replica up front.
    Always,
    /// Arm a timer; dispatch to the extra replica if the fast path has not
    /// completed when it fires.
    After(Duration),
}

struct ReadPlan {
    targets: Vec<Endpoint>,
    block_for: usize,
    extra: Option<Endpoint>,
    speculative: SpecMode,
    repair: ReadRepairDecision,
}

enum Response {
    Data(Endpoint, Result<rpc::ReadDataResponse>),
    Digest(Endpoint, Result<rpc::ReadDigestResponse>),
}

#[derive(Default)]
struct DigestAccumulator {
    data: Option<(Endpoint, QueryResult)>,
    digests: Vec<(Endpoint, ResultDigest)>,
    last_modified: i64,
    responses: usize,
    cl_responses: usize,
}

impl DigestAccumulator {
    fn digests_match(&self) -> bool {
        let mut all = self.digests.iter().map(|(_, d)| d);
        match all.next() {
            None => true,
            Some(first) => all.all(|d| d == first),
        }
    }
}

impl StorageProxy {
    /// Coordinate a single-partition read at `cl`: digest fast path,
    /// speculative retry per the table's policy, and mutation-level
    /// reconciliation with read repair on digest mismatch.
    #[tracing::instrument(level = "trace", skip(self, command), fields(cl = %cl))]
    pub async fn read(&self, command: ReadCommand, cl: ConsistencyLevel) -> Result<QueryResult> {
        let deadline = tokio::time::Instant::now() + self.inner.cfg.read_timeout;
        let plan = self.plan_read(&command, cl)?;
        metrics::counter!("coordinator_reads").increment(1);
        self.execute_read(command, cl, plan, deadline).await
    }

    fn plan_read(&self, command: &ReadCommand, cl: ConsistencyLevel) -> Result<ReadPlan> {
        let inner = &self.inner;
        let strategy = inner
            .schema
            .strategy(&command.keyspace)
            .ok_or_else(|| Error::Invalid(format!("unknown keyspace '{}'", command.keyspace)))?;
        let table = inner
            .schema
            .table(&command.keyspace, &command.table)
            .unwrap_or_else(|| TableDef::new(&command.keyspace, &command.table));

        let tm = inner.ring.borrow().clone();
        let natural = strategy.natural_endpoints(&command.key.token, &tm, inner.topology.as_ref());
        let mut live: Vec<Endpoint> = natural
            .into_iter()
            .filter(|ep| inner.liveness.is_alive(*ep))
            .collect();
        inner.topology.sort_by_proximity(inner.local, &mut live);

        let block_for =
            placement::block_for(cl, &strategy, inner.topology.as_ref(), &inner.cfg.local_dc);
        if live.len() < block_for {
            return Err(Error::Unavailable {
                cl,
                required: block_for,
                alive: live.len(),
            });
        }

        let repair = self.roll_read_repair(&table);
        let mut targets: Vec<Endpoint> = match repair {
            ReadRepairDecision::Global => live.clone(),
            ReadRepairDecision::DcLocal => {
                let mut chosen: Vec<Endpoint> = live
                    .iter()
                    .copied()
                    .filter(|ep| inner.topology.datacenter(*ep) == inner.cfg.local_dc)
                    .collect();
                for ep in &live {
                    if chosen.len() >= block_for {
                        break;
                    }
                    if !chosen.contains(ep) {
                        chosen.push(*ep);
                    }
                }
                chosen
            }
            ReadRepairDecision::None => live.iter().copied().take(block_for).collect(),
        };
        if targets.len() < block_for {
            targets = live.iter().copied().take(block_for).collect();
        }

        let extra = live.iter().find(|ep| !targets.contains(*ep)).copied();
        let all_queried = extra.is_none();
        let speculative = match table.speculative_retry {
            _ if all_queried => SpecMode::Never,
            SpeculativeRetry::None => SpecMode::Never,
            SpeculativeRetry::Always => SpecMode::Always,
            SpeculativeRetry::Percentile(_) => SpecMode::After(self.speculative_delay()),
            SpeculativeRetry::Custom(delay) => SpecMode::After(delay),
        };

        Ok(ReadPlan {
            targets,
            block_for,
            extra,
            speculative,
            repair,
        })
    }

    fn roll_read_repair(&self, table: &TableDef) -> ReadRepairDecision {
        let roll: f64 = rand::thread_rng().gen();
        if roll < table.read_repair_chance {
            ReadRepairDecision::Global
        } else if roll < table.read_repair_chance + table.dc_local_read_repair_chance {
            ReadRepairDecision::DcLocal
        } else {
            ReadRepairDecision::None
        }
    }

    // Stand-in for a latency percentile: twice the decayed average of
    // recent reads, bounded by the read timeout.
    fn speculative_delay(&self) -> Duration {
        let avg_micros = self.inner.stats.read_latency_ewma_micros.load(Ordering::Relaxed);
        if avg_micros == 0 {
            return self.inner.cfg.read_timeout / 2;
        }
        Duration::from_micros(avg_micros * 2).min(self.inner.cfg.read_timeout / 2)
    }

    fn record_read_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_micros() as u64;
        let stats = &self.inner.stats;
        let prev = stats.read_latency_ewma_micros.load(Ordering::Relaxed);
        let next = if prev == 0 { sample } else { (prev * 7 + sample) / 8 };
        stats.read_latency_ewma_micros.store(next, Ordering::Relaxed);
    }

    async fn execute_read(
        &self,
        command: ReadCommand,
        cl: ConsistencyLevel,
        plan: ReadPlan,
        deadline: tokio::time::Instant,
    ) -> Result<QueryResult> {
        let started = tokio::time::Instant::now();
        let inner = &self.inner;
        let mut futs: FuturesUnordered<futures::future::BoxFuture<'static, Response>> =
            FuturesUnordered::new();

        // One full data read to the closest replica, digests elsewhere;
        // an always-speculating executor reads data from the first two.
        let data_count = match plan.speculative {
            SpecMode::Always => 2.min(plan.targets.len()),
            _ => 1,
        };
        for (i, ep) in plan.targets.iter().enumerate() {
            if i < data_count {
                futs.push(Box::pin(self.clone().data_read(*ep, command.clone())));
            } else {
                futs.push(Box::pin(self.clone().digest_read(*ep, command.clone())));
            }
        }
        if matches!(plan.speculative, SpecMode::Always) {
            if let Some(extra) = plan.extra {
                futs.push(Box::pin(self.clone().digest_read(extra, command.clone())));
            }
        }

        let spec_delay = match plan.speculative {
            SpecMode::After(delay) => Some(tokio::time::Instant::now() + delay),
            _ => None,
        };
        let can_speculate = !matches!(plan.speculative, SpecMode::Never);
        let mut speculated = false;

        let mut acc = DigestAccumulator::default();
        let outcome = loop {
            let next_spec = async {
                match spec_delay {
                    Some(at) if !speculated => tokio::time::sleep_until(at).await,
                    _ => futures::future::pending().await,
                }
            };
            tokio::select! {
                response = futs.next() => {
                    match response {
                        Some(response) => {
                            self.absorb_response(cl, &mut acc, response);
                            if acc.cl_responses >= plan.block_for && acc.data.is_some() {
                                break Ok(());
                            }
                        }
                        // Everyone queried has answered or failed without
                        // reaching the consistency level. Speculate at once
                        // if the policy allows, else surface the shortfall.
                        None => match plan.extra {
                            Some(extra) if can_speculate && !speculated => {
                                speculated = true;
                                tracing::trace!(%extra, "speculating an extra read");
                                metrics::counter!("coordinator_speculative_reads").increment(1);
                                futs.push(Box::pin(
                                    self.clone().data_read(extra, command.clone()),
                                ));
                            }
                            _ => {
                                break Err(Error::ReadTimeout {
                                    cl,
                                    received: acc.cl_responses,
                                    block_for: plan.block_for,
                                    data_present: acc.data.is_some(),
                                });
                            }
                        },
                    }
                }
                _ = next_spec => {
                    speculated = true;
                    if let Some(extra) = plan.extra {
                        tracing::trace!(%extra, "speculating an extra read");
                        metrics::counter!("coordinator_speculative_reads").increment(1);
                        futs.push(Box::pin(self.clone().data_read(extra, command.clone())));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    metrics::counter!("coordinator_read_timeouts").increment(1);
                    break Err(Error::ReadTimeout {
                        cl,
                        received: acc.cl_responses,
                        block_for: plan.block_for,
                        data_present: acc.data.is_some(),
                    });
                }
            }
        };
        outcome?;

        let matched = acc.digests_match();
        let Some((_, fast_result)) = acc.data.clone() else {
            return Err(Error::ServerError(
                "read completed without a data response".to_string(),
            ));
        };

        if matched {
            // Replicas beyond block_for may still disagree; keep checking
            // them off the request path.
            if !futs.is_empty() {
                self.spawn_background_digest_check(command.clone(), cl, futs, acc);
            }
            self.record_read_latency(started.elapsed());
            return Ok(fast_result);
        }

        tracing::trace!("digest mismatch, reconciling from mutation-level reads");
        metrics::counter!("coordinator_digest_mismatches").increment(1);
        drop(futs);

        // A datacenter-local consistency level limits repair fan-out to
        // the local datacenter while the divergence is recent enough to be
        // an in-flight write.
        let mut repair_targets = plan.targets.clone();
        if cl.is_datacenter_local() {
            let age_micros = (command.timestamp - acc.last_modified).abs();
            let write_timeout_micros = inner.cfg.write_timeout.as_micros() as i64;
            if age_micros <= write_timeout_micros {
                repair_targets.retain(|ep| {
                    inner.topology.datacenter(*ep) == inner.cfg.local_dc
                });
            }
        }

        let result = self
            .reconcile_from_replicas(command, cl, repair_targets, plan.repair, deadline)
            .await?;
        self.record_read_latency(started.elapsed());
        Ok(result)
    }

    fn absorb_response(
        &self,
        cl: ConsistencyLevel,
        acc: &mut DigestAccumulator,
        response: Response,
    ) {
        let inner = &self.inner;
        // A datacenter-local level waits only on local-datacenter
        // responses, though remote digests still join the comparison.
        let counts = |ep: Endpoint| {
            !cl.is_datacenter_local()
                || ep == inner.local
                || inner.topology.datacenter(ep) == inner.cfg.local_dc
        };
        match response {
            Response::Data(ep, Ok(resp)) => {
                acc.responses += 1;
                if counts(ep) {
                    acc.cl_responses += 1;
                }
                acc.last_modified = acc.last_modified.max(resp.result.last_modified);
                let digest = resp.digest.unwrap_or_else(|| resp.result.digest());
                acc.digests.push((ep, digest));
                if acc.data.is_none() {
                    acc.data = Some((ep, resp.result));
                }
            }
            Response::Digest(ep, Ok(resp)) => {
                acc.responses += 1;
                if counts(ep) {
                    acc.cl_responses += 1;
                }
                acc.last_modified = acc.last_modified.max(resp.last_modified);
                acc.digests.push((ep, resp.digest));
            }
            Response::Data(ep, Err(error)) | Response::Digest(ep, Err(error)) => {
                // Transport errors behave like a dead replica; anything
                // else is unexpected and logged.
                if error.is_transport() {
                    tracing::trace!(%ep, %error, "read request failed");
                } else {
                    tracing::error!(%ep, %error, "replica rejected read");
                }
            }
        }
    }

    async fn data_read(self, ep: Endpoint, command: ReadCommand) -> Response {
        let inner = &self.inner;
        let result = if ep == inner.local {
            match inner.engine.read(&command).await {
                Ok(result) => Ok(rpc::ReadDataResponse {
                    digest: Some(result.digest()),
                    result,
                }),
                Err(error) => Err(error),
            }
        } else {
            let req = ReadDataRequest {
                command,
                digest_requested: true,
            };
            inner
                .transport
                .read_data(ep, req, CallMeta::new(inner.local))
                .await
        };
        Response::Data(ep, result)
    }

    async fn digest_read(self, ep: Endpoint, command: ReadCommand) -> Response {
        let inner = &self.inner;
        let result = if ep == inner.local {
            match inner.engine.read(&command).await {
                Ok(result) => Ok(rpc::ReadDigestResponse {
                    digest: result.digest(),
                    last_modified: result.last_modified,
                }),
                Err(error) => Err(error),
            }
        } else {
            inner
                .transport
                .read_digest(ep, command, CallMeta::new(inner.local))
                .await
        };
        Response::Digest(ep, result)
    }

    /// Mutation-level read from every repair target, merged and repaired.
    /// Limit-driven retries grow the limits per the reconciler's verdict.
    async fn reconcile_from_replicas(
        &self,
        mut command: ReadCommand,
        cl: ConsistencyLevel,
        targets: Vec<Endpoint>,
        _decision: ReadRepairDecision,
        deadline: tokio::time::Instant,
    ) -> Result<QueryResult> {
        const MAX_RETRIES: usize = 2;
        for attempt in 0..=MAX_RETRIES {
            let replies = self
                .fetch_mutation_data(&command, &targets, cl, deadline)
                .await?;
            let reconciled = reconcile::resolve(&command, &replies);

            self.apply_repair_diffs(reconciled.diffs, deadline).await;

            match reconciled.retry {
                Some(retry) if attempt < MAX_RETRIES => {
                    match retry {
                        Retry::PerPartition(limit) => {
                            tracing::trace!(limit, "retrying with larger per-partition limit");
                            command.per_partition_limit = limit;
                        }
                        Retry::Total(limit) => {
                            tracing::trace!(limit, "retrying with larger row limit");
                            command.row_limit = limit;
                        }
                    }
                    continue;
                }
                _ => return Ok(reconciled.result),
            }
        }
        unreachable!("retry loop always returns");
    }

    async fn fetch_mutation_data(
        &self,
        command: &ReadCommand,
        targets: &[Endpoint],
        cl: ConsistencyLevel,
        deadline: tokio::time::Instant,
    ) -> Result<Vec<ReplicaReply>> {
        let inner = &self.inner;
        let calls = targets.iter().map(|ep| {
            let ep = *ep;
            let command = command.clone();
            let this = self.clone();
            async move {
                let result = if ep == this.inner.local {
                    this.inner.engine.read_reconcilable(&command).await
                } else {
                    this.inner
                        .transport
                        .read_mutation_data(ep, command, CallMeta::new(this.inner.local))
                        .await
                };
                result.map(|result| ReplicaReply { from: ep, result })
            }
        });
        let gathered = tokio::time::timeout_at(deadline, futures::future::join_all(calls))
            .await
            .map_err(|_| Error::ReadTimeout {
                cl,
                received: 0,
                block_for: targets.len(),
                data_present: true,
            })?;

        let mut replies = Vec::new();
        for outcome in gathered {
            match outcome {
                Ok(reply) => replies.push(reply),
                Err(error) if error.is_transport() => {
                    tracing::trace!(%error, "mutation-data read failed");
                }
                Err(error) => tracing::error!(%error, "mutation-data read rejected"),
            }
        }
        if replies.is_empty() {
            return Err(Error::ReadTimeout {
                cl,
                received: 0,
                block_for: targets.len(),
                data_present: false,
            });
        }
        Ok(replies)
    }

    // Write each replica the rows it is missing. Failures only cost a
    // future repair.
    async fn apply_repair_diffs(
        &self,
        diffs: Vec<(Endpoint, models::Mutation)>,
        deadline: tokio::time::Instant,
    ) {
        if diffs.is_empty() {
            return;
        }
        metrics::counter!("coordinator_read_repairs").increment(diffs.len() as u64);
        let writes = diffs.into_iter().map(|(ep, mutation)| {
            let this = self.clone();
            async move {
                let result = this
                    .mutate_to_fixed_targets(
                        mutation,
                        ConsistencyLevel::One,
                        models::WriteType::Simple,
                        vec![ep],
                    )
                    .await;
                if let Err(error) = result {
                    tracing::debug!(%ep, %error, "read-repair write failed");
                }
            }
        });
        let _ = tokio::time::timeout_at(deadline, futures::future::join_all(writes)).await;
    }

    // Replicas queried beyond block_for keep resolving after the caller
    // got its answer; a late mismatch triggers a background repair round.
    fn spawn_background_digest_check(
        &self,
        command: ReadCommand,
        cl: ConsistencyLevel,
        mut futs: FuturesUnordered<futures::future::BoxFuture<'static, Response>>,
        mut acc: DigestAccumulator,
    ) {
        let this = self.clone();
        this.inner.stats.background_reads.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("coordinator_background_reads").increment(1.0);
        tokio::spawn(async move {
            while let Some(response) = futs.next().await {
                this.absorb_response(cl, &mut acc, response);
            }
            if !acc.digests_match() {
                tracing::trace!("late digest mismatch, repairing in the background");
                let targets: Vec<Endpoint> = acc.digests.iter().map(|(ep, _)| *ep).collect();
                let deadline = tokio::time::Instant::now() + this.inner.cfg.read_timeout;
                if let Err(error) = this
                    .reconcile_from_replicas(
                        command,
                        cl,
                        targets,
                        ReadRepairDecision::Global,
                        deadline,
                    )
                    .await
                {
                    tracing::debug!(%error, "background read repair failed");
                }
            }
            this.inner.stats.background_reads.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!("coordinator_background_reads").decrement(1.0);
        });
    }

    pub fn background_reads(&self) -> usize {
        self.inner.stats.background_reads.load(Ordering::Relaxed)
    }
}
