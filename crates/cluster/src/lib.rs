//! Node lifecycle: bootstrap, join, decommission, move, removenode, and
//! rebuild, plus the gossip-driven membership bookkeeping that keeps every
//! component's view of the ring current.

mod config;
mod controller;
mod external;

pub use config::{Config, EncryptionOptions, FailurePolicy, SnitchConfig};
pub use controller::{Cluster, Mode, NATIVE_FEATURES};
pub use external::{
    BootstrapState, MemSystemTables, NoopStreamer, PeerInfo, Streamer, SystemTables, TransferPlan,
};

#[cfg(test)]
mod test {
    use super::*;
    use coordinator::{MemStore, NoHints};
    use models::{Endpoint, KeyspaceDef};
    use partition::Token;
    use placement::SimpleTopology;
    use rpc::LoopbackTransport;
    use std::sync::Arc;
    use std::time::Duration;

    fn ep(s: &str) -> Endpoint {
        Endpoint::parse(s).unwrap()
    }

    struct Node {
        cluster: Cluster,
        streamer: Arc<NoopStreamer>,
        system: Arc<MemSystemTables>,
    }

    fn make_node(
        mesh: &LoopbackTransport,
        addr: &str,
        seeds: &[&str],
        initial_token: u64,
    ) -> Node {
        let cfg = Config {
            cluster_name: "lifecycle-test".to_string(),
            listen_address: addr.to_string(),
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
            num_tokens: 1,
            initial_token: Some(initial_token.to_string()),
            ring_delay_ms: Duration::from_millis(50),
            shutdown_announce_in_ms: Duration::from_millis(10),
            skip_wait_for_gossip_to_settle: true,
            ..Config::default()
        };
        let streamer = Arc::new(NoopStreamer::default());
        let system = Arc::new(MemSystemTables::new());
        let cluster = Cluster::new(
            cfg,
            Arc::new(mesh.clone()),
            Arc::new(MemStore::new()),
            system.clone(),
            streamer.clone(),
            Arc::new(SimpleTopology::new("datacenter1", "rack1")),
            Arc::new(NoHints),
        )
        .unwrap();
        cluster
            .schema()
            .add_keyspace(KeyspaceDef::simple("ks", 2))
            .unwrap();
        mesh.bind(cluster.local_endpoint(), cluster.message_sink());
        Node {
            cluster,
            streamer,
            system,
        }
    }

    async fn settle(nodes: &[&Node], rounds: usize) {
        for _ in 0..rounds {
            for node in nodes {
                node.cluster.gossiper().tick().await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_node_joins_an_empty_ring_directly() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);

        a.cluster.join_cluster().await.unwrap();
        assert_eq!(a.cluster.mode(), Mode::Normal);
        assert!(a.cluster.token_metadata().is_member(ep("10.0.0.1")));
        // Nothing to stream into an empty ring.
        assert_eq!(*a.streamer.bootstraps.lock().unwrap(), 0);
        assert_eq!(
            a.system.load_tokens(),
            vec![Token::from_u64(100)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_bootstraps_and_becomes_a_member_everywhere() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();

        let b = make_node(&mesh, "10.0.0.2", &["10.0.0.1"], 5000);
        let join = {
            let cluster = b.cluster.clone();
            tokio::spawn(async move { cluster.join_cluster().await })
        };
        // Drive gossip while B walks through its join.
        for _ in 0..40 {
            a.cluster.gossiper().tick().await;
            b.cluster.gossiper().tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if join.is_finished() {
                break;
            }
        }
        join.await.unwrap().unwrap();
        assert_eq!(b.cluster.mode(), Mode::Normal);
        assert_eq!(*b.streamer.bootstraps.lock().unwrap(), 1);

        settle(&[&a, &b], 4).await;
        assert!(a.cluster.token_metadata().is_member(ep("10.0.0.2")));
        assert!(b.cluster.token_metadata().is_member(ep("10.0.0.1")));

        // A's peers table learned B's host id.
        let peers = a.system.peers();
        assert_eq!(
            peers.get(&ep("10.0.0.2")).and_then(|p| p.host_id),
            Some(b.cluster.host_id())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn decommissioned_node_is_excised_from_the_ring() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();
        let b = make_node(&mesh, "10.0.0.2", &["10.0.0.1"], 9000);
        let join = {
            let cluster = b.cluster.clone();
            tokio::spawn(async move { cluster.join_cluster().await })
        };
        for _ in 0..40 {
            a.cluster.gossiper().tick().await;
            b.cluster.gossiper().tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if join.is_finished() {
                break;
            }
        }
        join.await.unwrap().unwrap();
        settle(&[&a, &b], 4).await;

        let decommission = {
            let cluster = b.cluster.clone();
            tokio::spawn(async move { cluster.decommission().await })
        };
        for _ in 0..40 {
            a.cluster.gossiper().tick().await;
            b.cluster.gossiper().tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if decommission.is_finished() {
                break;
            }
        }
        decommission.await.unwrap().unwrap();
        assert_eq!(b.cluster.mode(), Mode::Decommissioned);

        settle(&[&a], 4).await;
        assert!(!a.cluster.token_metadata().is_member(ep("10.0.0.2")));
    }

    // Inject a peer's endpoint state directly into A's gossiper, as if it
    // had arrived in an exchange.
    async fn inject_status(a: &Node, addr: &str, generation: i64, version: i64, status: models::Status) {
        let mut st = models::EndpointState::new(generation);
        st.heartbeat.version = version;
        st.set(
            models::ApplicationState::Status,
            models::VersionedValue::new(status.to_wire(), version),
        );
        a.cluster
            .gossiper()
            .apply_state_locally(vec![(ep(addr), st)])
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn decommission_refuses_while_ranges_move_toward_the_node() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();

        // Two more members, then one of them starts leaving: with rf=2
        // over three nodes, ranges start flowing toward A.
        inject_status(
            &a,
            "10.0.0.8",
            7,
            1,
            models::Status::Normal(vec![Token::from_u64(30_000)]),
        )
        .await;
        inject_status(
            &a,
            "10.0.0.9",
            7,
            1,
            models::Status::Normal(vec![Token::from_u64(50_000)]),
        )
        .await;
        assert!(a.cluster.token_metadata().is_member(ep("10.0.0.9")));

        inject_status(
            &a,
            "10.0.0.9",
            7,
            5,
            models::Status::Leaving(vec![Token::from_u64(50_000)]),
        )
        .await;

        let err = a.cluster.decommission().await.unwrap_err();
        assert!(err.to_string().contains("moving to this node"));
    }

    #[tokio::test(start_paused = true)]
    async fn removenode_waits_for_replication_acks_then_excises() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();
        let b = make_node(&mesh, "10.0.0.2", &["10.0.0.1"], 40_000);
        let c = make_node(&mesh, "10.0.0.3", &["10.0.0.1"], 80_000);
        for node in [&b, &c] {
            let join = {
                let cluster = node.cluster.clone();
                tokio::spawn(async move { cluster.join_cluster().await })
            };
            for _ in 0..40 {
                a.cluster.gossiper().tick().await;
                b.cluster.gossiper().tick().await;
                c.cluster.gossiper().tick().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                if join.is_finished() {
                    break;
                }
            }
            join.await.unwrap().unwrap();
        }
        settle(&[&a, &b, &c], 6).await;
        let c_host = c.cluster.host_id();
        assert!(a.cluster.token_metadata().is_member(ep("10.0.0.3")));

        // C goes away: it announces shutdown (so A and B mark it down)
        // and then drops off the network entirely.
        c.cluster.gossiper().stop().await;
        mesh.isolate(ep("10.0.0.3"));
        assert!(!a.cluster.gossiper().is_alive(ep("10.0.0.3")));

        let removal = {
            let cluster = a.cluster.clone();
            tokio::spawn(async move { cluster.remove_node(c_host).await })
        };
        for _ in 0..60 {
            a.cluster.gossiper().tick().await;
            b.cluster.gossiper().tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if removal.is_finished() {
                break;
            }
        }
        removal.await.unwrap().unwrap();

        // The survivors re-replicated C's ranges and every node excised
        // its tokens.
        assert!(!a.cluster.token_metadata().is_member(ep("10.0.0.3")));
        settle(&[&a, &b], 6).await;
        assert!(!b.cluster.token_metadata().is_member(ep("10.0.0.3")));
        assert!(b.streamer.restored.lock().unwrap().contains(&ep("10.0.0.3")));
    }

    #[tokio::test(start_paused = true)]
    async fn removenode_refuses_live_nodes() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();
        let b = make_node(&mesh, "10.0.0.2", &["10.0.0.1"], 40_000);
        let join = {
            let cluster = b.cluster.clone();
            tokio::spawn(async move { cluster.join_cluster().await })
        };
        for _ in 0..40 {
            a.cluster.gossiper().tick().await;
            b.cluster.gossiper().tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if join.is_finished() {
                break;
            }
        }
        join.await.unwrap().unwrap();
        settle(&[&a, &b], 4).await;

        let err = a
            .cluster
            .remove_node(b.cluster.host_id())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("alive"));
    }

    #[tokio::test(start_paused = true)]
    async fn single_token_move_lands_on_the_new_token() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();
        let b = make_node(&mesh, "10.0.0.2", &["10.0.0.1"], 40_000);
        let join = {
            let cluster = b.cluster.clone();
            tokio::spawn(async move { cluster.join_cluster().await })
        };
        for _ in 0..40 {
            a.cluster.gossiper().tick().await;
            b.cluster.gossiper().tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if join.is_finished() {
                break;
            }
        }
        join.await.unwrap().unwrap();
        settle(&[&a, &b], 4).await;

        let target = Token::from_u64(70_000);
        let moved = {
            let cluster = b.cluster.clone();
            let target = target.clone();
            tokio::spawn(async move { cluster.move_token(target).await })
        };
        for _ in 0..40 {
            a.cluster.gossiper().tick().await;
            b.cluster.gossiper().tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if moved.is_finished() {
                break;
            }
        }
        moved.await.unwrap().unwrap();
        assert_eq!(b.cluster.mode(), Mode::Normal);
        assert_eq!(
            b.cluster.token_metadata().tokens_of(ep("10.0.0.2")),
            vec![target.clone()]
        );

        settle(&[&a, &b], 4).await;
        assert_eq!(
            a.cluster.token_metadata().tokens_of(ep("10.0.0.2")),
            vec![target]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_node_assumes_the_dead_nodes_tokens() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();

        // A dead peer known only through gossip, with tokens.
        let dead = ep("10.0.0.4");
        let dead_token = Token::from_u64(60_000);
        {
            let mut st = models::EndpointState::new(3);
            st.set(
                models::ApplicationState::Tokens,
                models::VersionedValue::new(models::tokens_wire(&[dead_token.clone()]), 1),
            );
            st.set(
                models::ApplicationState::Status,
                models::VersionedValue::new(
                    models::Status::Normal(vec![dead_token.clone()]).to_wire(),
                    2,
                ),
            );
            a.cluster.gossiper().apply_state_locally(vec![(dead, st)]).await;
        }
        assert!(a.cluster.token_metadata().is_member(dead));

        // The replacement points at the dead address.
        let cfg = Config {
            cluster_name: "lifecycle-test".to_string(),
            listen_address: "10.0.0.5".to_string(),
            seeds: vec!["10.0.0.1".to_string()],
            replace_address: Some("10.0.0.4".to_string()),
            ring_delay_ms: Duration::from_millis(50),
            shutdown_announce_in_ms: Duration::from_millis(10),
            skip_wait_for_gossip_to_settle: true,
            ..Config::default()
        };
        let streamer = Arc::new(NoopStreamer::default());
        let replacement = Cluster::new(
            cfg,
            Arc::new(mesh.clone()),
            Arc::new(MemStore::new()),
            Arc::new(MemSystemTables::new()),
            streamer.clone(),
            Arc::new(SimpleTopology::new("datacenter1", "rack1")),
            Arc::new(NoHints),
        )
        .unwrap();
        replacement
            .schema()
            .add_keyspace(KeyspaceDef::simple("ks", 2))
            .unwrap();
        mesh.bind(replacement.local_endpoint(), replacement.message_sink());

        let join = {
            let cluster = replacement.clone();
            tokio::spawn(async move { cluster.join_cluster().await })
        };
        for _ in 0..40 {
            a.cluster.gossiper().tick().await;
            replacement.gossiper().tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if join.is_finished() {
                break;
            }
        }
        join.await.unwrap().unwrap();
        assert_eq!(replacement.mode(), Mode::Normal);
        assert_eq!(*streamer.bootstraps.lock().unwrap(), 1);
        assert_eq!(
            replacement.token_metadata().tokens_of(ep("10.0.0.5")),
            vec![dead_token.clone()]
        );

        // The ring sees the token under its new address and drops the
        // dead one.
        settle(&[&a], 6).await;
        assert_eq!(
            a.cluster.token_metadata().tokens_of(ep("10.0.0.5")),
            vec![dead_token]
        );
        assert!(!a.cluster.token_metadata().is_member(ep("10.0.0.4")));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_walks_through_draining_to_drained() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();
        assert_eq!(a.cluster.mode(), Mode::Normal);

        a.cluster.drain().await.unwrap();
        assert_eq!(a.cluster.mode(), Mode::Drained);
        assert!(!a.cluster.gossiper().is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_streams_without_touching_membership() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();

        a.cluster.rebuild(Some("dc2".to_string())).await.unwrap();
        assert!(a.cluster.token_metadata().is_member(ep("10.0.0.1")));
        assert_eq!(a.cluster.mode(), Mode::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_stop_policy_isolates() {
        let mesh = LoopbackTransport::new();
        let a = make_node(&mesh, "10.0.0.1", &[], 100);
        a.cluster.join_cluster().await.unwrap();

        a.cluster
            .on_storage_failure(FailurePolicy::Ignore, &"corrupt sstable");
        assert!(!a.cluster.is_isolated());

        a.cluster
            .on_storage_failure(FailurePolicy::Stop, &"commitlog write failure");
        assert!(a.cluster.is_isolated());
    }
}
