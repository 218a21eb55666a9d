// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! End-to-end chunk migrations between two nodes on a loopback mesh, backed
//! by a shared in-memory config store.

use shard_node::comm::{self, LoopbackMesh, PeerChannel};
use shard_node::config_store::memory::MemoryConfigStore;
use shard_node::config_store::ConfigStore;
use shard_node::dbs::memory::MemoryStore;
use shard_node::messaging::{
    Error as ErrorMsg, MigratePhase, MigrationCmd, MigrationRsp, MoveChunk,
};
use shard_node::node::{Config, Error, Node};
use shard_node::types::{
    ChunkId, ChunkRange, ChunkRecord, ChunkVersion, Document, NodeId, ShardKeyPattern,
};

use assert_matches::assert_matches;
use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const NS: &str = "test.docs";
const CHUNK_ID: &str = "test.docs-x_MinKey";

fn fast_config() -> Config {
    Config {
        status_poll_interval: Duration::from_millis(3),
        steady_drain_interval: Duration::from_millis(1),
        cursor_poll_interval: Duration::from_millis(5),
        cursor_wait: Duration::from_secs(5),
        commit_wait: Duration::from_secs(10),
        ..Config::default()
    }
}

struct Cluster {
    config_store: Arc<MemoryConfigStore>,
    mesh: Arc<LoopbackMesh>,
    a: Arc<Node>,
    b: Arc<Node>,
    pattern: ShardKeyPattern,
}

impl Cluster {
    async fn new(config_a: Config, config_b: Config) -> Result<Self> {
        let config_store = Arc::new(MemoryConfigStore::new());
        let mesh = LoopbackMesh::new();
        let pattern = ShardKeyPattern::ascending("x");

        let a = Node::new(
            NodeId::from("shard-a"),
            config_a,
            Arc::new(MemoryStore::new()),
            config_store.clone(),
            mesh.clone(),
        );
        let b = Node::new(
            NodeId::from("shard-b"),
            config_b,
            Arc::new(MemoryStore::new()),
            config_store.clone(),
            mesh.clone(),
        );
        mesh.register(a.clone());
        mesh.register(b.clone());

        let cluster = Self {
            config_store,
            mesh,
            a,
            b,
            pattern,
        };
        cluster.seed_metadata().await?;
        Ok(cluster)
    }

    /// One chunk covering the whole key space, owned by `a` at version 1|0.
    async fn seed_metadata(&self) -> Result<()> {
        self.config_store
            .create_collection(NS, self.pattern.clone())
            .await?;
        self.config_store
            .insert_chunk(ChunkRecord {
                id: ChunkId::from(CHUNK_ID),
                ns: NS.to_string(),
                range: ChunkRange::full(&self.pattern),
                shard: self.a.id().clone(),
                lastmod: ChunkVersion::new(1, 0),
            })
            .await?;
        let _ = self.a.refresh_version(NS).await?;
        let _ = self.b.refresh_version(NS).await?;
        Ok(())
    }

    fn move_req(&self) -> MoveChunk {
        MoveChunk {
            ns: NS.to_string(),
            range: ChunkRange::full(&self.pattern),
            from: self.a.id().clone(),
            to: self.b.id().clone(),
            chunk_id: ChunkId::from(CHUNK_ID),
        }
    }

    async fn seed_docs(&self, count: i64) -> Result<()> {
        for i in 0..count {
            self.a.client_upsert(NS, doc_with_x(i, i)).await?;
        }
        Ok(())
    }

    async fn recipient_status(&self) -> Result<MigrationRsp> {
        Ok(self
            .mesh
            .send(self.b.id(), MigrationCmd::RecvChunkStatus)
            .await?)
    }

    /// Wait until the recipient worker has been dispatched.
    async fn wait_for_receive_start(&self) -> Result<()> {
        for _ in 0..1000 {
            if let MigrationRsp::Status(status) = self.recipient_status().await? {
                if status.active {
                    return Ok(());
                }
            }
            sleep(Duration::from_millis(1)).await;
        }
        Err(eyre!("recipient never became active"))
    }

    async fn wait_for_terminal_recipient(&self) -> Result<MigratePhase> {
        for _ in 0..2000 {
            if let MigrationRsp::Status(status) = self.recipient_status().await? {
                if !status.active {
                    return Ok(status.state);
                }
            }
            sleep(Duration::from_millis(1)).await;
        }
        Err(eyre!("recipient never reached a terminal state"))
    }
}

fn doc_with_x(id: i64, x: i64) -> Document {
    Document::new().with("_id", json!(id)).with("x", json!(x))
}

async fn wait_for_count(node: &Arc<Node>, expected: u64) -> Result<()> {
    for _ in 0..1000 {
        if node.store().count(NS).await? == expected {
            return Ok(());
        }
        sleep(Duration::from_millis(5)).await;
    }
    Err(eyre!(
        "count on {} never reached {}",
        node.id(),
        expected
    ))
}

// S1: the whole collection moves; ownership, data and the write path follow.
#[tokio::test(flavor = "multi_thread")]
async fn moving_the_only_chunk_hands_everything_over() -> Result<()> {
    let cluster = Cluster::new(fast_config(), fast_config()).await?;
    cluster.seed_docs(100).await?;

    let version = cluster.a.clone().move_chunk(cluster.move_req()).await?;
    assert_eq!(version, ChunkVersion::new(2, 0));

    // the config store shows the new owner at the bumped version
    let record = cluster.config_store.chunk(&ChunkId::from(CHUNK_ID)).await?;
    assert_eq!(record.shard, *cluster.b.id());
    assert_eq!(record.lastmod, ChunkVersion::new(2, 0));

    // no cursors were open, so the donor deleted inline
    assert_eq!(cluster.a.store().count(NS).await?, 0);
    assert_eq!(cluster.b.store().count(NS).await?, 100);

    // a write to the donor bounces with the version the router must refresh
    // past; the recipient takes it after a refresh
    let refused = cluster.a.client_upsert(NS, doc_with_x(1000, 42)).await;
    assert_matches!(refused, Err(Error::StaleConfig { version }) => {
        assert!(version >= ChunkVersion::new(2, 0));
    });
    let _ = cluster.b.refresh_version(NS).await?;
    cluster.b.client_upsert(NS, doc_with_x(1000, 42)).await?;
    assert_eq!(cluster.b.store().count(NS).await?, 101);

    // the handoff is in the changelog
    let log = cluster.config_store.changelog(NS).await?;
    assert!(log.iter().any(|entry| entry.event == "moveChunk.start"));
    assert!(log.iter().any(|entry| entry.event == "moveChunk.commit"));
    assert!(log.iter().any(|entry| entry.event == "moveChunk.from"));
    assert!(log.iter().any(|entry| entry.event == "moveChunk.to"));
    Ok(())
}

// S2 + invariant 3: writes racing the migration are reflected on the
// recipient exactly once, whether they flow through the tap or come back as
// writebacks.
#[tokio::test(flavor = "multi_thread")]
async fn racing_writes_arrive_exactly_once() -> Result<()> {
    let mut config_a = fast_config();
    // small clone batches keep the clone phase long enough to race against
    config_a.clone_batch_bytes = 2048;
    let cluster = Cluster::new(config_a, fast_config()).await?;
    cluster.seed_docs(2000).await?;

    let driver = {
        let node = cluster.a.clone();
        let req = cluster.move_req();
        tokio::spawn(async move { node.move_chunk(req).await })
    };
    cluster.wait_for_receive_start().await?;

    // 20 client inserts land mid-migration
    let writes = (0..20).map(|i| {
        let node = cluster.a.clone();
        async move { node.client_upsert(NS, doc_with_x(5000 + i, 50 + i)).await }
    });
    let outcomes = join_all(writes).await;

    let version = driver.await??;
    assert_eq!(version, ChunkVersion::new(2, 0));
    let _ = cluster.b.refresh_version(NS).await?;

    // whatever bounced was captured; replay it the way the router would
    let mut refused = 0u64;
    for outcome in outcomes {
        match outcome {
            Ok(()) => {}
            Err(Error::StaleConfig { .. }) => refused += 1,
            Err(other) => return Err(eyre!("unexpected write outcome: {}", other)),
        }
    }
    let notes = match cluster
        .mesh
        .send(cluster.a.id(), MigrationCmd::FetchWritebacks)
        .await?
    {
        MigrationRsp::Writebacks(notes) => notes,
        other => return Err(eyre!("unexpected response: {:?}", other)),
    };
    assert_eq!(notes.len() as u64, refused);
    for note in notes {
        match note.op {
            shard_node::node::writeback::WritebackOp::Upsert(doc) => {
                cluster.b.client_upsert(&note.ns, doc).await?;
            }
            shard_node::node::writeback::WritebackOp::Delete(id) => {
                let _ = cluster.b.client_delete(&note.ns, &id).await?;
            }
        }
    }

    // every acknowledged write is on the recipient exactly once
    wait_for_count(&cluster.a, 0).await?;
    assert_eq!(cluster.b.store().count(NS).await?, 2020);
    for i in 0..20 {
        let id = doc_with_x(5000 + i, 0).id().expect("doc has an _id");
        assert!(cluster.b.store().find_by_id(NS, &id).await?.is_some());
    }
    Ok(())
}

// S3: the delta buffer outgrows its ceiling; the donor aborts, advises a
// split, and ownership is untouched. Afterwards (invariant 6) a new
// migration's pre-clean erases whatever the aborted one left behind.
#[tokio::test(flavor = "multi_thread")]
async fn buffer_overflow_aborts_and_leaves_ownership_alone() -> Result<()> {
    let mut config_a = fast_config();
    config_a.max_buffer_bytes = 1;
    config_a.clone_batch_bytes = 512;
    let cluster = Cluster::new(config_a, fast_config()).await?;
    cluster.seed_docs(4000).await?;

    let driver = {
        let mesh = cluster.mesh.clone();
        let to = cluster.a.id().clone();
        let req = cluster.move_req();
        tokio::spawn(async move { mesh.send(&to, MigrationCmd::MoveChunk(req)).await })
    };
    cluster.wait_for_receive_start().await?;

    // buffered deltas now exceed the (tiny) ceiling
    for i in 0..20 {
        cluster.a.client_upsert(NS, doc_with_x(9000 + i, i)).await?;
    }

    let rsp = driver.await??;
    let cause = rsp.failure().ok_or_else(|| eyre!("move should have failed"))?;
    assert_matches!(cause, ErrorMsg::TooMuchMemory { .. });
    assert!(cause.split_advised());

    // nothing moved: same owner, same version, donor still takes writes
    let record = cluster.config_store.chunk(&ChunkId::from(CHUNK_ID)).await?;
    assert_eq!(record.shard, *cluster.a.id());
    assert_eq!(record.lastmod, ChunkVersion::new(1, 0));
    assert!(!cluster.a.migration_active());
    cluster.a.client_upsert(NS, doc_with_x(9999, 60)).await?;
    let terminal = cluster.wait_for_terminal_recipient().await?;
    assert_matches!(terminal, MigratePhase::Abort | MigratePhase::Fail);

    // plant garbage on the recipient, as the aborted clone did, and retry:
    // the new attempt's pre-clean must erase it. With no writes racing the
    // retry the buffer stays empty, so even the tiny ceiling holds.
    cluster
        .b
        .store()
        .upsert(
            NS,
            doc_with_x(77777, 42),
            shard_node::dbs::WriteOrigin::Replication,
        )
        .await?;
    let version = cluster.a.clone().move_chunk(cluster.move_req()).await?;
    assert_eq!(version, ChunkVersion::new(2, 0));

    wait_for_count(&cluster.b, 4021).await?;
    let leftover = doc_with_x(77777, 0).id().expect("doc has an _id");
    assert!(cluster.b.store().find_by_id(NS, &leftover).await?.is_none());
    Ok(())
}

// S4: stale bounds are refused with both views and without any state change.
#[tokio::test(flavor = "multi_thread")]
async fn outdated_bounds_are_refused_with_both_views() -> Result<()> {
    let cluster = Cluster::new(fast_config(), fast_config()).await?;
    cluster.seed_docs(10).await?;

    let mut req = cluster.move_req();
    req.range = ChunkRange::new(
        cluster.pattern.global_min(),
        shard_node::types::ShardKey(vec![shard_node::types::KeyValue::Number(100.0)]),
    );
    let requested = req.range.clone();

    let rsp = cluster
        .mesh
        .send(cluster.a.id(), MigrationCmd::MoveChunk(req))
        .await?;
    let cause = rsp.failure().ok_or_else(|| eyre!("move should have failed"))?;
    assert_matches!(cause, ErrorMsg::StaleBounds { curr, requested: seen } => {
        assert_eq!(*curr, ChunkRange::full(&cluster.pattern));
        assert_eq!(*seen, requested);
    });

    assert!(!cluster.a.migration_active());
    assert_eq!(cluster.a.store().count(NS).await?, 10);
    cluster.a.client_upsert(NS, doc_with_x(100, 1)).await?;
    Ok(())
}

/// Fails `_recvChunkCommit` in flight, everything else passes through.
struct CommitFailingMesh {
    inner: Arc<LoopbackMesh>,
}

#[async_trait]
impl PeerChannel for CommitFailingMesh {
    async fn send(&self, to: &NodeId, cmd: MigrationCmd) -> comm::Result<MigrationRsp> {
        if matches!(cmd, MigrationCmd::RecvChunkCommit) {
            return Ok(MigrationRsp::Failure(ErrorMsg::Internal(
                "injected commit failure".to_string(),
            )));
        }
        self.inner.send(to, cmd).await
    }
}

// S5: a failed commit rolls the donation back; the caller sees the peer
// failure and the donor still owns the chunk at the old version.
#[tokio::test(flavor = "multi_thread")]
async fn failed_commit_restores_local_ownership() -> Result<()> {
    let config_store = Arc::new(MemoryConfigStore::new());
    let inner = LoopbackMesh::new();
    let pattern = ShardKeyPattern::ascending("x");

    let a = Node::new(
        NodeId::from("shard-a"),
        fast_config(),
        Arc::new(MemoryStore::new()),
        config_store.clone(),
        Arc::new(CommitFailingMesh {
            inner: inner.clone(),
        }),
    );
    let b = Node::new(
        NodeId::from("shard-b"),
        fast_config(),
        Arc::new(MemoryStore::new()),
        config_store.clone(),
        inner.clone(),
    );
    inner.register(a.clone());
    inner.register(b.clone());

    config_store.create_collection(NS, pattern.clone()).await?;
    config_store
        .insert_chunk(ChunkRecord {
            id: ChunkId::from(CHUNK_ID),
            ns: NS.to_string(),
            range: ChunkRange::full(&pattern),
            shard: a.id().clone(),
            lastmod: ChunkVersion::new(1, 0),
        })
        .await?;
    let _ = a.refresh_version(NS).await?;
    for i in 0..50 {
        a.client_upsert(NS, doc_with_x(i, i)).await?;
    }

    let req = MoveChunk {
        ns: NS.to_string(),
        range: ChunkRange::full(&pattern),
        from: a.id().clone(),
        to: b.id().clone(),
        chunk_id: ChunkId::from(CHUNK_ID),
    };
    let err = a
        .clone()
        .move_chunk(req)
        .await
        .expect_err("commit was injected to fail");
    assert_matches!(err, Error::PeerFailed { cmd, .. } => {
        assert_eq!(cmd, "_recvChunkCommit");
    });

    // ownership restored at the pre-bump version, critical section cleared
    let record = config_store.chunk(&ChunkId::from(CHUNK_ID)).await?;
    assert_eq!(record.shard, *a.id());
    assert_eq!(record.lastmod, ChunkVersion::new(1, 0));
    assert_eq!(a.versions().get_version(NS), ChunkVersion::new(1, 0));
    assert!(!a.migration_active());
    a.client_upsert(NS, doc_with_x(500, 25)).await?;
    assert_eq!(a.store().count(NS).await?, 51);
    Ok(())
}

// S6: cleanup waits for cursors that predate the cutover, without delaying
// the caller.
#[tokio::test(flavor = "multi_thread")]
async fn cleanup_waits_for_pre_cutover_cursors() -> Result<()> {
    let cluster = Cluster::new(fast_config(), fast_config()).await?;
    cluster.seed_docs(50).await?;

    let c1 = cluster.a.cursors().open(NS);
    let c2 = cluster.a.cursors().open(NS);
    let c3 = cluster.a.cursors().open(NS);

    let version = cluster.a.clone().move_chunk(cluster.move_req()).await?;
    assert_eq!(version, ChunkVersion::new(2, 0));

    // the caller already has its answer, but the data waits on the cursors
    assert_eq!(cluster.a.store().count(NS).await?, 50);
    cluster.a.cursors().close(NS, c1);
    cluster.a.cursors().close(NS, c2);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.a.store().count(NS).await?, 50);

    cluster.a.cursors().close(NS, c3);
    wait_for_count(&cluster.a, 0).await?;
    assert_eq!(cluster.b.store().count(NS).await?, 50);
    Ok(())
}

// Boundary: an empty source range still runs to done.
#[tokio::test(flavor = "multi_thread")]
async fn empty_range_migrates_to_done() -> Result<()> {
    let cluster = Cluster::new(fast_config(), fast_config()).await?;

    let version = cluster.a.clone().move_chunk(cluster.move_req()).await?;
    assert_eq!(version, ChunkVersion::new(2, 0));

    let terminal = cluster.wait_for_terminal_recipient().await?;
    assert_eq!(terminal, MigratePhase::Done);
    let status = match cluster.recipient_status().await? {
        MigrationRsp::Status(status) => status,
        other => return Err(eyre!("unexpected response: {:?}", other)),
    };
    assert_eq!(status.counts.cloned, 0);
    Ok(())
}

// Cancellation is checked before anything is set up.
#[tokio::test(flavor = "multi_thread")]
async fn interrupted_move_unwinds_immediately() -> Result<()> {
    let cluster = Cluster::new(fast_config(), fast_config()).await?;
    cluster.seed_docs(5).await?;

    cluster.a.interrupt();
    let err = cluster
        .a
        .clone()
        .move_chunk(cluster.move_req())
        .await
        .expect_err("the move was interrupted");
    assert_matches!(err, Error::Interrupted);
    assert!(!cluster.a.migration_active());
    Ok(())
}

// A held namespace lock bounces the move and names the holder.
#[tokio::test(flavor = "multi_thread")]
async fn held_lock_names_the_holder() -> Result<()> {
    let cluster = Cluster::new(fast_config(), fast_config()).await?;

    let token = cluster
        .config_store
        .acquire_lock(NS, "balancer-7", Duration::from_secs(30))
        .await?;
    let err = cluster
        .a
        .clone()
        .move_chunk(cluster.move_req())
        .await
        .expect_err("the lock is taken");
    assert_matches!(err, Error::LockBusy { holder } => {
        assert_eq!(holder, "balancer-7");
    });
    cluster.config_store.release_lock(&token).await?;
    Ok(())
}
