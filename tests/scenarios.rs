//! End-to-end sessions over the in-process hub

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lockstep::config::{FrameConfig, LockstepConfig, NodeRole};
use lockstep::context::ExecutionContext;
use lockstep::error::Error;
use lockstep::id::Version;
use lockstep::network::{Delivery, LocalHub, NetworkServer, PeerTable, Transport, CHANNEL_CAPACITY};
use lockstep::replication::{Authoritative, Message, Mirror, ReplicationDirectory};
use lockstep::runtime::{pump, AuthoringNode, JoinOptions, RenderNode};
use lockstep::scene::{CacheSweeper, FrameState, InitData, InputEvent};
use lockstep::state::{Election, MaintenanceElection, ResourceScope};

type Node = RenderNode<InitData, FrameState, CacheSweeper, ()>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Spin {
    angle: f32,
}

fn frame_config(barrier_timeout_ms: u64) -> FrameConfig {
    FrameConfig {
        target_fps: 0,
        barrier_timeout_ms,
        ..FrameConfig::default()
    }
}

async fn start_author(hub: &Arc<LocalHub>, barrier_timeout_ms: u64) -> AuthoringNode<InitData, FrameState> {
    let (transport, inbox) = hub.connect("authoring").await;
    AuthoringNode::start(
        transport,
        inbox,
        InitData::new("teapot", 3),
        FrameState::default(),
        &frame_config(barrier_timeout_ms),
    )
    .await
    .unwrap()
}

fn spawn_join(hub: &Arc<LocalHub>, node_id: &str, contexts: usize) -> JoinHandle<Node> {
    let hub = Arc::clone(hub);
    let node_id = node_id.to_string();
    tokio::spawn(async move {
        RenderNode::join_local(
            &hub,
            &node_id,
            "authoring",
            JoinOptions::default(),
            CacheSweeper::new(16),
            vec![(); contexts],
        )
        .await
        .unwrap()
    })
}

/// Render every frame until the session ends; returns the frames rendered
fn spawn_render_loop(mut node: Node) -> JoinHandle<(Vec<u64>, Node)> {
    tokio::spawn(async move {
        let mut frames = Vec::new();
        while let Some(token) = node.next_frame().await.unwrap() {
            let yaws = node
                .render_frame(|ctx| {
                    let frame = ctx.frame();
                    ctx.run_node_maintenance(|cache| cache.sweep(frame)).unwrap();
                    ctx.current_state().camera.yaw
                })
                .unwrap();
            assert!(yaws.windows(2).all(|w| w[0] == w[1]));

            node.complete_frame().await.unwrap();
            frames.push(token.frame);
        }
        (frames, node)
    })
}

/// Mirror process whose inbox is drained by the render pump
async fn mirror_process(hub: &Arc<LocalHub>, node_id: &str) -> (Arc<ReplicationDirectory>, JoinHandle<()>) {
    let (transport, inbox) = hub.connect(node_id).await;
    let directory = Arc::new(ReplicationDirectory::new(transport));
    let (signals, _) = mpsc::channel(16);
    let pump = tokio::spawn(pump::run_render_pump(
        inbox,
        Arc::clone(&directory),
        "authoring".to_string(),
        signals,
    ));
    (directory, pump)
}

async fn mirror_when_known<T: serde::de::DeserializeOwned>(
    directory: &ReplicationDirectory,
    id: lockstep::id::ObjectId,
) -> Mirror<T> {
    lockstep::runtime::mirror_with_retry(directory, id, 50, Duration::from_millis(10))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_two_mirrors_observe_first_commit() {
    let hub = LocalHub::new();
    let (transport, _inbox) = hub.connect("authoring").await;
    let (m1, _p1) = mirror_process(&hub, "m1").await;
    let (m2, _p2) = mirror_process(&hub, "m2").await;

    let author = ReplicationDirectory::new(transport);
    let mut spin = Authoritative::new(Spin { angle: 0.0 });
    let id = author.publish(&mut spin).await.unwrap();
    assert_eq!(spin.version(), Version(1));

    for directory in [&m1, &m2] {
        let mut mirror: Mirror<Spin> = mirror_when_known(directory, id).await;
        assert_eq!(mirror.synchronize(Version(1)).await.unwrap(), Version(1));
        assert_eq!(mirror.get(), &Spin { angle: 0.0 });
    }
}

#[tokio::test]
async fn test_slow_mirror_skips_to_newest_commit() {
    let hub = LocalHub::new();
    let (transport, _inbox) = hub.connect("authoring").await;
    let (slow, mut slow_inbox) = hub.connect("slow").await;
    let mirror_dir = ReplicationDirectory::new(slow);

    let author = ReplicationDirectory::new(transport);
    let mut spin = Authoritative::new(Spin { angle: 0.0 });
    let id = author.publish(&mut spin).await.unwrap();

    let mut received = Vec::new();
    let mut next = || match slow_inbox.try_recv() {
        Ok(Delivery::Message { message, .. }) => message,
        other => panic!("Unexpected delivery: {:?}", other),
    };

    mirror_dir.apply(&next()).await.unwrap();
    let mut mirror: Mirror<Spin> = mirror_dir.mirror(id).await.unwrap();
    let published = mirror.version();

    // Two commits land before the mirror gets around to synchronizing
    spin.get_mut().angle = 45.0;
    let intermediate = author.commit(&mut spin).await.unwrap();
    spin.get_mut().angle = 90.0;
    let newest = author.commit(&mut spin).await.unwrap();
    assert!(published < intermediate && intermediate < newest);

    received.push(next());
    received.push(next());
    for message in &received {
        mirror_dir.apply(message).await.unwrap();
    }

    assert_eq!(mirror.synchronize(intermediate).await.unwrap(), newest);
    assert_eq!(mirror.get(), &Spin { angle: 90.0 });

    // The intermediate snapshot arriving again changes nothing
    mirror_dir.apply(&received[0]).await.unwrap();
    assert_eq!(mirror.refresh().unwrap(), newest);
    assert_eq!(mirror.get(), &Spin { angle: 90.0 });
    assert_eq!(mirror_dir.latest_version(id).await, Some(newest));
}

#[test]
fn test_one_owner_releases_waiters() {
    let election = Arc::new(MaintenanceElection::new(Some(Duration::from_secs(5))));
    election.begin_epoch(1);
    let scope = ResourceScope::node("nodeA");
    let start = Arc::new(Barrier::new(3));
    let finished = Arc::new(AtomicBool::new(false));
    let owners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let election = Arc::clone(&election);
            let scope = scope.clone();
            let start = Arc::clone(&start);
            let finished = Arc::clone(&finished);
            let owners = Arc::clone(&owners);
            thread::spawn(move || {
                start.wait();
                match election.elect(&scope) {
                    Election::Owner(lease) => {
                        owners.fetch_add(1, Ordering::SeqCst);
                        finished.store(true, Ordering::SeqCst);
                        lease.finish().unwrap();
                        None
                    }
                    Election::Follower => {
                        let yields = election.wait_until_finished(&scope).unwrap();
                        assert!(finished.load(Ordering::SeqCst));
                        Some(yields)
                    }
                }
            })
        })
        .collect();

    let waited: Vec<u64> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(owners.load(Ordering::SeqCst), 1);
    assert_eq!(waited.len(), 2);
    assert!(waited.iter().all(|yields| *yields < 50_000_000));
}

#[test]
fn test_owner_that_never_finishes_times_out() {
    let election = MaintenanceElection::new(Some(Duration::from_millis(20)));
    election.begin_epoch(3);
    let scope = ResourceScope::context("nodeA", 1);

    let _lease = match election.elect(&scope) {
        Election::Owner(lease) => lease,
        Election::Follower => panic!("first caller must win"),
    };
    let err = election.wait_until_finished(&scope).unwrap_err();
    assert!(matches!(err, Error::OwnerLivenessTimeout { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quit_during_frame_five_ends_session() {
    let hub = LocalHub::new();
    let mut author = start_author(&hub, 0).await;

    let joins = [spawn_join(&hub, "render-1", 3), spawn_join(&hub, "render-2", 3)];
    author.wait_for_participants(2, Duration::from_secs(5)).await.unwrap();

    let mut loops = Vec::new();
    for join in joins {
        let node = join.await.unwrap();
        assert_eq!(node.init().model, "teapot");
        loops.push(spawn_render_loop(node));
    }

    for frame in 0..6 {
        let report = author
            .run_frame(|state| {
                state.advance();
                if frame == 5 {
                    state.apply_input(&InputEvent::KeyPress('q'));
                }
            })
            .await
            .unwrap();
        assert_eq!(report.frame, frame);
        assert_eq!(report.acked, 2);
        assert_eq!(report.final_frame, frame == 5);
    }

    assert!(author.is_shut_down());
    assert!(matches!(author.run_frame(|_| ()).await, Err(Error::ShuttingDown)));

    for handle in loops {
        let (frames, mut node) = handle.await.unwrap();
        assert_eq!(frames, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(node.node_resources().sweeps(), 6);

        let next = Version(node.state_version().as_u64() + 1);
        assert!(matches!(node.synchronize(next).await, Err(Error::SourceGone(_))));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_participant_releases_barrier() {
    let hub = LocalHub::new();
    let mut author = start_author(&hub, 0).await;

    let joins = [spawn_join(&hub, "render-1", 1), spawn_join(&hub, "render-2", 1)];
    author.wait_for_participants(2, Duration::from_secs(5)).await.unwrap();
    let [first, second] = joins;
    let render_loop = spawn_render_loop(first.await.unwrap());
    // render-2 never renders and then drops off the fabric
    let stalled = second.await.unwrap();

    let detach = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            hub.disconnect("render-2").await;
        })
    };

    let report = author.run_frame(FrameState::advance).await.unwrap();
    assert_eq!(report.acked, 1);
    assert_eq!(report.disconnected, vec!["render-2".to_string()]);
    detach.await.unwrap();
    drop(stalled);

    let report = author.run_frame(FrameState::advance).await.unwrap();
    assert_eq!(report.acked, 1);
    assert!(report.disconnected.is_empty());

    author.shutdown("test over").await.unwrap();
    let (frames, _) = render_loop.await.unwrap();
    assert_eq!(frames, vec![0, 1]);

    let summary = author.participants().summary().await;
    assert_eq!(summary.disconnected, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_barrier_timeout_drops_silent_participant() {
    let hub = LocalHub::new();
    let mut author = start_author(&hub, 100).await;

    let joins = [spawn_join(&hub, "render-1", 1), spawn_join(&hub, "render-2", 1)];
    author.wait_for_participants(2, Duration::from_secs(5)).await.unwrap();
    let [first, second] = joins;
    let render_loop = spawn_render_loop(first.await.unwrap());
    let _silent = second.await.unwrap();

    let report = author.run_frame(FrameState::advance).await.unwrap();
    assert_eq!(report.timed_out, vec!["render-2".to_string()]);
    assert_eq!(report.acked, 1);

    // The next frame does not wait for it again
    let report = author.run_frame(FrameState::advance).await.unwrap();
    assert!(report.timed_out.is_empty());
    assert!(report.elapsed < Duration::from_millis(100));

    author.shutdown("test over").await.unwrap();
    let (frames, _) = render_loop.await.unwrap();
    assert_eq!(frames, vec![0, 1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_joiner_starts_at_next_frame() {
    let hub = LocalHub::new();
    let mut author = start_author(&hub, 0).await;

    let early = spawn_join(&hub, "render-1", 2);
    author.wait_for_participants(1, Duration::from_secs(5)).await.unwrap();
    let early_loop = spawn_render_loop(early.await.unwrap());

    for _ in 0..2 {
        author
            .run_frame(|state| state.apply_input(&InputEvent::PointerDrag { dx: 40.0, dy: 0.0 }))
            .await
            .unwrap();
    }

    let late = spawn_join(&hub, "render-2", 2);
    author.wait_for_participants(2, Duration::from_secs(5)).await.unwrap();
    let late = late.await.unwrap();
    assert_eq!(late.session().next_frame, 2);
    // Replay carried the newest frame state, not the one from frame 0
    assert_eq!(late.state().camera.yaw, author.state().camera.yaw);
    let late_loop = spawn_render_loop(late);

    for _ in 0..2 {
        let report = author.run_frame(FrameState::advance).await.unwrap();
        assert_eq!(report.acked, 2);
    }

    author.shutdown("test over").await.unwrap();
    let (early_frames, _) = early_loop.await.unwrap();
    let (late_frames, _) = late_loop.await.unwrap();
    assert_eq!(early_frames, vec![0, 1, 2, 3]);
    assert_eq!(late_frames, vec![2, 3]);
}

#[tokio::test]
async fn test_render_node_needs_authoring_process() {
    let hub = LocalHub::new();
    let options = JoinOptions {
        welcome_timeout: Duration::from_millis(50),
        ..JoinOptions::default()
    };

    let result: lockstep::Result<Node> =
        RenderNode::join_local(&hub, "render-1", "authoring", options, CacheSweeper::new(1), vec![()]).await;
    assert!(matches!(result, Err(Error::Disconnected(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_participant_never_blocks_later_frames() {
    let hub = LocalHub::new();
    let mut author = start_author(&hub, 5).await;

    // Says hello, then never reads its inbox again
    let (stalled, _stalled_inbox) = hub.connect("stalled").await;
    stalled
        .send_to("authoring", &Message::Hello {
            node_id: "stalled".to_string(),
            contexts: 1,
        })
        .await
        .unwrap();
    author.wait_for_participants(1, Duration::from_secs(5)).await.unwrap();

    let report = author.run_frame(FrameState::advance).await.unwrap();
    assert_eq!(report.timed_out, vec!["stalled".to_string()]);

    // Enough frames to fill its queue several times over
    let frames = CHANNEL_CAPACITY as u64;
    let finished = tokio::time::timeout(Duration::from_secs(30), async {
        for _ in 0..frames {
            author.run_frame(FrameState::advance).await?;
        }
        Ok::<_, Error>(())
    })
    .await;
    assert!(matches!(finished, Ok(Ok(()))));
    assert_eq!(author.sequencer().next_frame(), frames + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_render_node_joins_over_tcp() {
    let table = PeerTable::new("authoring".to_string());
    let (incoming_tx, inbox) = mpsc::channel(CHANNEL_CAPACITY);
    let server = Arc::new(NetworkServer::new(
        "127.0.0.1:0".to_string(),
        Arc::clone(&table),
        incoming_tx,
        Duration::from_secs(5),
    ));
    let listener = server.bind().await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let serving = Arc::clone(&server);
    let server_task = tokio::spawn(async move { serving.serve(listener).await });

    let mut author = AuthoringNode::start(
        table,
        inbox,
        InitData::new("teapot", 2),
        FrameState::default(),
        &frame_config(0),
    )
    .await
    .unwrap();

    let mut config = LockstepConfig::new("render-1", NodeRole::Render);
    config.cluster.authoring_address = Some(address);
    let join = tokio::spawn(async move {
        let node: Node = RenderNode::join_tcp(&config, CacheSweeper::new(16), vec![(); 2])
            .await
            .unwrap();
        node
    });
    author.wait_for_participants(1, Duration::from_secs(5)).await.unwrap();
    let node = join.await.unwrap();
    assert_eq!(node.init().model, "teapot");
    assert_eq!(node.contexts(), 2);
    let render_loop = spawn_render_loop(node);

    for frame in 0..2 {
        let report = author
            .run_frame(|state| {
                state.apply_input(&InputEvent::PointerDrag { dx: 30.0, dy: 0.0 });
                if frame == 1 {
                    state.apply_input(&InputEvent::KeyPress('q'));
                }
            })
            .await
            .unwrap();
        assert_eq!(report.acked, 1);
        assert_eq!(report.final_frame, frame == 1);
    }

    let (frames, node) = render_loop.await.unwrap();
    assert_eq!(frames, vec![0, 1]);
    assert_eq!(node.state().camera.yaw, author.state().camera.yaw);
    assert_eq!(node.node_resources().sweeps(), 2);

    server.stop();
    server_task.await.unwrap().unwrap();
}

