//! Step barriers, gather timeouts and recovery of a multi-rank group.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use duet_daemon::config::CoordinatorConfig;
use duet_daemon::dist::{
    channel_mesh, ChannelTransport, CoordinatorState, DistributedCoordinator, InferenceCoordinator,
    Message, MessageKind, RankCoordinator, RecvError, SingleDeviceCoordinator, StepEvent,
    StepPhase, Transport,
};
use duet_daemon::error::{ErrorCode, Result};

use common::{request, shared_log, small_config};

/// Drops this rank's first outgoing gather message.
struct DropFirstGather {
    inner: ChannelTransport,
    dropped: AtomicBool,
}

impl Transport for DropFirstGather {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn send(&self, msg: Message) -> Result<()> {
        if msg.kind == MessageKind::Gather && !self.dropped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.send(msg)
    }

    fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Message, RecvError> {
        self.inner.recv_timeout(timeout)
    }
}

type Followers = Vec<thread::JoinHandle<Result<()>>>;

/// Starts a group whose followers get their transport through `wrap` and
/// whose ranks all report step events into `log`.
fn start_group<F>(
    config: &CoordinatorConfig,
    world: usize,
    log: Option<Arc<Mutex<Vec<StepEvent>>>>,
    wrap: F,
) -> (DistributedCoordinator, Followers)
where
    F: Fn(ChannelTransport) -> Box<dyn Transport>,
{
    let mut transports = channel_mesh(world).into_iter();
    let root_transport = transports.next().unwrap();
    let observer = |log: &Option<Arc<Mutex<Vec<StepEvent>>>>| {
        log.clone().map(|sink| {
            Box::new(move |e: &StepEvent| sink.lock().unwrap().push(*e))
                as Box<dyn FnMut(&StepEvent) + Send>
        })
    };

    let followers = transports
        .map(|t| {
            let transport = wrap(t);
            let config = config.clone();
            let obs = observer(&log);
            thread::spawn(move || {
                let mut rank = RankCoordinator::new(config);
                if let Some(obs) = obs {
                    rank.set_observer(obs);
                }
                rank.join(transport)?;
                rank.shard()?;
                rank.serve()
            })
        })
        .collect();

    let mut root = RankCoordinator::new(config.clone());
    if let Some(obs) = observer(&log) {
        root.set_observer(obs);
    }
    root.join(Box::new(root_transport)).unwrap();
    root.shard().unwrap();
    (DistributedCoordinator::new(root).unwrap(), followers)
}

fn stop(mut root: DistributedCoordinator, followers: Followers) {
    root.shutdown().unwrap();
    for f in followers {
        f.join().unwrap().unwrap();
    }
}

#[test]
fn no_rank_starts_a_step_before_every_rank_finished_the_last() {
    let mut config = small_config();
    config.sampling.sample_steps = 4;
    config.parallel.ulysses_size = 2;
    config.parallel.ring_size = 2;
    let req = request(&config);

    let log = shared_log::<StepEvent>();
    let (mut root, followers) = start_group(&config, 4, Some(log.clone()), |t| Box::new(t));
    root.run(&req).unwrap();
    stop(root, followers);

    let events = log.lock().unwrap().clone();
    assert_eq!(events.len(), 4 * 4 * 2);

    let position = |rank: usize, step: u32, phase: StepPhase| {
        events
            .iter()
            .position(|e| e.rank == rank && e.step == step && e.phase == phase)
            .unwrap()
    };
    for step in 1..4 {
        for r in 0..4 {
            for s in 0..4 {
                assert!(
                    position(r, step + 1, StepPhase::Computed)
                        > position(s, step, StepPhase::Computed),
                    "rank {} started step {} before rank {} finished step {}",
                    r,
                    step + 1,
                    s,
                    step
                );
            }
            assert!(
                position(r, step, StepPhase::Synchronized) < position(r, step + 1, StepPhase::Computed)
            );
        }
    }
    assert!(events.iter().all(|e| e.total == 4));
}

#[test]
fn lost_gather_times_out_and_group_recovers() {
    let mut config = small_config();
    config.parallel.ulysses_size = 2;
    config.timeouts.gather_ms = 300;
    let req = request(&config);

    let (mut root, followers) = start_group(&config, 2, None, |t| {
        Box::new(DropFirstGather {
            inner: t,
            dropped: AtomicBool::new(false),
        })
    });

    let err = root.run(&req).unwrap_err();
    assert_eq!(err.code, ErrorCode::GatherTimeout);
    assert!(err.message.contains("[1]"));
    assert!(!err.is_fatal());
    assert_eq!(root.state(), CoordinatorState::Ready);

    let recovered = root.run(&req).unwrap();
    stop(root, followers);

    let mut single_config = small_config();
    single_config.parallel.ulysses_size = 1;
    let single = SingleDeviceCoordinator::new(single_config)
        .unwrap()
        .run(&req)
        .unwrap();
    assert_eq!(recovered, single);
}

#[test]
fn vanished_follower_is_a_barrier_timeout() {
    let mut config = small_config();
    config.parallel.ulysses_size = 2;
    config.timeouts.collective_ms = 300;
    let req = request(&config);

    let mut transports = channel_mesh(2).into_iter();
    let root_transport = transports.next().unwrap();
    let follower_transport = transports.next().unwrap();
    let follower_config = config.clone();
    let follower = thread::spawn(move || {
        let mut rank = RankCoordinator::new(follower_config);
        rank.join(Box::new(follower_transport))?;
        rank.shard()
        // Leaves without serving; its transport is dropped here.
    });

    let mut root = RankCoordinator::new(config);
    root.join(Box::new(root_transport)).unwrap();
    root.shard().unwrap();
    follower.join().unwrap().unwrap();

    let err = root.execute(&req).unwrap_err();
    assert_eq!(err.code, ErrorCode::BarrierTimeout);
    assert_eq!(root.state(), CoordinatorState::Ready);
}
