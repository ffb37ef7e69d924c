//! Distributed execution: transports, collectives, sharding and the per-rank
//! coordinator.
//!
//! - [`transport`]: point-to-point messages (loopback, in-process channels)
//! - [`TcpTransport`]: multi-process groups with a rendezvous hub at rank 0
//! - [`ProcessGroup`]: barrier, broadcast, all-to-all, all-gather and gather
//! - [`SequenceShard`] / [`ShardedModelState`]: sequence and parameter sharding
//! - [`sequence_parallel_attention`]: Ulysses x Ring attention
//! - [`RankCoordinator`]: the request state machine

mod attention;
mod coordinator;
mod fsdp;
mod group;
mod shard;
mod tcp;
pub mod transport;

pub use attention::{attend, sequence_parallel_attention, ParallelLayout};
pub use coordinator::{
    create_coordinator, run_follower, spawn_local_group, CoordinatorState, DenoiseOutcome,
    DenoisingState, DistributedCoordinator, InferenceCoordinator, LocalGroup, RankCoordinator,
    SingleDeviceCoordinator, StepEvent, StepObserver, StepPhase,
};
pub use fsdp::ShardedModelState;
pub use group::ProcessGroup;
pub use shard::{balanced_range, SequenceShard};
pub use tcp::TcpTransport;
pub use transport::{channel_mesh, ChannelTransport, LoopbackTransport, Message, MessageKind, RecvError, Transport};
