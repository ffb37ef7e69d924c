//! Per-rank execution of generation requests.
//!
//! A [`RankCoordinator`] walks `Uninitialized -> GroupJoined -> ModelSharded
//! -> Ready`, then serves requests one at a time:
//! `Ready -> Denoising { step } -> Gathering -> Ready`. Rank 0 broadcasts
//! each request as a command; every other rank sits in [`RankCoordinator::serve`]
//! and executes it in lockstep. A failed request always returns the rank to
//! `Ready`.

use std::thread::{self, JoinHandle};

use image::RgbImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::attention::{sequence_parallel_attention, ParallelLayout};
use super::fsdp::ShardedModelState;
use super::group::ProcessGroup;
use super::shard::SequenceShard;
use super::tcp::TcpTransport;
use super::transport::{channel_mesh, decode_f32, encode_f32, LoopbackTransport, Transport};
use crate::config::{CoordinatorConfig, LaunchConfig};
use crate::error::{Result, TalkError};
use crate::frame::{AudioRoutingPolicy, BBox, BboxOverlapRouting, CompositeFrame};
use crate::models::{
    apply_guidance, create_scheduler, initial_noise, Branch, Conditioning, DiffusionTransformer,
    LatentGeometry, TextEncoder,
};
use crate::types::{EmbeddingTensor, GenerationParams, GenerationRequest};

/// Where a rank is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Uninitialized,
    GroupJoined,
    ModelSharded,
    Ready,
    /// Running denoising iteration `step` (0-based).
    Denoising { step: u32 },
    Gathering,
}

/// Fully gathered latent of one request, held by rank 0.
#[derive(Debug, Clone, PartialEq)]
pub struct DenoisingState {
    pub geometry: LatentGeometry,
    /// `(seq_len, channels)` in token order.
    pub latent: Array2<f32>,
}

/// What a rank gets back from a request.
#[derive(Debug, Clone, PartialEq)]
pub enum DenoiseOutcome {
    /// Rank 0: the gathered state.
    Owner(DenoisingState),
    /// Any other rank: its shard was delivered.
    Completed,
}

/// Which side of the step barrier an event was emitted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// The local shard has been updated; the barrier has not been entered.
    Computed,
    /// Every rank has passed the barrier.
    Synchronized,
}

/// Progress notification for one denoising step on one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEvent {
    pub rank: usize,
    /// 1-based index of the step just finished.
    pub step: u32,
    pub total: u32,
    pub phase: StepPhase,
}

pub type StepObserver = Box<dyn FnMut(&StepEvent) + Send>;

/// Runs one request and returns the gathered latent.
///
/// Implemented by a single-device coordinator and by rank 0 of a distributed
/// group; both produce identical latents for identical requests.
pub trait InferenceCoordinator: Send {
    fn world_size(&self) -> usize;

    fn run(&mut self, request: &GenerationRequest) -> Result<DenoisingState>;

    /// Installs a callback invoked on every step event of this rank.
    fn set_observer(&mut self, observer: StepObserver);
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    Generate { request: RequestEnvelope },
    Shutdown,
}

/// Wire form of a [`GenerationRequest`].
#[derive(Debug, Serialize, Deserialize)]
struct RequestEnvelope {
    params: GenerationParams,
    prompt: String,
    width: u32,
    height: u32,
    #[serde(with = "hex_bytes")]
    image: Vec<u8>,
    bbox_speaker1: BBox,
    bbox_speaker2: BBox,
    embeddings: Vec<EnvelopeEmbedding>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeEmbedding {
    speaker_id: u8,
    rows: usize,
    cols: usize,
    /// Little-endian f32.
    #[serde(with = "hex_bytes")]
    values: Vec<u8>,
}

impl RequestEnvelope {
    fn from_request(request: &GenerationRequest) -> Self {
        let frame = &request.composite;
        Self {
            params: request.params.clone(),
            prompt: request.prompt.clone(),
            width: frame.width(),
            height: frame.height(),
            image: frame.image.as_raw().clone(),
            bbox_speaker1: frame.bbox_speaker1,
            bbox_speaker2: frame.bbox_speaker2,
            embeddings: request
                .embeddings
                .iter()
                .map(|e| {
                    let (rows, cols) = e.shape();
                    let flat: Vec<f32> = e.values.iter().copied().collect();
                    EnvelopeEmbedding {
                        speaker_id: e.speaker_id,
                        rows,
                        cols,
                        values: encode_f32(&flat),
                    }
                })
                .collect(),
        }
    }

    fn into_request(self) -> Result<GenerationRequest> {
        let image = RgbImage::from_raw(self.width, self.height, self.image).ok_or_else(|| {
            TalkError::inference(format!(
                "broadcast frame does not hold {}x{} RGB pixels",
                self.width, self.height
            ))
        })?;
        let embeddings = self
            .embeddings
            .into_iter()
            .map(|e| {
                Array2::from_shape_vec((e.rows, e.cols), decode_f32(&e.values))
                    .map(|values| EmbeddingTensor::new(e.speaker_id, values))
                    .map_err(|err| {
                        TalkError::inference(format!(
                            "broadcast embedding for speaker {}: {}",
                            e.speaker_id, err
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(GenerationRequest {
            composite: CompositeFrame {
                image,
                bbox_speaker1: self.bbox_speaker1,
                bbox_speaker2: self.bbox_speaker2,
            },
            embeddings,
            prompt: self.prompt,
            params: self.params,
        })
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

struct ShardedModels {
    text: ShardedModelState,
    dit: ShardedModelState,
}

/// One rank's coordinator. Owns the process group handle and the model shard.
pub struct RankCoordinator {
    config: CoordinatorConfig,
    layout: ParallelLayout,
    state: CoordinatorState,
    group: Option<ProcessGroup>,
    models: Option<ShardedModels>,
    text_encoder: TextEncoder,
    dit: DiffusionTransformer,
    routing: Box<dyn AudioRoutingPolicy>,
    observer: Option<StepObserver>,
}

impl RankCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let layout = ParallelLayout::new(config.parallel.ulysses_size, config.parallel.ring_size);
        Self {
            text_encoder: TextEncoder::new(&config.model),
            dit: DiffusionTransformer::new(&config.model),
            config,
            layout,
            state: CoordinatorState::Uninitialized,
            group: None,
            models: None,
            routing: Box::new(BboxOverlapRouting),
            observer: None,
        }
    }

    /// Replaces the audio routing policy.
    pub fn with_routing(mut self, routing: Box<dyn AudioRoutingPolicy>) -> Self {
        self.routing = routing;
        self
    }

    pub fn set_observer(&mut self, observer: StepObserver) {
        self.observer = Some(observer);
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn rank(&self) -> usize {
        self.group.as_ref().map(ProcessGroup::rank).unwrap_or(0)
    }

    pub fn world_size(&self) -> usize {
        self.group.as_ref().map(ProcessGroup::world_size).unwrap_or(1)
    }

    /// Joins the group over an already connected transport.
    ///
    /// A handshake barrier confirms every rank is present; failure is a
    /// GROUP_INIT error.
    pub fn join(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if self.state != CoordinatorState::Uninitialized {
            return Err(TalkError::group_init(format!(
                "cannot join a group from state {:?}",
                self.state
            )));
        }
        let mut group = ProcessGroup::new(transport, &self.config.timeouts);
        group.barrier().map_err(|e| {
            TalkError::group_init(format!("rank {} handshake failed: {}", group.rank(), e.message))
        })?;
        info!("Rank {} joined group of {}", group.rank(), group.world_size());
        self.group = Some(group);
        self.state = CoordinatorState::GroupJoined;
        Ok(())
    }

    /// Joins over TCP at the launch rendezvous address.
    pub fn join_tcp(&mut self, launch: &LaunchConfig) -> Result<()> {
        let transport = TcpTransport::join(
            launch.rank,
            launch.world_size,
            &launch.rendezvous_addr(),
            self.config.timeouts.rendezvous(),
        )?;
        self.join(Box::new(transport))
    }

    /// Builds and shards both models, then becomes `Ready`.
    pub fn shard(&mut self) -> Result<()> {
        if self.state != CoordinatorState::GroupJoined {
            return Err(TalkError::sharding(format!(
                "cannot shard from state {:?}",
                self.state
            )));
        }
        let (rank, world) = (self.rank(), self.world_size());
        self.layout.validate(world, self.dit.num_heads())?;

        let parallel = &self.config.parallel;
        let seed = self.config.model.weight_seed;
        let text = ShardedModelState::from_checkpoint(
            self.text_encoder.checkpoint(seed),
            rank,
            world,
            parallel.shard_text_encoder,
            parallel.persistent_param_count,
        )?;
        let dit = ShardedModelState::from_checkpoint(
            self.dit.checkpoint(seed),
            rank,
            world,
            parallel.shard_transformer,
            parallel.persistent_param_count,
        )?;
        debug!(
            "Rank {} holds {} text / {} transformer elements",
            rank,
            text.local_elements(),
            dit.local_elements()
        );
        self.models = Some(ShardedModels { text, dit });
        self.state = CoordinatorState::ModelSharded;

        info!(
            "Rank {} sharded (ulysses {}, ring {})",
            rank, self.layout.ulysses, self.layout.ring
        );
        self.state = CoordinatorState::Ready;
        Ok(())
    }

    /// Rank 0: broadcasts `request` and executes it with every rank.
    pub fn execute(&mut self, request: &GenerationRequest) -> Result<DenoiseOutcome> {
        self.expect_ready()?;
        let group = self.group_mut()?;
        if !group.is_root() {
            return Err(TalkError::inference("only rank 0 submits requests"));
        }
        let command = Command::Generate {
            request: RequestEnvelope::from_request(request),
        };
        let bytes = serde_json::to_vec(&command)
            .map_err(|e| TalkError::inference(format!("cannot encode request: {}", e)))?;
        group.broadcast_command(bytes.clone())?;

        // Run what the followers decode so every rank sees identical values.
        match decode_command(&bytes)? {
            Command::Generate { request } => self.run_request(request.into_request()?),
            Command::Shutdown => Err(TalkError::inference("unexpected shutdown command")),
        }
    }

    /// Follower loop: executes broadcast requests until rank 0 shuts down.
    ///
    /// Request-level failures are logged and the rank stays `Ready`.
    pub fn serve(&mut self) -> Result<()> {
        self.expect_ready()?;
        if self.group_mut()?.is_root() {
            return Err(TalkError::inference("rank 0 does not serve commands"));
        }
        loop {
            let bytes = match self.group_mut()?.recv_command(None)? {
                Some(bytes) => bytes,
                None => continue,
            };
            match decode_command(&bytes) {
                Ok(Command::Generate { request }) => {
                    let result = request.into_request().and_then(|r| self.run_request(r));
                    if let Err(e) = result {
                        warn!("Rank {} abandoned request: {}", self.rank(), e);
                    }
                }
                Ok(Command::Shutdown) => {
                    info!("Rank {} shutting down", self.rank());
                    return Ok(());
                }
                Err(e) => warn!("Rank {} ignored command: {}", self.rank(), e),
            }
        }
    }

    /// Rank 0: tells every follower to leave [`serve`](Self::serve).
    pub fn shutdown(&mut self) -> Result<()> {
        let bytes = serde_json::to_vec(&Command::Shutdown)
            .map_err(|e| TalkError::inference(format!("cannot encode shutdown: {}", e)))?;
        self.group_mut()?.broadcast_command(bytes)
    }

    fn expect_ready(&self) -> Result<()> {
        if self.state != CoordinatorState::Ready {
            return Err(TalkError::inference(format!(
                "coordinator is {:?}, not Ready",
                self.state
            )));
        }
        Ok(())
    }

    fn group_mut(&mut self) -> Result<&mut ProcessGroup> {
        self.group
            .as_mut()
            .ok_or_else(|| TalkError::inference("rank has not joined a group"))
    }

    fn run_request(&mut self, request: GenerationRequest) -> Result<DenoiseOutcome> {
        self.expect_ready()?;
        let result = self.denoise(&request);
        self.state = CoordinatorState::Ready;
        if let Err(e) = &result {
            warn!("Rank {} request failed: {}", self.rank(), e);
        }
        result
    }

    fn denoise(&mut self, request: &GenerationRequest) -> Result<DenoiseOutcome> {
        let params = &request.params;
        params.validate()?;
        let geometry = LatentGeometry::new(params, self.config.model.patch_size, self.dit.channels());
        let layout = self.layout;

        let group = self
            .group
            .as_mut()
            .ok_or_else(|| TalkError::inference("rank has not joined a group"))?;
        let models = self
            .models
            .as_ref()
            .ok_or_else(|| TalkError::inference("models are not sharded"))?;
        let (rank, world) = (group.rank(), group.world_size());

        let shards = SequenceShard::partition(geometry.seq_len(), world)?;
        let local = shards[rank];
        debug!(
            "Rank {} denoises tokens {}..{} of {}",
            rank,
            local.start,
            local.end,
            geometry.seq_len()
        );

        let text_params = models.text.materialize(group)?;
        let text = self.text_encoder.encode(&text_params, &request.prompt)?;
        drop(text_params);

        let conditioning = Conditioning {
            text,
            cell_colors: request.composite.cell_colors(geometry.grid_h, geometry.grid_w),
            audio: speaker_embeddings(&request.embeddings, &geometry, self.dit.audio_dim())?,
            routing: self
                .routing
                .spatial_weights(&request.composite, geometry.grid_h, geometry.grid_w),
        };

        let mut latent = initial_noise(params.seed, local.range(), geometry.channels);
        let mut scheduler = create_scheduler(
            params.scheduler,
            params.sample_steps,
            params.sample_shift,
            params.seed,
        );
        let total = params.sample_steps;

        for step in 0..total {
            self.state = CoordinatorState::Denoising { step };
            let dit_params = models.dit.materialize(group)?;
            let timestep = scheduler.timestep();

            let mut outputs = Vec::with_capacity(Branch::ALL.len());
            for branch in Branch::ALL {
                let velocity = self.dit.forward(
                    &dit_params,
                    &latent,
                    local.range(),
                    &geometry,
                    &conditioning,
                    branch,
                    timestep,
                    |q, k, v| sequence_parallel_attention(group, &layout, &shards, q, k, v),
                )?;
                outputs.push(velocity);
            }
            drop(dit_params);

            let guided = apply_guidance(
                &outputs[0],
                &outputs[1],
                &outputs[2],
                params.text_guidance_scale,
                params.audio_guidance_scale,
            );
            latent = scheduler.step(&latent, &guided, local.start);

            let mut event = StepEvent {
                rank,
                step: step + 1,
                total,
                phase: StepPhase::Computed,
            };
            notify(&mut self.observer, &event);
            group.barrier()?;
            event.phase = StepPhase::Synchronized;
            notify(&mut self.observer, &event);
        }

        self.state = CoordinatorState::Gathering;
        let flat: Vec<f32> = latent.iter().copied().collect();
        drop(latent);
        let parts = match group.gather(flat)? {
            Some(parts) => parts,
            None => return Ok(DenoiseOutcome::Completed),
        };

        let channels = geometry.channels;
        let mut full = Vec::with_capacity(geometry.seq_len() * channels);
        for (shard, part) in shards.iter().zip(parts) {
            if part.len() != shard.len() * channels {
                return Err(TalkError::inference(format!(
                    "rank {} returned {} values for {} tokens",
                    shard.index,
                    part.len(),
                    shard.len()
                )));
            }
            full.extend(part);
        }
        let latent = Array2::from_shape_vec((geometry.seq_len(), channels), full)
            .map_err(|e| TalkError::inference(format!("gathered latent: {}", e)))?;
        info!("Rank 0 gathered {} tokens from {} ranks", geometry.seq_len(), world);
        Ok(DenoiseOutcome::Owner(DenoisingState { geometry, latent }))
    }
}

fn notify(observer: &mut Option<StepObserver>, event: &StepEvent) {
    if let Some(observer) = observer.as_mut() {
        observer(event);
    }
}

fn decode_command(bytes: &[u8]) -> Result<Command> {
    serde_json::from_slice(bytes)
        .map_err(|e| TalkError::inference(format!("malformed command: {}", e)))
}

/// Speaker 1 and speaker 2 embeddings, checked against the fixed shape.
fn speaker_embeddings(
    embeddings: &[EmbeddingTensor],
    geometry: &LatentGeometry,
    audio_dim: usize,
) -> Result<Vec<Array2<f32>>> {
    [1u8, 2]
        .iter()
        .map(|&id| {
            let tensor = embeddings
                .iter()
                .find(|e| e.speaker_id == id)
                .ok_or_else(|| TalkError::embedding(format!("no embedding for speaker {}", id)))?;
            let expected = (geometry.frame_count, audio_dim);
            if tensor.shape() != expected {
                return Err(TalkError::embedding(format!(
                    "speaker {} embedding is {:?}, expected {:?}",
                    id,
                    tensor.shape(),
                    expected
                )));
            }
            Ok(tensor.values.clone())
        })
        .collect()
}

/// Coordinator for `world_size == 1`: every collective runs over a loopback
/// transport and is satisfied locally.
pub struct SingleDeviceCoordinator {
    inner: RankCoordinator,
}

impl SingleDeviceCoordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let mut inner = RankCoordinator::new(config);
        inner.join(Box::new(LoopbackTransport::new()))?;
        inner.shard()?;
        Ok(Self { inner })
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.state()
    }
}

impl InferenceCoordinator for SingleDeviceCoordinator {
    fn world_size(&self) -> usize {
        1
    }

    fn run(&mut self, request: &GenerationRequest) -> Result<DenoisingState> {
        owner_state(self.inner.execute(request)?)
    }

    fn set_observer(&mut self, observer: StepObserver) {
        self.inner.set_observer(observer);
    }
}

/// Rank 0 of a multi-rank group. Followers are shut down on drop.
pub struct DistributedCoordinator {
    root: RankCoordinator,
    shut_down: bool,
}

impl DistributedCoordinator {
    /// Wraps a `Ready` rank-0 coordinator.
    pub fn new(root: RankCoordinator) -> Result<Self> {
        if root.state() != CoordinatorState::Ready || root.rank() != 0 {
            return Err(TalkError::inference(format!(
                "distributed coordinator needs rank 0 in Ready, got rank {} in {:?}",
                root.rank(),
                root.state()
            )));
        }
        Ok(Self {
            root,
            shut_down: false,
        })
    }

    pub fn state(&self) -> CoordinatorState {
        self.root.state()
    }

    /// Sends the shutdown command to every follower.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.root.shutdown()
    }
}

impl Drop for DistributedCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Failed to shut down followers: {}", e);
        }
    }
}

impl InferenceCoordinator for DistributedCoordinator {
    fn world_size(&self) -> usize {
        self.root.world_size()
    }

    fn run(&mut self, request: &GenerationRequest) -> Result<DenoisingState> {
        owner_state(self.root.execute(request)?)
    }

    fn set_observer(&mut self, observer: StepObserver) {
        self.root.set_observer(observer);
    }
}

fn owner_state(outcome: DenoiseOutcome) -> Result<DenoisingState> {
    match outcome {
        DenoiseOutcome::Owner(state) => Ok(state),
        DenoiseOutcome::Completed => Err(TalkError::inference("rank 0 received no gathered state")),
    }
}

/// Picks the coordinator for this process: single-device when the launch
/// world size is 1, otherwise rank 0 of a TCP group.
pub fn create_coordinator(
    config: &CoordinatorConfig,
    launch: &LaunchConfig,
) -> Result<Box<dyn InferenceCoordinator>> {
    if launch.world_size <= 1 {
        return Ok(Box::new(SingleDeviceCoordinator::new(config.clone())?));
    }
    if launch.rank != 0 {
        return Err(TalkError::group_init(format!(
            "rank {} is a follower; only rank 0 owns the coordinator",
            launch.rank
        )));
    }
    let mut root = RankCoordinator::new(config.clone());
    root.join_tcp(launch)?;
    root.shard()?;
    Ok(Box::new(DistributedCoordinator::new(root)?))
}

/// Follower process entry: joins over TCP, shards and serves until shutdown.
pub fn run_follower(config: &CoordinatorConfig, launch: &LaunchConfig) -> Result<()> {
    let mut rank = RankCoordinator::new(config.clone());
    rank.join_tcp(launch)?;
    rank.shard()?;
    rank.serve()
}

/// An in-process group: rank 0 here, followers on threads over channels.
///
/// Dropping the group shuts the followers down and joins their threads.
pub struct LocalGroup {
    pub coordinator: DistributedCoordinator,
    followers: Vec<JoinHandle<Result<()>>>,
}

impl LocalGroup {
    /// Shuts the followers down and waits for them.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let mut first_error = self.coordinator.shutdown().err();
        for handle in self.followers.drain(..) {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(TalkError::inference("follower thread panicked")));
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for LocalGroup {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Local group did not stop cleanly: {}", e);
        }
    }
}

impl InferenceCoordinator for LocalGroup {
    fn world_size(&self) -> usize {
        self.coordinator.world_size()
    }

    fn run(&mut self, request: &GenerationRequest) -> Result<DenoisingState> {
        self.coordinator.run(request)
    }

    fn set_observer(&mut self, observer: StepObserver) {
        self.coordinator.set_observer(observer);
    }
}

/// Spawns `world_size - 1` follower threads and returns rank 0.
pub fn spawn_local_group(config: &CoordinatorConfig, world_size: usize) -> Result<LocalGroup> {
    let mut transports = channel_mesh(world_size.max(1)).into_iter();
    let root_transport = transports
        .next()
        .ok_or_else(|| TalkError::group_init("empty local group"))?;

    let mut followers = Vec::new();
    for transport in transports {
        let config = config.clone();
        let rank = transport.rank();
        let handle = thread::Builder::new()
            .name(format!("rank-{}", rank))
            .spawn(move || {
                let mut coordinator = RankCoordinator::new(config);
                coordinator.join(Box::new(transport))?;
                coordinator.shard()?;
                coordinator.serve()
            })
            .map_err(|e| TalkError::group_init(format!("cannot spawn rank {}: {}", rank, e)))?;
        followers.push(handle);
    }

    let mut root = RankCoordinator::new(config.clone());
    root.join(Box::new(root_transport))?;
    root.shard()?;
    Ok(LocalGroup {
        coordinator: DistributedCoordinator::new(root)?,
        followers,
    })
}
