//! Synthesis engine: model lifecycle, session guard and streaming delivery.
//!
//! An [`Engine`] owns one loaded model. Each call to [`Engine::synthesize`] or
//! [`Engine::synthesize_streaming`] runs one session: the configuration is
//! snapshotted, the voice and text are checked, a fresh generation cache is
//! allocated and the generate, sample, decode loop runs until end of
//! sequence, cancellation or error. The cache is dropped on every exit path.
//!
//! Only one session runs at a time. A second call while a session is active
//! fails immediately with [`EngineError::Busy`].

use crate::audio::blend::OverlapAdd;
use crate::audio::io::{samples_to_bytes, wav_bytes, WavFormat};
use crate::audio::speed::SpeedChanger;
use crate::conditioner::text::{PreparedText, TextTokenizer};
use crate::config::{load_model_config, EngineConfig, ModelConfig};
use crate::error::{EngineError, Result};
use crate::model::sampler::NoiseSampler;
use crate::model::tts::{parameter_count, GenerationParams, TtsModel, TtsState};
use crate::perf::{self, Metric};
use crate::state::CacheLen;
use crate::voice::{VoiceEmbedding, VoiceInfo, VoiceStore};
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Weights file expected in a model directory.
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// Optional architecture override in a model directory.
pub const CONFIG_FILE: &str = "config.yaml";
/// Sub-directory holding one file per voice.
pub const VOICES_DIR: &str = "voices";

/// How long a producer waits between attempts to push into a full channel.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(2);

/// Version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// CPU engine on the `ndarray` backend.
pub type CpuEngine = Engine<NdArray<f32>>;

/// Lifecycle phase of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No model loaded.
    Idle,
    /// Model resident, no session running.
    Loaded,
    /// A session is snapshotting its configuration and preparing input.
    Configuring,
    /// A session owns a generation cache and is stepping the model.
    Generating,
    /// A session is handing audio to the caller.
    Emitting,
}

/// How the most recent session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// Generation cache bookkeeping, for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub allocated: u64,
    pub released: u64,
}

/// Output of a batch synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    /// Mono PCM samples in `[-1, 1]`.
    pub audio: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_seconds: f64,
}

impl SynthesisResult {
    /// Samples as little-endian `f32` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        samples_to_bytes(&self.audio)
    }

    /// Audio wrapped in a WAV container.
    pub fn to_wav(&self, format: WavFormat) -> anyhow::Result<Vec<u8>> {
        wav_bytes(&self.audio, self.sample_rate, format)
    }
}

/// One piece of a streamed utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Mono PCM samples in `[-1, 1]`.
    pub audio: Vec<f32>,
    /// Position in the stream, starting at zero with no gaps.
    pub sequence_number: u64,
    pub is_first: bool,
    pub is_last: bool,
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Samples as little-endian `f32` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        samples_to_bytes(&self.audio)
    }

    pub fn duration_seconds(&self) -> f64 {
        crate::audio::io::duration_seconds(self.audio.len(), self.sample_rate)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: EngineState,
    outcome: Option<SessionOutcome>,
}

/// State shared between the engine, its sessions and cancel handles.
#[derive(Debug)]
struct Shared {
    lifecycle: Mutex<Lifecycle>,
    active: AtomicBool,
    cancel: Mutex<Option<Arc<AtomicBool>>>,
    caches_allocated: AtomicU64,
    caches_released: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Idle,
                outcome: None,
            }),
            active: AtomicBool::new(false),
            cancel: Mutex::new(None),
            caches_allocated: AtomicU64::new(0),
            caches_released: AtomicU64::new(0),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: EngineState) {
        self.lifecycle().state = state;
    }

    fn cancel_current(&self) {
        let current = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flag) = current.as_ref() {
            flag.store(true, Ordering::Release);
        }
    }
}

/// Exclusive claim on the engine for one session.
///
/// Dropping the guard records the outcome (failed if none was set) and
/// returns the engine to `Loaded`.
struct SessionGuard {
    shared: Arc<Shared>,
    cancel: Arc<AtomicBool>,
    outcome: Option<SessionOutcome>,
}

impl SessionGuard {
    fn acquire(shared: &Arc<Shared>) -> Result<Self> {
        if shared
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::Busy);
        }
        let cancel = Arc::new(AtomicBool::new(false));
        *shared.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        shared.set_state(EngineState::Configuring);
        Ok(Self {
            shared: shared.clone(),
            cancel,
            outcome: None,
        })
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        {
            let mut lifecycle = self.shared.lifecycle();
            lifecycle.state = EngineState::Loaded;
            lifecycle.outcome = Some(self.outcome.unwrap_or(SessionOutcome::Failed));
        }
        *self
            .shared
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.shared.active.store(false, Ordering::Release);
    }
}

/// Owner of one generation cache; counts its release when dropped.
struct CacheLease<B: Backend> {
    state: TtsState<B>,
    shared: Arc<Shared>,
}

impl<B: Backend> CacheLease<B> {
    fn new(state: TtsState<B>, shared: &Arc<Shared>) -> Self {
        shared.caches_allocated.fetch_add(1, Ordering::AcqRel);
        Self {
            state,
            shared: shared.clone(),
        }
    }
}

impl<B: Backend> Drop for CacheLease<B> {
    fn drop(&mut self) {
        log::trace!(
            "releasing generation cache ({} positions)",
            self.state.cached_positions()
        );
        self.shared.caches_released.fetch_add(1, Ordering::AcqRel);
    }
}

/// Cancels whatever session is running on the engine it came from.
///
/// Cheap to clone and safe to move to other threads, e.g. a signal handler.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.cancel_current();
    }
}

/// Read-only model parts. Engines created with [`Engine::share`] hold the
/// same allocations.
#[derive(Clone)]
struct LoadedModel<B: Backend> {
    model_dir: PathBuf,
    model: Arc<TtsModel<B>>,
    tokenizer: Arc<TextTokenizer>,
    voices: Arc<VoiceStore<B>>,
    parameter_count: usize,
}

/// Everything a session needs, captured before the cache exists.
struct SessionPlan<B: Backend> {
    model: Arc<TtsModel<B>>,
    voice: Arc<VoiceEmbedding<B>>,
    prepared: PreparedText,
    config: EngineConfig,
}

/// Text-to-speech engine bound to one device.
pub struct Engine<B: Backend> {
    device: B::Device,
    loaded: Option<LoadedModel<B>>,
    config: EngineConfig,
    shared: Arc<Shared>,
}

impl CpuEngine {
    /// Engine on the CPU `ndarray` backend.
    pub fn cpu() -> Self {
        Self::new(NdArrayDevice::Cpu)
    }
}

impl<B: Backend> Engine<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            loaded: None,
            config: EngineConfig::default(),
            shared: Arc::new(Shared::new()),
        }
    }

    /// Load weights, tokenizer and voices from `model_dir`.
    ///
    /// The directory holds `model.safetensors`, `tokenizer.model` or
    /// `tokenizer.json`, a `voices/` directory and optionally `config.yaml`.
    /// Any previously loaded model is released first, so a failed load
    /// leaves the engine `Idle`.
    pub fn load(&mut self, model_dir: impl AsRef<Path>) -> Result<()> {
        if self.shared.active.load(Ordering::Acquire) {
            return Err(EngineError::Busy);
        }
        let model_dir = model_dir.as_ref();
        self.loaded = None;
        self.shared.set_state(EngineState::Idle);

        let _span = perf::span(Metric::EngineLoad);
        let started = Instant::now();
        let loaded = Self::load_parts(model_dir, &self.device)?;
        log::info!(
            "loaded model from {} in {:.2}s ({} parameters, {} voices)",
            model_dir.display(),
            started.elapsed().as_secs_f32(),
            loaded.parameter_count,
            loaded.voices.len()
        );

        if self.config.voice_index >= loaded.voices.len() {
            log::warn!(
                "voice index {} not in new model, falling back to 0",
                self.config.voice_index
            );
            self.config.voice_index = 0;
        }
        self.loaded = Some(loaded);
        let mut lifecycle = self.shared.lifecycle();
        lifecycle.state = EngineState::Loaded;
        lifecycle.outcome = None;
        Ok(())
    }

    fn load_parts(model_dir: &Path, device: &B::Device) -> Result<LoadedModel<B>> {
        if !model_dir.is_dir() {
            return Err(EngineError::load_failed(model_dir, "not a directory"));
        }
        let config_path = model_dir.join(CONFIG_FILE);
        let config = if config_path.is_file() {
            load_model_config(&config_path)
                .map_err(|err| EngineError::load_failed(&config_path, err))?
        } else {
            ModelConfig::default()
        };

        let weights_path = model_dir.join(WEIGHTS_FILE);
        if !weights_path.is_file() {
            return Err(EngineError::load_failed(&weights_path, "weights file not found"));
        }
        let mut model = TtsModel::load(&config, &weights_path, device)
            .map_err(|err| EngineError::load_failed(&weights_path, err))?;
        let parameter_count = parameter_count(&mut model)
            .map_err(|err| EngineError::load_failed(&weights_path, err))?;

        let tokenizer = TextTokenizer::from_model_dir(model_dir)
            .map_err(|err| EngineError::load_failed(model_dir, err))?;
        let rows = model.flow_lm.conditioner.rows();
        if tokenizer.vocab_size() > rows {
            log::warn!(
                "tokenizer has {} entries but the embedding table only {rows}",
                tokenizer.vocab_size()
            );
        }

        let voices_dir = model_dir.join(VOICES_DIR);
        let voices = VoiceStore::load_dir(&voices_dir, model.flow_lm.d_model, device)
            .map_err(|err| EngineError::load_failed(&voices_dir, err))?;

        Ok(LoadedModel {
            model_dir: model_dir.to_path_buf(),
            model: Arc::new(model),
            tokenizer: Arc::new(tokenizer),
            voices: Arc::new(voices),
            parameter_count,
        })
    }

    /// New engine over the weights, tokenizer and voices already loaded here.
    ///
    /// Nothing is re-read or copied. The new engine starts `Loaded` with this
    /// engine's configuration and has its own session guard, so both can run
    /// sessions at the same time.
    pub fn share(&self) -> Result<Self> {
        let loaded = self.loaded()?.clone();
        let shared = Arc::new(Shared::new());
        shared.set_state(EngineState::Loaded);
        log::debug!("sharing model from {}", loaded.model_dir.display());
        Ok(Self {
            device: self.device.clone(),
            loaded: Some(loaded),
            config: self.config.clone(),
            shared,
        })
    }

    /// Both engines run on the same loaded weights.
    pub fn shares_model_with(&self, other: &Self) -> bool {
        match (&self.loaded, &other.loaded) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a.model, &b.model),
            _ => false,
        }
    }

    /// Release the model. Fails with `Busy` while a session is running.
    pub fn unload(&mut self) -> Result<()> {
        if self.shared.active.load(Ordering::Acquire) {
            return Err(EngineError::Busy);
        }
        if let Some(loaded) = self.loaded.take() {
            log::info!("unloaded model from {}", loaded.model_dir.display());
        }
        let mut lifecycle = self.shared.lifecycle();
        lifecycle.state = EngineState::Idle;
        lifecycle.outcome = None;
        Ok(())
    }

    /// Replace the session configuration after validating every field.
    ///
    /// A rejected configuration leaves the previous one in place. Sessions
    /// already running keep the configuration they started with.
    pub fn configure(&mut self, config: EngineConfig) -> Result<()> {
        let loaded = self.loaded()?;
        config.validate(Some(loaded.voices.len()))?;
        log::debug!("configured {config:?}");
        self.config = config;
        Ok(())
    }

    /// Current session configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.shared.lifecycle().state
    }

    /// Outcome of the most recent session since the model was loaded.
    pub fn last_outcome(&self) -> Option<SessionOutcome> {
        self.shared.lifecycle().outcome
    }

    /// A model is loaded and no session is running.
    pub fn is_ready(&self) -> bool {
        self.loaded.is_some() && !self.shared.active.load(Ordering::Acquire)
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            allocated: self.shared.caches_allocated.load(Ordering::Acquire),
            released: self.shared.caches_released.load(Ordering::Acquire),
        }
    }

    /// Voices of the loaded model, in index order.
    pub fn voices(&self) -> Result<Vec<VoiceInfo>> {
        Ok(self.loaded()?.voices.infos())
    }

    /// Number of scalar weights in the loaded model.
    pub fn parameter_count(&self) -> Result<usize> {
        Ok(self.loaded()?.parameter_count)
    }

    /// Output sample rate of the loaded model.
    pub fn sample_rate(&self) -> Result<u32> {
        Ok(self.loaded()?.model.sample_rate() as u32)
    }

    /// Request that the running session stop at its next step boundary.
    /// Does nothing when no session is running.
    pub fn cancel(&self) {
        self.shared.cancel_current();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Synthesize `text` with the configured voice and return all audio.
    ///
    /// Empty or whitespace-only text is rejected with
    /// [`EngineError::InvalidInput`]. A cancelled session returns the audio
    /// produced before cancellation.
    pub fn synthesize(&self, text: &str) -> Result<SynthesisResult> {
        self.synthesize_with_voice(text, self.config.voice_index)
    }

    /// Like [`Engine::synthesize`], overriding the voice for this call only.
    pub fn synthesize_with_voice(&self, text: &str, voice_index: usize) -> Result<SynthesisResult> {
        self.loaded()?;
        let mut guard = SessionGuard::acquire(&self.shared)?;
        let plan = self.plan(text, voice_index)?;
        let sample_rate = plan.model.sample_rate() as u32;

        let _span = perf::span(Metric::SessionBatch);
        let mut audio = Vec::new();
        let outcome = run_session(plan, &mut guard, |samples, _| {
            audio.extend(samples);
            ControlFlow::Continue(())
        });
        let outcome = finish(&mut guard, outcome)?;
        log::debug!("batch session {outcome:?} with {} samples", audio.len());

        perf::add_count(Metric::Samples, audio.len() as u64);
        let duration_seconds = crate::audio::io::duration_seconds(audio.len(), sample_rate);
        Ok(SynthesisResult {
            audio,
            sample_rate,
            channels: 1,
            duration_seconds,
        })
    }

    /// Start a streaming session for `text`.
    ///
    /// Empty or whitespace-only text is rejected with
    /// [`EngineError::InvalidInput`], as for [`Engine::synthesize`].
    ///
    /// Voice, configuration and text are checked before returning, so those
    /// failures never reach the stream. Generation runs on a worker thread
    /// and blocks when the consumer falls `stream_capacity` chunks behind.
    pub fn synthesize_streaming(&self, text: &str) -> Result<AudioStream>
    where
        B: Send + Sync + 'static,
    {
        self.loaded()?;
        let guard = SessionGuard::acquire(&self.shared)?;
        let plan = self.plan(text, self.config.voice_index)?;
        let capacity = plan.model.config.generation.stream_capacity;
        let sample_rate = plan.model.sample_rate() as u32;
        let cancel = guard.cancel.clone();

        let (sender, receiver) = mpsc::sync_channel(capacity);
        let worker = std::thread::Builder::new()
            .name("pocket-session".to_string())
            .spawn(move || stream_worker(plan, guard, sender, sample_rate))
            .map_err(|err| EngineError::decode(format!("spawning session worker: {err}")))?;

        Ok(AudioStream {
            receiver,
            cancel,
            worker: Some(worker),
            done: false,
        })
    }

    fn loaded(&self) -> Result<&LoadedModel<B>> {
        self.loaded.as_ref().ok_or(EngineError::ModelNotLoaded)
    }

    /// Snapshot the configuration and check voice and text. No cache exists
    /// until this succeeds.
    fn plan(&self, text: &str, voice_index: usize) -> Result<SessionPlan<B>> {
        let loaded = self.loaded()?;
        let config = EngineConfig {
            voice_index,
            ..self.config.clone()
        };
        config.validate(Some(loaded.voices.len()))?;
        let voice = loaded.voices.embedding(voice_index)?;

        let prepared = {
            let _span = perf::span(Metric::TokenizerEncode);
            loaded
                .tokenizer
                .tokenize(text)
                .map_err(|err| EngineError::InvalidInput(format!("{err:#}")))?
        };
        let rows = loaded.model.flow_lm.conditioner.rows();
        if let Some(token) = prepared.tokens.iter().find(|&&token| token as usize >= rows) {
            return Err(EngineError::InvalidInput(format!(
                "token {token} is outside the embedding table ({rows} rows)"
            )));
        }
        log::debug!(
            "session: voice {} ({}), {} tokens, {:?}",
            voice_index,
            voice.name,
            prepared.tokens.len(),
            prepared.text
        );

        Ok(SessionPlan {
            model: loaded.model.clone(),
            voice,
            prepared,
            config,
        })
    }
}

/// Record the session outcome on the guard and surface errors.
fn finish(
    guard: &mut SessionGuard,
    outcome: Result<SessionOutcome>,
) -> Result<SessionOutcome> {
    match outcome {
        Ok(outcome) => {
            guard.outcome = Some(outcome);
            Ok(outcome)
        }
        Err(err) => {
            log::warn!("session failed: {err}");
            guard.outcome = Some(SessionOutcome::Failed);
            Err(err)
        }
    }
}

/// Drive one session to its end.
///
/// `emit` receives blended, speed-adjusted audio and whether it is the last
/// piece; returning `Break` stops the session as cancelled. Cancellation is
/// checked before every step.
fn run_session<B: Backend>(
    plan: SessionPlan<B>,
    guard: &mut SessionGuard,
    mut emit: impl FnMut(Vec<f32>, bool) -> ControlFlow<()>,
) -> Result<SessionOutcome> {
    let SessionPlan {
        model,
        voice,
        prepared,
        config,
    } = plan;
    let generation = &model.config.generation;
    let params = GenerationParams {
        consistency_steps: config.consistency_steps,
        max_frames: model.max_frames_for(prepared.tokens.len()),
        frames_after_eos: prepared.frames_after_eos,
        eos_threshold: generation.eos_threshold,
    };
    let seed = config.use_fixed_seed.then_some(config.seed);
    let noise = NoiseSampler::new(config.temperature, config.top_p, seed)
        .map_err(|err| EngineError::InvalidConfig(format!("{err:#}")))?;
    let mut blend = OverlapAdd::from_millis(generation.crossfade_ms, model.sample_rate());
    let mut speed = SpeedChanger::new(config.speed)
        .map_err(|err| EngineError::InvalidConfig(format!("{err:#}")))?;

    guard.shared.set_state(EngineState::Generating);
    let state = model
        .init_state(&voice, &prepared.tokens, params, noise)
        .map_err(EngineError::decode)?;
    let mut cache = CacheLease::new(state, &guard.shared);

    loop {
        if guard.cancelled() {
            log::debug!("session cancelled after {} frames", cache.state.steps());
            return Ok(SessionOutcome::Cancelled);
        }
        let frame = model
            .next_frame(&mut cache.state)
            .map_err(EngineError::decode)?;
        let blended = blend.push(frame.samples);
        let mut samples = speed.process(&blended).map_err(EngineError::decode)?;
        if frame.is_final {
            samples.extend(speed.finish().map_err(EngineError::decode)?);
        } else if cache.state.frame_cap_reached() {
            return Err(EngineError::GenerationOverflow {
                max_frames: params.max_frames,
            });
        }

        if !samples.is_empty() || frame.is_final {
            guard.shared.set_state(EngineState::Emitting);
            if emit(samples, frame.is_final).is_break() {
                return Ok(SessionOutcome::Cancelled);
            }
            guard.shared.set_state(EngineState::Generating);
        }
        if frame.is_final {
            return Ok(SessionOutcome::Completed);
        }
    }
}

fn stream_worker<B: Backend>(
    plan: SessionPlan<B>,
    mut guard: SessionGuard,
    sender: SyncSender<Result<AudioChunk>>,
    sample_rate: u32,
) {
    let _span = perf::span(Metric::SessionStream);
    let started = Instant::now();
    let cancel = guard.cancel.clone();
    let mut sequence_number = 0;
    let outcome = run_session(plan, &mut guard, |audio, is_last| {
        let chunk = AudioChunk {
            audio,
            sequence_number,
            is_first: sequence_number == 0,
            is_last,
            sample_rate,
        };
        if sequence_number == 0 {
            perf::add_duration(Metric::FirstAudio, started.elapsed());
        }
        sequence_number += 1;
        perf::add_count(Metric::Chunks, 1);
        perf::add_count(Metric::Samples, chunk.audio.len() as u64);
        send_blocking(&sender, &cancel, Ok(chunk))
    });
    let outcome = finish(&mut guard, outcome);
    log::debug!("stream session ended after {sequence_number} chunks: {outcome:?}");
    if let Err(err) = outcome {
        let _ = send_blocking(&sender, &cancel, Err(err));
    }
}

/// Push into the bounded channel, waiting while it is full.
///
/// Breaks when the session is cancelled or the consumer is gone; a chunk is
/// never dropped otherwise.
fn send_blocking<T>(sender: &SyncSender<T>, cancel: &AtomicBool, item: T) -> ControlFlow<()> {
    let mut item = item;
    let mut waited: Option<Instant> = None;
    loop {
        if cancel.load(Ordering::Acquire) {
            return ControlFlow::Break(());
        }
        match sender.try_send(item) {
            Ok(()) => {
                if let Some(start) = waited {
                    perf::add_duration(Metric::ChannelWait, start.elapsed());
                }
                return ControlFlow::Continue(());
            }
            Err(TrySendError::Full(returned)) => {
                item = returned;
                waited.get_or_insert_with(Instant::now);
                std::thread::park_timeout(BACKPRESSURE_POLL);
            }
            Err(TrySendError::Disconnected(_)) => return ControlFlow::Break(()),
        }
    }
}

/// Ordered, finite stream of audio chunks from one session.
///
/// Yields `Ok` chunks until the chunk tagged `is_last`, or a single `Err`
/// when the session fails. After cancellation no further chunk is yielded,
/// even if some were already buffered. Dropping the stream cancels the
/// session and waits for its worker.
pub struct AudioStream {
    receiver: Receiver<Result<AudioChunk>>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    done: bool,
}

impl AudioStream {
    /// Cancel this stream's session.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn close(&mut self) {
        self.done = true;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("session worker panicked");
            }
        }
    }
}

impl Iterator for AudioStream {
    type Item = Result<AudioChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.load(Ordering::Acquire) {
            self.close();
            return None;
        }
        let received = self.receiver.recv();
        if self.cancel.load(Ordering::Acquire) {
            self.close();
            return None;
        }
        match received {
            Ok(item) => {
                let terminal = match &item {
                    Ok(chunk) => chunk.is_last,
                    Err(_) => true,
                };
                if terminal {
                    self.close();
                }
                Some(item)
            }
            Err(_) => {
                self.close();
                None
            }
        }
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel();
        }
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_the_package_version() {
        assert_eq!(version(), env!("CARGO_PKG_VERSION"));
        assert!(version().split('.').count() >= 3);
    }

    #[test]
    fn session_guard_is_exclusive_and_restores_state() {
        let shared = Arc::new(Shared::new());
        shared.set_state(EngineState::Loaded);
        let mut guard = SessionGuard::acquire(&shared).expect("first");
        assert_eq!(shared.lifecycle().state, EngineState::Configuring);
        assert!(matches!(SessionGuard::acquire(&shared), Err(EngineError::Busy)));

        guard.outcome = Some(SessionOutcome::Completed);
        drop(guard);
        assert_eq!(shared.lifecycle().state, EngineState::Loaded);
        assert_eq!(shared.lifecycle().outcome, Some(SessionOutcome::Completed));
        assert!(SessionGuard::acquire(&shared).is_ok());
    }

    #[test]
    fn guard_without_outcome_records_failure() {
        let shared = Arc::new(Shared::new());
        drop(SessionGuard::acquire(&shared).expect("guard"));
        assert_eq!(shared.lifecycle().outcome, Some(SessionOutcome::Failed));
    }

    #[test]
    fn cancel_reaches_only_the_current_session() {
        let shared = Arc::new(Shared::new());
        shared.cancel_current();
        let first = SessionGuard::acquire(&shared).expect("guard");
        assert!(!first.cancelled());
        let flag = first.cancel.clone();
        drop(first);

        let second = SessionGuard::acquire(&shared).expect("guard");
        shared.cancel_current();
        assert!(second.cancelled());
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn full_channel_waits_until_cancelled() {
        let (sender, receiver) = mpsc::sync_channel(1);
        let cancel = Arc::new(AtomicBool::new(false));
        assert!(send_blocking(&sender, &cancel, 1).is_continue());

        let flag = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Release);
        });
        assert!(send_blocking(&sender, &cancel, 2).is_break());
        canceller.join().expect("join");
        assert_eq!(receiver.try_recv().ok(), Some(1));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn unloaded_engine_rejects_work() {
        let mut engine = CpuEngine::cpu();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(matches!(engine.synthesize("hi"), Err(EngineError::ModelNotLoaded)));
        assert!(matches!(
            engine.configure(EngineConfig::default()),
            Err(EngineError::ModelNotLoaded)
        ));
        assert!(matches!(engine.voices(), Err(EngineError::ModelNotLoaded)));
        engine.cancel();
        assert_eq!(engine.cache_stats(), CacheStats::default());
        assert!(engine.unload().is_ok());
    }
}
