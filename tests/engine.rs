mod common;

use common::{loaded_engine, FixtureOptions, SAMPLES_PER_FRAME, SAMPLE_RATE};
use pocket_engine::{AudioChunk, EngineConfig, EngineError, EngineState, SessionOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const HELLO: &str = "Hello, world!";

fn seeded(config: EngineConfig) -> EngineConfig {
    EngineConfig {
        use_fixed_seed: true,
        seed: 1234,
        ..config
    }
}

fn collect(stream: pocket_engine::AudioStream) -> Vec<AudioChunk> {
    stream.map(|chunk| chunk.expect("chunk")).collect()
}

#[test]
fn synthesize_returns_mono_audio_at_decoder_rate() {
    let (_dir, engine) = loaded_engine(FixtureOptions::default());
    let result = engine.synthesize(HELLO).expect("synthesize");

    assert_eq!(result.sample_rate, SAMPLE_RATE);
    assert_eq!(result.channels, 1);
    // End of sequence on the first frame, then three tail frames for a short prompt.
    assert_eq!(result.audio.len(), 4 * SAMPLES_PER_FRAME);
    assert!(result.duration_seconds > 0.0);
    assert!((result.duration_seconds - 0.32).abs() < 1e-9);
    assert!(result.audio.iter().all(|v| v.is_finite()));
    assert_eq!(engine.state(), EngineState::Loaded);
    assert_eq!(engine.last_outcome(), Some(SessionOutcome::Completed));
}

#[test]
fn fixed_seed_output_is_byte_identical() {
    let (dir, engine) = loaded_engine(FixtureOptions::default());
    let first = engine.synthesize(HELLO).expect("first").to_bytes();
    let second = engine.synthesize(HELLO).expect("second").to_bytes();
    assert_eq!(first, second);

    let mut other = pocket_engine::CpuEngine::cpu();
    other.load(dir.path()).expect("load");
    other.configure(engine.config().clone()).expect("configure");
    assert_eq!(other.synthesize(HELLO).expect("third").to_bytes(), first);
}

#[test]
fn different_seeds_change_the_audio() {
    let (_dir, mut engine) = loaded_engine(FixtureOptions::default());
    let first = engine.synthesize(HELLO).expect("first").audio;
    engine
        .configure(EngineConfig {
            seed: 99,
            ..engine.config().clone()
        })
        .expect("configure");
    let second = engine.synthesize(HELLO).expect("second").audio;
    assert_eq!(first.len(), second.len());
    assert_ne!(first, second);
}

#[test]
fn duration_scales_inversely_with_speed() {
    let (_dir, mut engine) = loaded_engine(FixtureOptions::default());
    let mut durations = Vec::new();
    for speed in [0.5_f32, 1.0, 2.0] {
        engine
            .configure(seeded(EngineConfig {
                speed,
                ..EngineConfig::default()
            }))
            .expect("configure");
        durations.push(engine.synthesize(HELLO).expect("synthesize").duration_seconds);
    }
    assert!((durations[0] / durations[1] - 2.0).abs() < 0.01, "{durations:?}");
    assert!((durations[1] / durations[2] - 2.0).abs() < 0.01, "{durations:?}");
}

#[test]
fn consistency_steps_do_not_change_duration() {
    let (_dir, mut engine) = loaded_engine(FixtureOptions::default());
    let mut lengths = Vec::new();
    for consistency_steps in [1, 4] {
        engine
            .configure(seeded(EngineConfig {
                consistency_steps,
                ..EngineConfig::default()
            }))
            .expect("configure");
        lengths.push(engine.synthesize(HELLO).expect("synthesize").audio.len());
    }
    assert_eq!(lengths[0], lengths[1]);
}

#[test]
fn unknown_voice_fails_before_any_cache_exists() {
    let (_dir, engine) = loaded_engine(FixtureOptions::default());
    let err = engine.synthesize_with_voice(HELLO, 5).unwrap_err();
    assert!(matches!(
        err,
        EngineError::VoiceNotFound {
            index: 5,
            available: 2
        }
    ));
    assert_eq!(engine.cache_stats().allocated, 0);
    assert_eq!(engine.state(), EngineState::Loaded);
}

#[test]
fn voice_override_applies_to_one_call() {
    let (_dir, engine) = loaded_engine(FixtureOptions::default());
    let alba = engine.synthesize_with_voice(HELLO, 0).expect("alba").audio;
    let marius = engine.synthesize_with_voice(HELLO, 1).expect("marius").audio;
    assert_ne!(alba, marius);
    assert_eq!(engine.config().voice_index, 0);
    assert_eq!(engine.synthesize(HELLO).expect("default").audio, alba);
}

#[test]
fn stream_matches_batch_and_numbers_chunks() {
    let (_dir, engine) = loaded_engine(FixtureOptions::default());
    let batch = engine.synthesize(HELLO).expect("batch").audio;

    let chunks = collect(engine.synthesize_streaming(HELLO).expect("stream"));
    assert_eq!(chunks.len(), 4);
    for (index, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.sequence_number, index as u64);
        assert_eq!(chunk.is_first, index == 0);
        assert_eq!(chunk.is_last, index == chunks.len() - 1);
        assert_eq!(chunk.sample_rate, SAMPLE_RATE);
    }
    let streamed: Vec<f32> = chunks.into_iter().flat_map(|chunk| chunk.audio).collect();
    assert_eq!(streamed, batch);
    assert_eq!(engine.last_outcome(), Some(SessionOutcome::Completed));
}

#[test]
fn streamed_speed_change_keeps_total_length() {
    let (_dir, mut engine) = loaded_engine(FixtureOptions::default());
    engine
        .configure(seeded(EngineConfig {
            speed: 1.6,
            ..EngineConfig::default()
        }))
        .expect("configure");
    let chunks = collect(engine.synthesize_streaming(HELLO).expect("stream"));
    let total: usize = chunks.iter().map(|chunk| chunk.audio.len()).sum();
    assert_eq!(total, 320);
    assert!(chunks.last().expect("last").is_last);
}

#[test]
fn cancel_after_chunks_stops_the_stream() {
    let (_dir, engine) = loaded_engine(FixtureOptions::endless(400));
    let mut stream = engine.synthesize_streaming(HELLO).expect("stream");
    for expected in 0..2 {
        let chunk = stream.next().expect("chunk").expect("ok");
        assert_eq!(chunk.sequence_number, expected);
    }

    engine.cancel();
    assert!(stream.next().is_none());
    assert!(stream.next().is_none());
    assert_eq!(engine.state(), EngineState::Loaded);
    assert_eq!(engine.last_outcome(), Some(SessionOutcome::Cancelled));

    let stats = engine.cache_stats();
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.released, 1);
}

#[test]
fn cancelling_a_batch_call_returns_the_partial_audio() {
    let (_dir, engine) = loaded_engine(FixtureOptions::endless(400));
    let handle = engine.cancel_handle();
    let finished = AtomicBool::new(false);

    let result = std::thread::scope(|scope| {
        scope.spawn(|| {
            // Cancelling with no session running is a no-op, so keep trying
            // until the batch call has returned.
            while !finished.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
                handle.cancel();
            }
        });
        let result = engine.synthesize(HELLO);
        finished.store(true, Ordering::Release);
        result
    });

    let result = result.expect("cancelled batch call still succeeds");
    assert!(result.audio.len() < 400 * SAMPLES_PER_FRAME);
    assert_eq!(result.audio.len() % SAMPLES_PER_FRAME, 0);
    assert_eq!(engine.state(), EngineState::Loaded);
    assert_eq!(engine.last_outcome(), Some(SessionOutcome::Cancelled));
    let stats = engine.cache_stats();
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.allocated, stats.released);
}

#[test]
fn shared_engines_run_concurrently_on_the_same_weights() {
    let (dir, engine) = loaded_engine(FixtureOptions::default());
    let other = engine.share().expect("share");
    assert!(engine.shares_model_with(&other));
    assert_eq!(other.state(), EngineState::Loaded);
    assert_eq!(other.config(), engine.config());
    assert_eq!(other.voices().expect("voices"), engine.voices().expect("voices"));

    let (first, second) = std::thread::scope(|scope| {
        let first = scope.spawn(|| engine.synthesize(HELLO).expect("first").to_bytes());
        let second = scope.spawn(|| other.synthesize(HELLO).expect("second").to_bytes());
        (
            first.join().expect("first thread"),
            second.join().expect("second thread"),
        )
    });
    assert_eq!(first, second);
    assert_eq!(engine.cache_stats().released, 1);
    assert_eq!(other.cache_stats().released, 1);

    let mut reloaded = pocket_engine::CpuEngine::cpu();
    reloaded.load(dir.path()).expect("load");
    assert!(!engine.shares_model_with(&reloaded));
}

#[test]
fn sharing_needs_a_loaded_model() {
    let engine = pocket_engine::CpuEngine::cpu();
    assert!(matches!(engine.share().map(|_| ()), Err(EngineError::ModelNotLoaded)));
}

#[test]
fn second_session_while_streaming_is_busy() {
    let (_dir, mut engine) = loaded_engine(FixtureOptions::endless(400));
    let mut stream = engine.synthesize_streaming(HELLO).expect("stream");
    stream.next().expect("chunk").expect("ok");

    assert!(!engine.is_ready());
    assert!(matches!(engine.synthesize(HELLO), Err(EngineError::Busy)));
    assert!(matches!(
        engine.synthesize_streaming(HELLO).map(|_| ()),
        Err(EngineError::Busy)
    ));

    drop(stream);
    assert!(engine.is_ready());
    assert_eq!(engine.last_outcome(), Some(SessionOutcome::Cancelled));
    assert!(engine.unload().is_ok());
}

#[test]
fn unload_is_refused_while_streaming() {
    let (_dir, mut engine) = loaded_engine(FixtureOptions::endless(400));
    let stream = engine.synthesize_streaming(HELLO).expect("stream");
    assert!(matches!(engine.unload(), Err(EngineError::Busy)));
    stream.cancel();
    drop(stream);
    assert!(engine.unload().is_ok());
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn running_session_keeps_its_configuration() {
    let (_dir, mut engine) = loaded_engine(FixtureOptions::default());
    let expected = engine.synthesize(HELLO).expect("batch").audio;
    let original = engine.config().clone();

    let stream = engine.synthesize_streaming(HELLO).expect("stream");
    engine
        .configure(EngineConfig {
            temperature: 0.2,
            seed: 7,
            ..original.clone()
        })
        .expect("configure mid-stream");
    let streamed: Vec<f32> = collect(stream)
        .into_iter()
        .flat_map(|chunk| chunk.audio)
        .collect();
    assert_eq!(streamed, expected);
    assert_eq!(engine.config().seed, 7);
}

#[test]
fn frame_cap_without_end_is_overflow() {
    let (_dir, engine) = loaded_engine(FixtureOptions::endless(6));
    let err = engine.synthesize(HELLO).unwrap_err();
    assert!(matches!(err, EngineError::GenerationOverflow { max_frames: 6 }));
    assert_eq!(engine.last_outcome(), Some(SessionOutcome::Failed));
    assert_eq!(engine.state(), EngineState::Loaded);
    let stats = engine.cache_stats();
    assert_eq!(stats.allocated, stats.released);
}

#[test]
fn stream_overflow_ends_with_an_error() {
    let (_dir, engine) = loaded_engine(FixtureOptions::endless(6));
    let items: Vec<_> = engine.synthesize_streaming(HELLO).expect("stream").collect();
    let (last, chunks) = items.split_last().expect("items");
    assert!(matches!(
        last,
        Err(EngineError::GenerationOverflow { max_frames: 6 })
    ));
    assert_eq!(chunks.len(), 5);
    assert!(chunks
        .iter()
        .all(|chunk| chunk.as_ref().is_ok_and(|chunk| !chunk.is_last)));
    assert_eq!(engine.cache_stats().released, 1);
}

#[test]
fn caches_are_released_once_per_session() {
    let (_dir, engine) = loaded_engine(FixtureOptions::default());
    engine.synthesize(HELLO).expect("batch");
    collect(engine.synthesize_streaming(HELLO).expect("stream"));
    let mut partial = engine.synthesize_streaming(HELLO).expect("stream");
    partial.next().expect("chunk").expect("ok");
    drop(partial);

    let stats = engine.cache_stats();
    assert_eq!(stats.allocated, 3);
    assert_eq!(stats.released, 3);
}
