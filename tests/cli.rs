mod common;

use common::{model_dir, FixtureOptions, SAMPLES_PER_FRAME, SAMPLE_RATE};
use pocket_engine::audio::io::{bytes_to_samples, read_wav};
use std::process::Command;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pocket-engine"))
}

#[test]
fn say_writes_a_wav_file() {
    let model = model_dir(FixtureOptions::default());
    let out = tempfile::tempdir().expect("tempdir");
    let output = out.path().join("hello.wav");
    let status = cli()
        .arg("--model-dir")
        .arg(model.path())
        .args(["say", "Hello, world!", "--seed", "3", "--output"])
        .arg(&output)
        .status()
        .expect("run cli");
    assert!(status.success());

    let (samples, rate) = read_wav(&output).expect("read wav");
    assert_eq!(rate, SAMPLE_RATE);
    assert_eq!(samples.len(), 4 * SAMPLES_PER_FRAME);
}

#[test]
fn streamed_raw_output_matches_batch_length() {
    let model = model_dir(FixtureOptions::default());
    let out = tempfile::tempdir().expect("tempdir");
    let output = out.path().join("hello.f32");
    let status = cli()
        .arg("--model-dir")
        .arg(model.path())
        .args([
            "say",
            "Hello, world!",
            "--stream",
            "--format",
            "raw",
            "--voice",
            "marius",
            "--output",
        ])
        .arg(&output)
        .status()
        .expect("run cli");
    assert!(status.success());

    let samples = bytes_to_samples(&std::fs::read(&output).expect("read"));
    assert_eq!(samples.len(), 4 * SAMPLES_PER_FRAME);
}

#[test]
fn voices_lists_builtin_metadata() {
    let model = model_dir(FixtureOptions::default());
    let output = cli()
        .arg("--model-dir")
        .arg(model.path())
        .arg("voices")
        .output()
        .expect("run cli");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("alba"));
    assert!(stdout.contains("marius"));
    assert!(stdout.contains("female"));
}

#[test]
fn unknown_voice_name_fails() {
    let model = model_dir(FixtureOptions::default());
    let out = tempfile::tempdir().expect("tempdir");
    let status = cli()
        .arg("--model-dir")
        .arg(model.path())
        .args(["say", "Hello.", "--voice", "nobody", "--output"])
        .arg(out.path().join("x.wav"))
        .status()
        .expect("run cli");
    assert!(!status.success());
}
