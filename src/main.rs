//! Command-line interface for the pocket speech engine.
//!
//! Loads a model directory, synthesizes text to a WAV file (batch or
//! streamed chunk by chunk) and lists the voices a model provides.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pocket_engine::audio::io::{normalize, samples_to_bytes, write_wav, StreamingWavWriter, WavFormat};
use pocket_engine::{perf, CpuEngine, EngineConfig};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

/// Output sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum OutputFormat {
    /// 16-bit PCM WAV.
    Pcm16,
    /// 32-bit float WAV.
    Float32,
    /// Headerless little-endian f32 samples.
    Raw,
}

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "pocket-engine")]
#[command(about = "CPU-only streaming text-to-speech", long_about = None)]
struct Cli {
    /// Print a performance summary at the end of the run.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Model directory with weights, tokenizer and voices.
    #[arg(long, global = true, default_value = "model")]
    model_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate speech from text.
    Say(SayArgs),
    /// List the voices of the model.
    Voices,
    /// Print model details.
    Info,
}

#[derive(Debug, Clone, clap::Args)]
struct SayArgs {
    /// Text prompt to synthesize.
    text: String,
    /// Voice name or index.
    #[arg(long)]
    voice: Option<String>,
    /// Output file path.
    #[arg(long, short)]
    output: PathBuf,
    #[arg(long, value_enum, default_value_t = OutputFormat::Pcm16)]
    format: OutputFormat,
    /// Sampling temperature.
    #[arg(long)]
    temperature: Option<f32>,
    /// Noise truncation mass in (0, 1].
    #[arg(long)]
    top_p: Option<f32>,
    /// Playback speed factor.
    #[arg(long)]
    speed: Option<f32>,
    /// Consistency sampling steps per frame.
    #[arg(long)]
    steps: Option<usize>,
    /// Fixed seed for reproducible output.
    #[arg(long)]
    seed: Option<u64>,
    /// Preset to start from before individual overrides.
    #[arg(long, value_enum)]
    preset: Option<Preset>,
    /// Scale the peak to a fixed level before writing (batch only).
    #[arg(long)]
    normalize: bool,
    /// Write audio as it is generated.
    #[arg(long)]
    stream: bool,
    /// Print per-chunk progress for streaming.
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Preset {
    LowLatency,
    HighQuality,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.verbose {
        "debug"
    } else {
        "warn"
    }))
    .init();

    let mut engine = CpuEngine::cpu();
    engine
        .load(&cli.model_dir)
        .with_context(|| format!("loading {}", cli.model_dir.display()))?;

    match cli.command {
        Commands::Say(args) => run_say(&mut engine, args)?,
        Commands::Voices => {
            for voice in engine.voices()? {
                match (voice.gender, voice.description) {
                    (Some(gender), Some(description)) => {
                        println!("{:>3}  {:<10} {gender:<7} {description}", voice.index, voice.name)
                    }
                    _ => println!("{:>3}  {}", voice.index, voice.name),
                }
            }
        }
        Commands::Info => {
            println!("version:     {}", pocket_engine::version());
            println!("model dir:   {}", cli.model_dir.display());
            println!("sample rate: {} Hz", engine.sample_rate()?);
            println!("parameters:  {}", engine.parameter_count()?);
            println!("voices:      {}", engine.voices()?.len());
        }
    }

    if cli.verbose {
        eprintln!("{}", perf::report());
    }
    Ok(())
}

fn build_config(engine: &CpuEngine, args: &SayArgs) -> Result<EngineConfig> {
    let mut config = match args.preset {
        Some(Preset::LowLatency) => EngineConfig::low_latency(),
        Some(Preset::HighQuality) => EngineConfig::high_quality(),
        None => EngineConfig::default(),
    };
    if let Some(voice) = &args.voice {
        config.voice_index = match voice.parse::<usize>() {
            Ok(index) => index,
            Err(_) => engine
                .voices()?
                .into_iter()
                .find(|info| info.name == *voice)
                .map(|info| info.index)
                .with_context(|| {
                    format!("voice '{voice}' not found; run `pocket-engine voices` to list them")
                })?,
        };
    }
    if let Some(temperature) = args.temperature {
        config.temperature = temperature;
    }
    if let Some(top_p) = args.top_p {
        config.top_p = top_p;
    }
    if let Some(speed) = args.speed {
        config.speed = speed;
    }
    if let Some(steps) = args.steps {
        config.consistency_steps = steps;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
        config.use_fixed_seed = true;
    }
    Ok(config)
}

fn run_say(engine: &mut CpuEngine, args: SayArgs) -> Result<()> {
    let config = build_config(engine, &args)?;
    engine.configure(config)?;

    let cancel = engine.cancel_handle();
    ctrlc::set_handler(move || cancel.cancel())?;

    let sample_rate = engine.sample_rate()?;
    let started = Instant::now();
    if args.stream {
        let mut sink = ChunkSink::create(&args, sample_rate)?;
        let mut finished = false;
        for chunk in engine.synthesize_streaming(&args.text)? {
            let chunk = chunk?;
            if chunk.is_first {
                log::info!(
                    "first audio after {:.0} ms",
                    started.elapsed().as_secs_f64() * 1000.0
                );
            }
            sink.write(&chunk.audio)?;
            if args.progress {
                eprintln!(
                    "chunk {} ({:.3}s)",
                    chunk.sequence_number,
                    chunk.duration_seconds()
                );
            }
            finished = chunk.is_last;
        }
        sink.finish()?;
        if !finished {
            anyhow::bail!("Interrupted");
        }
    } else {
        let mut result = engine.synthesize(&args.text)?;
        if engine.last_outcome() == Some(pocket_engine::SessionOutcome::Cancelled) {
            anyhow::bail!("Interrupted");
        }
        if args.normalize {
            normalize(&mut result.audio);
        }
        match args.format {
            OutputFormat::Pcm16 => {
                write_wav(&args.output, &result.audio, sample_rate, WavFormat::Pcm16)?
            }
            OutputFormat::Float32 => {
                write_wav(&args.output, &result.audio, sample_rate, WavFormat::Float32)?
            }
            OutputFormat::Raw => std::fs::write(&args.output, result.to_bytes())?,
        }
        log::info!("wrote {:.2}s of audio", result.duration_seconds);
    }
    log::info!("synthesis took {:.2}s", started.elapsed().as_secs_f64());
    Ok(())
}

/// Streaming destination for the chosen output format.
enum ChunkSink {
    Wav(StreamingWavWriter),
    Raw(File),
}

impl ChunkSink {
    fn create(args: &SayArgs, sample_rate: u32) -> Result<Self> {
        Ok(match args.format {
            OutputFormat::Pcm16 => Self::Wav(StreamingWavWriter::create(
                &args.output,
                sample_rate,
                WavFormat::Pcm16,
            )?),
            OutputFormat::Float32 => Self::Wav(StreamingWavWriter::create(
                &args.output,
                sample_rate,
                WavFormat::Float32,
            )?),
            OutputFormat::Raw => Self::Raw(File::create(&args.output)?),
        })
    }

    fn write(&mut self, samples: &[f32]) -> Result<()> {
        match self {
            Self::Wav(writer) => writer.write_chunk(samples),
            Self::Raw(file) => Ok(file.write_all(&samples_to_bytes(samples))?),
        }
    }

    fn finish(self) -> Result<()> {
        match self {
            Self::Wav(writer) => writer.finalize(),
            Self::Raw(mut file) => Ok(file.flush()?),
        }
    }
}
