use anyhow::{bail, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, Write};
use std::path::Path;

/// Peak level used by [`normalize`].
pub const NORMALIZE_PEAK: f32 = 0.95;

/// Sample encoding of written WAV data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WavFormat {
    /// 16-bit signed integer PCM, clamped to `[-1, 1]`.
    #[default]
    Pcm16,
    /// 32-bit IEEE float PCM, written as-is.
    Float32,
}

impl WavFormat {
    fn spec(self, sample_rate: u32) -> WavSpec {
        match self {
            WavFormat::Pcm16 => WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            },
            WavFormat::Float32 => WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            },
        }
    }
}

fn write_samples<W: Write + Seek>(
    writer: &mut WavWriter<W>,
    format: WavFormat,
    samples: &[f32],
) -> Result<()> {
    match format {
        WavFormat::Pcm16 => {
            for &value in samples {
                let scaled = (value.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                writer.write_sample(scaled)?;
            }
        }
        WavFormat::Float32 => {
            for &value in samples {
                writer.write_sample(value)?;
            }
        }
    }
    Ok(())
}

/// Write mono samples to a WAV file.
pub fn write_wav(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    format: WavFormat,
) -> Result<()> {
    let mut writer = WavWriter::create(path, format.spec(sample_rate))?;
    write_samples(&mut writer, format, samples)?;
    writer.finalize()?;
    Ok(())
}

/// Encode mono samples as a complete in-memory WAV file.
pub fn wav_bytes(samples: &[f32], sample_rate: u32, format: WavFormat) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut buffer, format.spec(sample_rate))?;
        write_samples(&mut writer, format, samples)?;
        writer.finalize()?;
    }
    Ok(buffer.into_inner())
}

/// Read a WAV file and mix it down to mono.
pub fn read_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        bail!("WAV file declares zero channels");
    }
    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let max = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / max))
                .collect::<Result<_, _>>()?
        }
    };
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Mono WAV writer fed chunk by chunk.
pub struct StreamingWavWriter {
    writer: WavWriter<BufWriter<File>>,
    format: WavFormat,
}

impl StreamingWavWriter {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32, format: WavFormat) -> Result<Self> {
        let writer = WavWriter::create(path, format.spec(sample_rate))?;
        Ok(Self { writer, format })
    }

    pub fn write_chunk(&mut self, samples: &[f32]) -> Result<()> {
        write_samples(&mut self.writer, self.format, samples)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn finalize(self) -> Result<()> {
        self.writer.finalize()?;
        Ok(())
    }
}

/// Little-endian `f32` bytes of `samples`, the raw stream format.
pub fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|sample| sample.to_le_bytes()).collect()
}

/// Inverse of [`samples_to_bytes`]. Trailing bytes that do not form a whole
/// sample are ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Scale `samples` in place so the peak magnitude is [`NORMALIZE_PEAK`].
/// Silence is left untouched.
pub fn normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0_f32, |acc, value| acc.max(value.abs()));
    if peak > 0.0 && peak.is_finite() {
        let scale = NORMALIZE_PEAK / peak;
        for value in samples.iter_mut() {
            *value *= scale;
        }
    }
}

/// Duration of `sample_count` mono samples in seconds.
pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    sample_count as f64 / sample_rate as f64
}
