//! Process-wide timing and counters for synthesis.
//!
//! Spans and counters land in a fixed table of relaxed atomics, so recording
//! never blocks a session. The CLI prints [`report`] with `--verbose`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Everything the engine measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Metric {
    EngineLoad,
    SessionBatch,
    SessionStream,
    /// Session start until the first chunk is handed to the channel.
    FirstAudio,
    TokenizerEncode,
    FlowLmPrefill,
    FlowLmStep,
    FlowNetSample,
    MimiDecodeFrame,
    SpeedResample,
    MhaAttention,
    ChannelWait,
    Tokens,
    Frames,
    Samples,
    Chunks,
}

const METRIC_COUNT: usize = Metric::Chunks as usize + 1;

const ALL: [Metric; METRIC_COUNT] = [
    Metric::EngineLoad,
    Metric::SessionBatch,
    Metric::SessionStream,
    Metric::FirstAudio,
    Metric::TokenizerEncode,
    Metric::FlowLmPrefill,
    Metric::FlowLmStep,
    Metric::FlowNetSample,
    Metric::MimiDecodeFrame,
    Metric::SpeedResample,
    Metric::MhaAttention,
    Metric::ChannelWait,
    Metric::Tokens,
    Metric::Frames,
    Metric::Samples,
    Metric::Chunks,
];

impl Metric {
    /// Dotted name shown in the report.
    pub fn name(self) -> &'static str {
        match self {
            Metric::EngineLoad => "engine.load",
            Metric::SessionBatch => "session.batch",
            Metric::SessionStream => "session.stream",
            Metric::FirstAudio => "session.first_audio",
            Metric::TokenizerEncode => "tokenizer.encode",
            Metric::FlowLmPrefill => "flow_lm.prefill",
            Metric::FlowLmStep => "flow_lm.step",
            Metric::FlowNetSample => "flow_net.sample",
            Metric::MimiDecodeFrame => "mimi.decode_frame",
            Metric::SpeedResample => "audio.speed",
            Metric::MhaAttention => "mha.attention",
            Metric::ChannelWait => "stream.channel_wait",
            Metric::Tokens => "session.tokens",
            Metric::Frames => "session.frames",
            Metric::Samples => "session.samples",
            Metric::Chunks => "stream.chunks",
        }
    }

    /// Counters accumulate plain quantities; everything else is a duration.
    pub fn is_counter(self) -> bool {
        matches!(
            self,
            Metric::Tokens | Metric::Frames | Metric::Samples | Metric::Chunks
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

struct Table {
    start: Instant,
    micros: [AtomicU64; METRIC_COUNT],
    hits: [AtomicU64; METRIC_COUNT],
}

static TABLE: OnceLock<Table> = OnceLock::new();

fn table() -> &'static Table {
    TABLE.get_or_init(|| Table {
        start: Instant::now(),
        micros: std::array::from_fn(|_| AtomicU64::new(0)),
        hits: std::array::from_fn(|_| AtomicU64::new(0)),
    })
}

/// Timer that records its lifetime under `metric` when dropped.
#[must_use = "the span records when it is dropped"]
pub struct PerfSpan {
    metric: Metric,
    start: Instant,
}

impl Drop for PerfSpan {
    fn drop(&mut self) {
        add_duration(self.metric, self.start.elapsed());
    }
}

/// Start timing `metric`.
pub fn span(metric: Metric) -> PerfSpan {
    PerfSpan {
        metric,
        start: Instant::now(),
    }
}

pub fn add_duration(metric: Metric, duration: Duration) {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    let table = table();
    table.micros[metric.index()].fetch_add(micros, Ordering::Relaxed);
    table.hits[metric.index()].fetch_add(1, Ordering::Relaxed);
}

pub fn add_count(metric: Metric, delta: u64) {
    table().hits[metric.index()].fetch_add(delta, Ordering::Relaxed);
}

/// Point-in-time copy of the table.
#[derive(Debug, Clone)]
pub struct PerfSnapshot {
    uptime: Duration,
    micros: [u64; METRIC_COUNT],
    hits: [u64; METRIC_COUNT],
}

impl PerfSnapshot {
    pub fn capture() -> Self {
        let table = table();
        Self {
            uptime: table.start.elapsed(),
            micros: std::array::from_fn(|i| table.micros[i].load(Ordering::Relaxed)),
            hits: std::array::from_fn(|i| table.hits[i].load(Ordering::Relaxed)),
        }
    }

    /// Total time recorded under a duration metric.
    pub fn total(&self, metric: Metric) -> Duration {
        Duration::from_micros(self.micros[metric.index()])
    }

    /// Span count for a duration metric, running total for a counter.
    pub fn count(&self, metric: Metric) -> u64 {
        self.hits[metric.index()]
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Performance summary (uptime: {:.3}s)",
            self.uptime.as_secs_f64()
        );

        let mut timings: Vec<Metric> = ALL
            .into_iter()
            .filter(|m| !m.is_counter() && self.count(*m) > 0)
            .collect();
        timings.sort_by_key(|m| std::cmp::Reverse(self.micros[m.index()]));
        let counters: Vec<Metric> = ALL
            .into_iter()
            .filter(|m| m.is_counter() && self.count(*m) > 0)
            .collect();

        if timings.is_empty() && counters.is_empty() {
            let _ = writeln!(out, "No performance data recorded.");
            return out;
        }
        if !timings.is_empty() {
            let _ = writeln!(
                out,
                "  {:<24} {:>10} {:>8} {:>10}",
                "timing", "total", "count", "avg"
            );
            for metric in timings {
                let total = self.total(metric).as_secs_f64();
                let avg_ms = total * 1000.0 / self.count(metric) as f64;
                let _ = writeln!(
                    out,
                    "  {:<24} {:>9.3}s {:>8} {:>8.3}ms",
                    metric.name(),
                    total,
                    self.count(metric),
                    avg_ms
                );
            }
        }
        for metric in counters {
            let _ = writeln!(out, "  {:<24} {}", metric.name(), self.count(metric));
        }
        out
    }
}

/// Format everything recorded so far.
pub fn report() -> String {
    PerfSnapshot::capture().format()
}
