//! Scalar metrics sinks.
//!
//! The training loop pushes `(series, value)` pairs; each sink numbers them
//! with an independent per-series step counter starting at 1.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, TrainResult};

pub const DISCRIMINATOR_LOSS: &str = "Discriminator loss";
pub const GENERATOR_LOSS: &str = "Generator loss";
pub const REALNESS_REAL: &str = "Realness score (real)";
pub const REALNESS_FAKE: &str = "Realness score (fake)";

/// File written inside the tensorboard directory.
pub const SCALARS_FILE: &str = "scalars.jsonl";

/// Destination for named scalar series.
pub trait MetricsSink {
    fn record(&mut self, series: &str, value: f64) -> TrainResult<()>;

    fn flush(&mut self) -> TrainResult<()> {
        Ok(())
    }
}

/// Independent step counter per series.
#[derive(Debug, Clone, Default)]
pub struct SeriesSteps {
    steps: HashMap<String, u64>,
}

impl SeriesSteps {
    /// Advance `series` and return its new step (1 on first use).
    pub fn next(&mut self, series: &str) -> u64 {
        let step = self.steps.entry(series.to_string()).or_insert(0);
        *step += 1;
        *step
    }
}

/// One line of `scalars.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub series: String,
    pub step: u64,
    pub value: f64,
    pub wall_time: f64,
}

/// Appends JSON lines to `<dir>/scalars.jsonl`.
pub struct ScalarFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    steps: SeriesSteps,
}

impl ScalarFileSink {
    /// Open the sink, deleting stats left in `dir` by an earlier run.
    pub fn open<P: AsRef<Path>>(dir: P) -> TrainResult<Self> {
        let dir = dir.as_ref();
        if dir.exists() {
            std::fs::remove_dir_all(dir).with_path(dir)?;
        }
        std::fs::create_dir_all(dir).with_path(dir)?;
        let path = dir.join(SCALARS_FILE);
        let file = File::create(&path).with_path(&path)?;
        tracing::info!(path = %path.display(), "writing scalar metrics");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            steps: SeriesSteps::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for ScalarFileSink {
    fn record(&mut self, series: &str, value: f64) -> TrainResult<()> {
        let event = ScalarEvent {
            series: series.to_string(),
            step: self.steps.next(series),
            value,
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n").with_path(&self.path)
    }

    fn flush(&mut self) -> TrainResult<()> {
        self.writer.flush().with_path(&self.path)
    }
}

/// Emits every scalar as a debug event.
#[derive(Debug, Default)]
pub struct TracingSink {
    steps: SeriesSteps,
}

impl MetricsSink for TracingSink {
    fn record(&mut self, series: &str, value: f64) -> TrainResult<()> {
        let step = self.steps.next(series);
        tracing::debug!(series = series, step = step, value = value, "scalar");
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&mut self, _series: &str, _value: f64) -> TrainResult<()> {
        Ok(())
    }
}

/// Forwards to several sinks in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn record(&mut self, series: &str, value: f64) -> TrainResult<()> {
        for sink in &mut self.sinks {
            sink.record(series, value)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> TrainResult<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Sinks for a run: always tracing, plus the scalar file when a tensorboard
/// directory is configured.
pub fn sinks_for(tensorboard: Option<&Path>) -> TrainResult<FanoutSink> {
    let mut sinks = FanoutSink::new().with(Box::new(TracingSink::default()));
    if let Some(dir) = tensorboard {
        sinks = sinks.with(Box::new(ScalarFileSink::open(dir)?));
    }
    Ok(sinks)
}
