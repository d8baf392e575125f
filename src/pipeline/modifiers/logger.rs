//! Samples pipe values into a shared in-memory log.

use crate::pipeline::id::{OwnerId, PipeId};
use crate::pipeline::modifier::{Modifier, StageContext};
use crate::transform::Transformation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// When the logger records a value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LogSampling {
    /// Every `every`-th execution.
    Iterations { every: u32 },
    /// At most once per `seconds`.
    Interval { seconds: f32 },
}

impl Default for LogSampling {
    fn default() -> Self {
        LogSampling::Iterations { every: 1 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub owner: OwnerId,
    pub pipe_id: PipeId,
    pub iteration: u64,
    pub captured_at: DateTime<Utc>,
    pub value: Transformation,
}

/// Log shared by every logger stage of one registry.
#[derive(Debug, Clone, Default)]
pub struct TransformLog {
    records: Rc<RefCell<Vec<LogRecord>>>,
}

impl TransformLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: LogRecord) {
        self.records.borrow_mut().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.records.borrow().clone()
    }

    pub fn records_for(&self, owner: OwnerId) -> Vec<LogRecord> {
        self.records
            .borrow()
            .iter()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect()
    }

    /// Write all records as JSON and clear the log.
    pub fn dump<W: Write>(&self, writer: W) -> serde_json::Result<usize> {
        let records = std::mem::take(&mut *self.records.borrow_mut());
        serde_json::to_writer_pretty(writer, &records)?;
        Ok(records.len())
    }
}

pub struct TransformLogger {
    log: TransformLog,
    sampling: LogSampling,
    iteration: u64,
    last_sample: Option<Instant>,
}

impl TransformLogger {
    pub fn new(log: TransformLog, sampling: LogSampling) -> Self {
        Self {
            log,
            sampling,
            iteration: 0,
            last_sample: None,
        }
    }

    fn due(&mut self) -> bool {
        match self.sampling {
            LogSampling::Iterations { every } => self.iteration % every.max(1) as u64 == 0,
            LogSampling::Interval { seconds } => {
                let now = Instant::now();
                let due = self.last_sample.map_or(true, |last| {
                    now.duration_since(last) >= Duration::from_secs_f32(seconds.max(0.0))
                });
                if due {
                    self.last_sample = Some(now);
                }
                due
            }
        }
    }
}

impl Modifier for TransformLogger {
    fn name(&self) -> &str {
        "logger"
    }

    fn execute(&mut self, prev: &Transformation, ctx: &mut StageContext<'_>) -> Transformation {
        if self.due() {
            self.log.record(LogRecord {
                owner: ctx.owner,
                pipe_id: ctx.pipe_id,
                iteration: self.iteration,
                captured_at: Utc::now(),
                value: *prev,
            });
        }
        self.iteration += 1;
        *prev
    }
}
