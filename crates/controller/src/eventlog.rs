//! Append-only JSONL event logs, one file per local calendar period.
//!
//! Pump events go to `pumps/YYYYMMDD_pumps.jsonl`, samples to
//! `samples/YYYYMMDD_HH_samples.jsonl`. Every append is followed by a
//! retention sweep over the same family.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::state::{PumpEvent, Sample};

pub const MIN_KEEP_DAYS: u32 = 2;
pub const MAX_KEEP_DAYS: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    Day,
    Hour,
}

impl Period {
    fn stamp(self, local: NaiveDateTime) -> String {
        match self {
            Self::Day => local.format("%Y%m%d").to_string(),
            Self::Hour => local.format("%Y%m%d_%H").to_string(),
        }
    }

    /// Start of the period a file stamp names.
    fn parse_stamp(self, stamp: &str) -> Option<NaiveDateTime> {
        match self {
            Self::Day => NaiveDate::parse_from_str(stamp, "%Y%m%d")
                .ok()?
                .and_hms_opt(0, 0, 0),
            Self::Hour => {
                let (day, hour) = stamp.split_once('_')?;
                if hour.len() != 2 {
                    return None;
                }
                let hour: u32 = hour.parse().ok()?;
                NaiveDate::parse_from_str(day, "%Y%m%d")
                    .ok()?
                    .and_hms_opt(hour, 0, 0)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// One record family
// ---------------------------------------------------------------------------

struct Family {
    dir: PathBuf,
    suffix: &'static str,
    period: Period,
    // Serialises appends so lines from concurrent writers never interleave.
    write_lock: Mutex<()>,
}

impl Family {
    fn new(dir: PathBuf, suffix: &'static str, period: Period) -> Self {
        Self {
            dir,
            suffix,
            period,
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, local: NaiveDateTime) -> PathBuf {
        self.dir
            .join(format!("{}{}", self.period.stamp(local), self.suffix))
    }

    async fn append_line(&self, local: NaiveDateTime, line: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.path_for(local);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Delete partitions whose period started before `cutoff`. Files that do
    /// not match the naming scheme are left alone.
    async fn sweep(&self, cutoff: NaiveDateTime) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("failed to list {}", self.dir.display())),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stamp) = name.strip_suffix(self.suffix) else {
                continue;
            };
            let Some(started) = self.period.parse_stamp(stamp) else {
                continue;
            };
            if started < cutoff {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        removed += 1;
                        info!(file = %name, "eventlog: retention removed partition");
                    }
                    Err(e) => warn!(file = %name, "eventlog: failed to remove partition: {e}"),
                }
            }
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct EventLog {
    clock: Arc<dyn Clock>,
    keep_days: u32,
    pumps: Family,
    samples: Family,
}

impl EventLog {
    /// `keep_days` is clamped to 2..=7.
    pub fn new(base_dir: impl AsRef<Path>, keep_days: u32, clock: Arc<dyn Clock>) -> Self {
        let base = base_dir.as_ref();
        Self {
            clock,
            keep_days: keep_days.clamp(MIN_KEEP_DAYS, MAX_KEEP_DAYS),
            pumps: Family::new(base.join("pumps"), "_pumps.jsonl", Period::Day),
            samples: Family::new(base.join("samples"), "_samples.jsonl", Period::Hour),
        }
    }

    pub fn keep_days(&self) -> u32 {
        self.keep_days
    }

    pub fn pump_dir(&self) -> &Path {
        &self.pumps.dir
    }

    pub fn sample_dir(&self) -> &Path {
        &self.samples.dir
    }

    pub async fn append_pump(&self, ev: &PumpEvent) -> Result<()> {
        self.append(&self.pumps, ev.ts_ms, ev).await
    }

    pub async fn append_sample(&self, sample: &Sample) -> Result<()> {
        self.append(&self.samples, sample.t, sample).await
    }

    async fn append<T: Serialize>(&self, family: &Family, ts_ms: i64, record: &T) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize log record")?;
        family.append_line(self.clock.to_local(ts_ms), &line).await?;
        family.sweep(self.cutoff()).await?;
        Ok(())
    }

    fn cutoff(&self) -> NaiveDateTime {
        self.clock.to_local(self.clock.now_ms()) - ChronoDuration::days(self.keep_days as i64)
    }

    /// Sum of `ml` over the pump partitions of the trailing `days` local
    /// days, today included. Unreadable files and malformed lines are skipped.
    pub async fn sum_ml(&self, days: u32) -> f64 {
        let days = days.max(1);
        let today = self.clock.to_local(self.clock.now_ms()).date();

        let mut total = 0.0;
        for back in 0..days {
            let day = today - ChronoDuration::days(back as i64);
            let Some(midnight) = day.and_hms_opt(0, 0, 0) else {
                continue;
            };
            let path = self.pumps.path_for(midnight);
            let contents = match fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            total += contents.lines().filter_map(line_ml).sum::<f64>();
        }
        total
    }
}

fn line_ml(line: &str) -> Option<f64> {
    let obj: Value = serde_json::from_str(line).ok()?;
    let ml = match obj.get("ml")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    ml.filter(|v| v.is_finite())
}

// ===========================================================================
// Tests
// ===========================================================================
