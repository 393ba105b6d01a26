//! Left/right result history
//!
//! Stores one entry per measured pair. Results are paired by recency: a new
//! channel result fills the most recent entry whose side is still empty,
//! otherwise a fresh entry is appended. Entries are never removed.
//!
//! ## CSV format
//!
//! ```text
//! timestamp,left_mag,right_mag
//! 2024-05-01T10:15:42.1234567+02:00,1543.5,-1
//! ```
//!
//! The column suffix is `mag` for Goertzel results and `rms` for RMS
//! results. Unset sides are written as `-1`. Timestamps use the ISO-8601
//! round-trip layout with seven fractional digits.

use crate::audio::detector::Detector;
use crate::measure::session::Channel;
use chrono::{DateTime, FixedOffset, Local, SubsecRound, Timelike};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Value written for a side that has not been measured
const UNSET: f64 = -1.0;

/// Errors from CSV export and import
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Missing or unrecognized CSV header: {0:?}")]
    BadHeader(String),

    #[error("Malformed CSV line {line}: {reason}")]
    BadLine { line: usize, reason: String },
}

/// One left/right pair
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEntry {
    /// When the entry was created
    pub timestamp: DateTime<FixedOffset>,
    /// Left estimate, `None` until measured
    pub left: Option<f64>,
    /// Right estimate, `None` until measured
    pub right: Option<f64>,
}

impl ResultEntry {
    /// Both sides measured
    pub fn is_complete(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    pub fn get(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::Left => self.left,
            Channel::Right => self.right,
        }
    }

    fn slot_mut(&mut self, channel: Channel) -> &mut Option<f64> {
        match channel {
            Channel::Left => &mut self.left,
            Channel::Right => &mut self.right,
        }
    }

    fn to_csv_line(&self) -> String {
        format!(
            "{},{},{}",
            format_timestamp(&self.timestamp),
            self.left.unwrap_or(UNSET),
            self.right.unwrap_or(UNSET)
        )
    }
}

/// ISO-8601 round-trip layout: seven fractional digits (100 ns ticks)
fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    format!(
        "{}.{:07}{}",
        ts.format("%Y-%m-%dT%H:%M:%S"),
        ts.nanosecond() % 1_000_000_000 / 100,
        ts.format("%:z")
    )
}

/// Current local time, truncated to what the CSV layout can represent
fn now() -> DateTime<FixedOffset> {
    Local::now().trunc_subsecs(7).fixed_offset()
}

/// Append-only history of measured pairs
#[derive(Debug, Default, Clone)]
pub struct ResultStore {
    entries: Vec<ResultEntry>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a channel estimate
    ///
    /// Fills the most recent entry whose `channel` side is unset, or appends
    /// a new entry when there is none. Returns the index of the entry written.
    pub fn record(&mut self, channel: Channel, value: f64) -> usize {
        self.record_at(channel, value, now())
    }

    /// Like [`record`](Self::record) with an explicit timestamp for new entries
    pub fn record_at(
        &mut self,
        channel: Channel,
        value: f64,
        timestamp: DateTime<FixedOffset>,
    ) -> usize {
        if let Some(idx) = self.entries.iter().rposition(|e| e.get(channel).is_none()) {
            *self.entries[idx].slot_mut(channel) = Some(value);
            return idx;
        }

        let mut entry = ResultEntry {
            timestamp,
            left: None,
            right: None,
        };
        *entry.slot_mut(channel) = Some(value);
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn entries(&self) -> &[ResultEntry] {
        &self.entries
    }

    /// Most recent entry, complete or not
    pub fn latest(&self) -> Option<&ResultEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// CSV header line for results measured with `detector`
    pub fn csv_header(detector: Detector) -> String {
        let label = detector.csv_label();
        format!("timestamp,left_{label},right_{label}")
    }

    /// Write the history as CSV
    pub fn write_csv<W: Write>(&self, mut writer: W, detector: Detector) -> io::Result<()> {
        writeln!(writer, "{}", Self::csv_header(detector))?;
        for entry in &self.entries {
            writeln!(writer, "{}", entry.to_csv_line())?;
        }
        writer.flush()
    }

    /// Write the history to a CSV file, replacing it if present
    pub fn export_csv(&self, path: &Path, detector: Detector) -> Result<(), StoreError> {
        let file = File::create(path)?;
        self.write_csv(BufWriter::new(file), detector)?;
        tracing::info!(
            path = %path.display(),
            entries = self.entries.len(),
            "Exported results"
        );
        Ok(())
    }

    /// Parse CSV produced by [`write_csv`](Self::write_csv)
    ///
    /// Accepts either header variant and returns the detector it names.
    /// Negative values are read back as unset sides.
    pub fn read_csv<R: BufRead>(reader: R) -> Result<(Self, Detector), StoreError> {
        let mut lines = reader.lines();

        let header = lines.next().transpose()?.unwrap_or_default();
        let header = header.trim_end();
        let detector = [Detector::Goertzel, Detector::Rms]
            .into_iter()
            .find(|d| Self::csv_header(*d) == header)
            .ok_or_else(|| StoreError::BadHeader(header.to_string()))?;

        let mut entries = Vec::new();
        for (i, line) in lines.enumerate() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            entries.push(parse_line(line).map_err(|reason| StoreError::BadLine {
                line: i + 2,
                reason,
            })?);
        }

        Ok((Self { entries }, detector))
    }

    /// Read a CSV file written by [`export_csv`](Self::export_csv)
    pub fn import_csv(path: &Path) -> Result<(Self, Detector), StoreError> {
        let file = File::open(path)?;
        Self::read_csv(BufReader::new(file))
    }
}

fn parse_line(line: &str) -> Result<ResultEntry, String> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 3 {
        return Err(format!("expected 3 fields, found {}", fields.len()));
    }

    let timestamp = DateTime::parse_from_rfc3339(fields[0])
        .map_err(|e| format!("bad timestamp {:?}: {e}", fields[0]))?;
    let side = |s: &str| -> Result<Option<f64>, String> {
        let v: f64 = s.parse().map_err(|e| format!("bad value {s:?}: {e}"))?;
        Ok((v >= 0.0).then_some(v))
    };

    Ok(ResultEntry {
        timestamp,
        left: side(fields[1])?,
        right: side(fields[2])?,
    })
}
