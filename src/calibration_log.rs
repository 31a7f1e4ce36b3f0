//! Append-only history of calibration rounds.
//!
//! One CSV row per round, no header:
//! `board,reference_channel,temperature,offset,gain,ppm_change`.
//! Existing rows are never rewritten.

use crate::Result;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

/// Default file name of the calibration history.
pub const DEFAULT_LOG_FILE: &str = "calibt.csv";

/// One calibration round as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub board: u32,
    pub reference_channel: u8,
    /// Board temperature in °C.
    pub temperature: f64,
    /// Offset register after the round, µV.
    pub offset: i64,
    /// Gain register after the round.
    pub gain: i64,
    /// Gain change of this round in ppm; zero if nothing was written.
    pub ppm_change: i64,
}

impl LogRow {
    fn fields(&self) -> [String; 6] {
        [
            self.board.to_string(),
            self.reference_channel.to_string(),
            format!("{:.2}", self.temperature),
            self.offset.to_string(),
            self.gain.to_string(),
            self.ppm_change.to_string(),
        ]
    }
}

/// Sink for calibration rows.
pub trait CalibrationLog {
    /// Appends `row`; it must be durable once this returns.
    fn append(&mut self, row: &LogRow) -> Result<()>;
}

impl CalibrationLog for Vec<LogRow> {
    fn append(&mut self, row: &LogRow) -> Result<()> {
        self.push(row.clone());
        Ok(())
    }
}

impl<L: CalibrationLog + ?Sized> CalibrationLog for &mut L {
    fn append(&mut self, row: &LogRow) -> Result<()> {
        (**self).append(row)
    }
}

/// [`CalibrationLog`] appending to a CSV file.
pub struct CsvCalibrationLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvCalibrationLog {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationLog for CsvCalibrationLog {
    fn append(&mut self, row: &LogRow) -> Result<()> {
        self.writer.write_record(row.fields())?;
        self.writer.flush()?;
        log::debug!("Appended calibration row to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(gain: i64, ppm_change: i64) -> LogRow {
        LogRow {
            board: 12,
            reference_channel: 0,
            temperature: 24.5,
            offset: -1750,
            gain,
            ppm_change,
        }
    }

    #[test]
    fn csv_log_appends_rows() {
        let path = std::env::temp_dir().join(format!("bm857-calib-{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut log = CsvCalibrationLog::open(&path).unwrap();
            log.append(&row(5_000_000, 0)).unwrap();
        }
        {
            let mut log = CsvCalibrationLog::open(&path).unwrap();
            assert_eq!(log.path(), path.as_path());
            log.append(&row(5_000_250, 50)).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            content,
            "12,0,24.50,-1750,5000000,0\n12,0,24.50,-1750,5000250,50\n"
        );
    }

    #[test]
    fn vec_log_keeps_order() {
        let mut rows = Vec::new();
        let mut log = &mut rows;
        CalibrationLog::append(&mut log, &row(1, 0)).unwrap();
        CalibrationLog::append(&mut log, &row(2, 0)).unwrap();
        assert_eq!(rows.iter().map(|r| r.gain).collect::<Vec<_>>(), vec![1, 2]);
    }
}
