//! Objective trace: `(iteration, elapsed, objective)` records kept in memory
//! and optionally appended to a JSON-lines file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::CoordinatorError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectiveRecord {
    pub iteration: u64,
    pub elapsed_secs: f64,
    pub objective: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ObjectiveLog {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    records: Vec<ObjectiveRecord>,
}

impl ObjectiveLog {
    /// In-memory log only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log that also writes every record to `path`, truncating it.
    pub fn to_file(path: impl AsRef<Path>) -> Result<Self, CoordinatorError> {
        let path = path.as_ref().to_path_buf();
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self {
            path: Some(path),
            writer: Some(writer),
            records: Vec::new(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn records(&self) -> &[ObjectiveRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&ObjectiveRecord> {
        self.records.last()
    }

    pub fn record(
        &mut self,
        iteration: u64,
        elapsed_secs: f64,
        objective: f64,
    ) -> Result<(), CoordinatorError> {
        info!(iteration, elapsed_secs, objective, "objective");
        let rec = ObjectiveRecord {
            iteration,
            elapsed_secs,
            objective,
            recorded_at: Utc::now(),
        };
        if let Some(w) = &mut self.writer {
            serde_json::to_writer(&mut *w, &rec)?;
            w.write_all(b"\n")?;
        }
        self.records.push(rec);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), CoordinatorError> {
        if let Some(w) = &mut self.writer {
            w.flush()?;
        }
        Ok(())
    }
}
