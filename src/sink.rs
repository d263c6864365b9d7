//! Report Sink
//!
//! Receives finished tables with a section identifier. Writing is the only side
//! effect of a run and happens after a table is complete.

use crate::error::{AttributionError, Result};
use crate::pivot::Table;
use polars::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;
use tracing::info;

pub trait ReportSink {
    fn write_table(&mut self, section: &str, table: &Table) -> Result<()>;

    /// Flush buffered output. Called once after the last table.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Section names become file names; keep them to a safe character set.
pub fn check_section(section: &str) -> Result<()> {
    let valid = !section.is_empty()
        && section
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !section.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(AttributionError::Config(format!(
            "section '{}' must be alphanumeric with '_', '-' or '.'",
            section
        )))
    }
}

/// One `<section>.csv` per table. Tables are buffered and written on `finish`, so a
/// plan that fails part way leaves the directory untouched.
pub struct CsvDirectorySink {
    dir: PathBuf,
    sections: Vec<(String, Table)>,
    written: Vec<PathBuf>,
}

impl CsvDirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sections: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl ReportSink for CsvDirectorySink {
    fn write_table(&mut self, section: &str, table: &Table) -> Result<()> {
        check_section(section)?;
        self.sections.push((section.to_string(), table.clone()));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        // Render every frame before touching the filesystem.
        let mut frames = Vec::with_capacity(self.sections.len());
        for (section, table) in &self.sections {
            frames.push((self.dir.join(format!("{}.csv", section)), table.to_dataframe()?));
        }
        std::fs::create_dir_all(&self.dir)?;
        for (path, mut df) in frames {
            let mut file = File::create(&path)?;
            CsvWriter::new(&mut file)
                .include_header(true)
                .with_separator(b',')
                .finish(&mut df)?;
            info!(path = %path.display(), rows = df.height(), "wrote table");
            self.written.push(path);
        }
        self.sections.clear();
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct JsonSection<'a> {
    section: String,
    #[serde(flatten)]
    table: &'a Table,
}

/// All tables in one JSON document, written on `finish`.
pub struct JsonReportSink {
    path: PathBuf,
    sections: Vec<(String, Table)>,
}

impl JsonReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sections: Vec::new(),
        }
    }
}

impl ReportSink for JsonReportSink {
    fn write_table(&mut self, section: &str, table: &Table) -> Result<()> {
        check_section(section)?;
        self.sections.push((section.to_string(), table.clone()));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let document: Vec<JsonSection> = self
            .sections
            .iter()
            .map(|(section, table)| JsonSection {
                section: section.clone(),
                table,
            })
            .collect();
        let file = File::create(&self.path)?;
        serde_json::to_writer_pretty(file, &document)?;
        info!(path = %self.path.display(), tables = document.len(), "wrote report");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    pub tables: Vec<(String, Table)>,
    pub finished: bool,
}

impl MemorySink {
    pub fn get(&self, section: &str) -> Option<&Table> {
        self.tables.iter().find(|(s, _)| s == section).map(|(_, t)| t)
    }
}

impl ReportSink for MemorySink {
    fn write_table(&mut self, section: &str, table: &Table) -> Result<()> {
        check_section(section)?;
        self.tables.push((section.to_string(), table.clone()));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
