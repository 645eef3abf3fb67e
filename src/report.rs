use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use tracing::info;

use crate::cache::write_atomically;

pub const ERRORS_FILE: &str = "errors";

/// One line per failed feed or malformed document.
#[derive(Debug, Default)]
pub struct ErrorReport {
    lines: Mutex<Vec<String>>,
}

impl ErrorReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, line: impl Into<String>) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_previous(output_dir: &Path) -> io::Result<()> {
        match fs::remove_file(output_dir.join(ERRORS_FILE)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Writes the report next to the page. Nothing is written for a clean run.
    pub fn write(&self, output_dir: &Path) -> io::Result<usize> {
        let lines = self.lines();
        if lines.is_empty() {
            return Ok(0);
        }

        let mut text = lines.join("\n");
        text.push('\n');
        write_atomically(&output_dir.join(ERRORS_FILE), text.as_bytes())?;
        info!("Wrote {} problems to {}", lines.len(), ERRORS_FILE);
        Ok(lines.len())
    }
}
