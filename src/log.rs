//! The activity log: a bounded in-memory buffer of timestamped lines,
//! mirrored to a plain-text file in the cache directory.

use crate::utils::timestamp_now;
use std::{
    collections::VecDeque,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};
use yansi::{Color, Paint};

/// Lines retained in memory. The file mirror is unbounded.
const LOG_CAPACITY: usize = 200;

#[derive(Debug)]
pub struct ActivityLog {
    lines: VecDeque<String>,
    file_path: PathBuf,
}

impl ActivityLog {
    pub fn new(cache_root: &Path) -> Self {
        ActivityLog { lines: VecDeque::new(), file_path: cache_root.join("log") }
    }

    /// Appends a timestamped message, trimming the buffer to the last
    /// [`LOG_CAPACITY`] lines and mirroring the line to the log file.
    pub fn message(&mut self, message: impl AsRef<str>) {
        let timestamp = Paint::new(timestamp_now()).fg(Color::Fixed(244)).bold().to_string();
        let line = format!("{timestamp} {}", message.as_ref());
        if let Ok(mut file) =
            OpenOptions::new().create(true).append(true).open(&self.file_path)
        {
            let _ = writeln!(file, "{line}");
        }
        self.lines.push_back(line);
        while self.lines.len() > LOG_CAPACITY {
            self.lines.pop_front();
        }
    }

    /// Appends a message styled as an engine action rather than plain info.
    pub fn command(&mut self, message: impl AsRef<str>) {
        self.message(Paint::new(message.as_ref()).fg(Color::Green).to_string());
    }

    /// The retained tail, oldest first.
    pub fn tail(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Replaces the in-memory buffer, e.g. from a restored snapshot.
    pub fn restore_tail(&mut self, lines: Vec<String>) {
        self.lines = lines.into_iter().collect();
        while self.lines.len() > LOG_CAPACITY {
            self.lines.pop_front();
        }
    }

    /// Removes the on-disk mirror; called once at startup so each run's file
    /// starts fresh.
    pub fn delete_file(&self) {
        let _ = std::fs::remove_file(&self.file_path);
    }
}
