//! The artifact store.
//!
//! Persists one rendered report per (file, tool) cell under the cache
//! directory. Small reports are a single compressed blob; reports longer
//! than [`PAGE_SIZE`] lines become a paged list so arbitrarily large tool
//! output never has to be resident in memory at once.

use crate::{
    compression::Compression,
    error::{EngineError, Result},
    paged::{PagedList, PAGE_SIZE},
    utils::{self, RelPath},
};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::{
    cell::RefCell,
    fs, io,
    num::NonZeroUsize,
    ops::Range,
    path::{Path, PathBuf},
    rc::Rc,
};

/// Decoded reports kept in memory across all cells.
const REPORT_CACHE_SIZE: usize = 50;

/// What actually sits in the single artifact file: either the whole report,
/// or a descriptor for the sibling pages directory.
#[derive(Debug, Serialize, Deserialize)]
enum StoredReport {
    Full { lines: Vec<String> },
    Paged { len: usize, page_count: usize, page_size: usize },
}

/// A lazily loaded report.
///
/// Cloning is cheap; page data is shared. `Unknown` is what a missing or
/// unreadable artifact looks like to the rest of the engine, rendered as a
/// single "?" line.
#[derive(Clone, Debug)]
pub enum Report {
    Unknown,
    Full(Rc<Vec<String>>),
    Paged(Rc<PagedList<String>>),
}

impl Report {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Report::Unknown)
    }

    pub fn len(&self) -> usize {
        match self {
            Report::Unknown => 1,
            Report::Full(lines) => lines.len(),
            Report::Paged(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn line(&self, index: usize) -> Result<String> {
        match self {
            Report::Unknown => Ok("?".to_string()),
            Report::Full(lines) => lines
                .get(index)
                .cloned()
                .ok_or_else(|| EngineError::msg(format!("line {index} out of bounds"))),
            Report::Paged(list) => list.get(index),
        }
    }

    /// `lines[range]`; for a paged report only the pages overlapping the
    /// range are read.
    pub fn slice(&self, range: Range<usize>) -> Result<Vec<String>> {
        match self {
            Report::Unknown => Ok(vec!["?".to_string()]),
            Report::Full(lines) => {
                let start = range.start.min(lines.len());
                let stop = range.end.min(lines.len());
                Ok(lines[start..stop].to_vec())
            }
            Report::Paged(list) => list.slice(range),
        }
    }
}

/// Derives the artifact file stem for a cell: `<cache>/<rel_path>-<tool>`.
pub fn artifact_stem(cache_root: &Path, path: &RelPath, tool_name: &str) -> PathBuf {
    cache_root.join(format!("{}-{}", path.stripped(), tool_name))
}

fn pages_dir(stem: &Path) -> PathBuf {
    let mut dir = stem.as_os_str().to_owned();
    dir.push(".pages");
    PathBuf::from(dir)
}

/// Store for rendered reports, one blob (or paged list) per cell.
#[derive(Debug)]
pub struct ReportStore {
    cache_root: PathBuf,
    reports: RefCell<LruCache<PathBuf, Report>>,
}

impl ReportStore {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        ReportStore {
            cache_root: cache_root.into(),
            reports: RefCell::new(LruCache::new(NonZeroUsize::new(REPORT_CACHE_SIZE).unwrap())),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn stem(&self, path: &RelPath, tool_name: &str) -> PathBuf {
        artifact_stem(&self.cache_root, path, tool_name)
    }

    /// Persists a report. The write is atomic: the blob goes to a tmp
    /// sibling first and is renamed into place, and for a paged report the
    /// pages directory is fully built before the descriptor becomes
    /// visible.
    pub fn put(
        &self,
        path: &RelPath,
        tool_name: &str,
        lines: Vec<String>,
        compression: Compression,
    ) -> Result<()> {
        let stem = self.stem(path, tool_name);
        let stored = if lines.len() > PAGE_SIZE {
            let list =
                PagedList::create(&lines, pages_dir(&stem), PAGE_SIZE, compression)?;
            StoredReport::Paged {
                len: list.len(),
                page_count: list.page_count(),
                page_size: PAGE_SIZE,
            }
        } else {
            // A previous run of the same cell may have been paged.
            let _ = fs::remove_dir_all(pages_dir(&stem));
            StoredReport::Full { lines }
        };
        let bytes = compression.encode(&stored).map_err(|err| EngineError::storage(err, &stem))?;
        utils::write_atomic(&stem, &bytes)?;
        self.reports.borrow_mut().pop(&stem);
        trace!("stored report at \"{}\"", stem.display());
        Ok(())
    }

    /// Loads the report for a cell.
    ///
    /// A missing, corrupted or otherwise unreadable artifact comes back as
    /// [`Report::Unknown`]; the caller reschedules such cells instead of
    /// failing.
    pub fn get(&self, path: &RelPath, tool_name: &str, compression: Compression) -> Report {
        let stem = self.stem(path, tool_name);
        if let Some(report) = self.reports.borrow_mut().get(&stem) {
            return report.clone();
        }
        let report = match self.read(&stem, compression) {
            Ok(report) => report,
            Err(err) => {
                if !err.is_not_found() {
                    debug!("treating unreadable artifact \"{}\" as missing: {err}", stem.display());
                }
                Report::Unknown
            }
        };
        if !report.is_unknown() {
            self.reports.borrow_mut().put(stem, report.clone());
        }
        report
    }

    fn read(&self, stem: &Path, compression: Compression) -> Result<Report> {
        let bytes = fs::read(stem).map_err(|err| EngineError::storage(err, stem))?;
        let stored: StoredReport =
            compression.decode(&bytes).map_err(|err| EngineError::storage(err, stem))?;
        Ok(match stored {
            StoredReport::Full { lines } => Report::Full(Rc::new(lines)),
            StoredReport::Paged { len, page_count, page_size } => Report::Paged(Rc::new(
                PagedList::open(pages_dir(stem), page_size, len, page_count, compression),
            )),
        })
    }

    /// Removes the artifact blob and any pages directory.
    ///
    /// "Not found" is fine (the cell may never have completed); any other
    /// filesystem error surfaces as a storage failure.
    pub fn delete(&self, path: &RelPath, tool_name: &str) -> Result<()> {
        let stem = self.stem(path, tool_name);
        self.reports.borrow_mut().pop(&stem);
        match fs::remove_file(&stem) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(EngineError::storage(err, &stem)),
        }
        match fs::remove_dir_all(pages_dir(&stem)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(EngineError::storage(err, pages_dir(&stem))),
        }
        Ok(())
    }

    /// Drops a cell's decoded report from the in-memory cache.
    pub fn evict(&self, path: &RelPath, tool_name: &str) {
        let stem = self.stem(path, tool_name);
        self.reports.borrow_mut().pop(&stem);
    }

    /// Whether the artifact file exists on disk.
    pub fn exists(&self, path: &RelPath, tool_name: &str) -> bool {
        self.stem(path, tool_name).exists()
    }
}
