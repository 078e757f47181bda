//! Versioned snapshot of the engine state.
//!
//! Layout: a 4-byte magic, a little-endian `u32` format version, then a
//! gzip-compressed JSON body holding the sort order, cursor, log tail and
//! every entry with its cells. Artifacts are not part of the snapshot; they
//! already live in their own files. A huge matrix spills its entry list
//! into a paged list under `summary_dir/` so loading stays bounded in
//! memory.
//!
//! Anything unexpected (wrong magic, unknown version, truncated or corrupt
//! body) is a load failure, and the engine falls back to a cold start.

use crate::{
    compression::Compression,
    error::{EngineError, Result},
    matrix::{Entry, SortOrder, Summary},
    paged::{PagedList, PAGE_SIZE},
    status::Status,
    utils::{self, RelPath},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"SCRN";
pub const SNAPSHOT_VERSION: u32 = 1;

/// File name of the snapshot inside the cache directory.
pub const SNAPSHOT_FILE: &str = "summary.snapshot";

/// Directory name for a paged-out entry list.
pub const SUMMARY_PAGES_DIR: &str = "summary_dir";

/// Entry count above which the entry list is paged out instead of being
/// embedded in the snapshot body.
pub const SUMMARY_PAGE_THRESHOLD: usize = 10_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CellSnap {
    pub tool: String,
    /// Identity hash of the tool that produced the result; a mismatch on
    /// load means the cached status is stale.
    pub identity: String,
    pub status: Status,
    pub scroll: (usize, usize),
    pub compression: Option<Compression>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntrySnap {
    pub path: RelPath,
    pub change_time: u64,
    pub cells: Vec<CellSnap>,
}

impl EntrySnap {
    pub fn capture(entry: &Entry) -> Self {
        EntrySnap {
            path: entry.path.clone(),
            change_time: entry.change_time,
            cells: entry
                .cells
                .iter()
                .map(|cell| CellSnap {
                    tool: cell.tool.name.to_string(),
                    identity: cell.tool.identity_hash().to_string(),
                    status: cell.status,
                    scroll: cell.scroll_position,
                    compression: cell.compression,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum SnapshotEntries {
    Inline(Vec<EntrySnap>),
    Paged { len: usize, page_count: usize, page_size: usize },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    sort_order: SortOrder,
    cursor: (usize, usize),
    unsaved_jobs_total: usize,
    log_tail: Vec<String>,
    entries: SnapshotEntries,
}

impl Snapshot {
    pub fn capture(summary: &Summary, log_tail: Vec<String>, unsaved_jobs_total: usize) -> Self {
        Snapshot {
            sort_order: summary.sort_order(),
            cursor: summary.cursor_position(),
            unsaved_jobs_total,
            log_tail,
            entries: SnapshotEntries::Inline(
                summary.entries().iter().map(EntrySnap::capture).collect(),
            ),
        }
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    pub fn cursor(&self) -> (usize, usize) {
        self.cursor
    }

    pub fn unsaved_jobs_total(&self) -> usize {
        self.unsaved_jobs_total
    }

    pub fn log_tail(&self) -> &[String] {
        &self.log_tail
    }

    pub fn entry_count(&self) -> usize {
        match &self.entries {
            SnapshotEntries::Inline(entries) => entries.len(),
            SnapshotEntries::Paged { len, .. } => *len,
        }
    }

    /// Streams the entries back out, reading pages lazily for a paged-out
    /// list.
    pub fn entries(&self, cache_root: &Path) -> Result<EntryStream<'_>> {
        Ok(match &self.entries {
            SnapshotEntries::Inline(entries) => EntryStream {
                inline: Some(entries.iter()),
                paged: None,
                index: 0,
            },
            SnapshotEntries::Paged { len, page_count, page_size } => EntryStream {
                inline: None,
                paged: Some(PagedList::open(
                    cache_root.join(SUMMARY_PAGES_DIR),
                    *page_size,
                    *len,
                    *page_count,
                    Compression::Gzip,
                )),
                index: 0,
            },
        })
    }
}

/// Iterator over snapshot entries; owned values so callers can build rows
/// directly from them.
pub struct EntryStream<'a> {
    inline: Option<std::slice::Iter<'a, EntrySnap>>,
    paged: Option<PagedList<EntrySnap>>,
    index: usize,
}

impl Iterator for EntryStream<'_> {
    type Item = Result<EntrySnap>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(inline) = &mut self.inline {
            return inline.next().cloned().map(Ok);
        }
        let paged = self.paged.as_ref()?;
        if self.index >= paged.len() {
            return None;
        }
        let item = paged.get(self.index);
        self.index += 1;
        Some(item)
    }
}

fn snapshot_path(cache_root: &Path) -> PathBuf {
    cache_root.join(SNAPSHOT_FILE)
}

/// Serializes and atomically writes the snapshot, paging the entry list out
/// when it exceeds `page_threshold` rows.
pub fn write(cache_root: &Path, mut snapshot: Snapshot, page_threshold: usize) -> Result<()> {
    if let SnapshotEntries::Inline(entries) = &snapshot.entries {
        if entries.len() > page_threshold {
            let list = PagedList::create(
                entries,
                cache_root.join(SUMMARY_PAGES_DIR),
                PAGE_SIZE,
                Compression::Gzip,
            )?;
            snapshot.entries = SnapshotEntries::Paged {
                len: list.len(),
                page_count: list.page_count(),
                page_size: PAGE_SIZE,
            };
        }
    }
    let path = snapshot_path(cache_root);
    let body = Compression::Gzip
        .encode(&snapshot)
        .map_err(|err| EngineError::storage(err, &path))?;
    let mut bytes = Vec::with_capacity(8 + body.len());
    bytes.extend_from_slice(&SNAPSHOT_MAGIC);
    bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&body);
    utils::write_atomic(&path, &bytes)?;
    trace!("wrote snapshot with {} entries", snapshot.entry_count());
    Ok(())
}

/// Reads and validates a snapshot. Every failure mode is a [`EngineError::Load`].
pub fn read(cache_root: &Path) -> Result<Snapshot> {
    let path = snapshot_path(cache_root);
    let bytes = fs::read(&path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            EngineError::Load("no snapshot".to_string())
        } else {
            EngineError::Load(err.to_string())
        }
    })?;
    if bytes.len() < 8 || bytes[..4] != SNAPSHOT_MAGIC {
        return Err(EngineError::Load("bad magic".to_string()));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().expect("length was checked"));
    if version != SNAPSHOT_VERSION {
        return Err(EngineError::Load(format!(
            "snapshot version {version} is not {SNAPSHOT_VERSION}"
        )));
    }
    Compression::Gzip
        .decode(&bytes[8..])
        .map_err(|err| EngineError::Load(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cell::ResultCell, tools};
    use pretty_assertions::assert_eq;

    fn sample_summary(rows: usize) -> Summary {
        let mut summary = Summary::default();
        for index in 0..rows {
            let path = RelPath::new(format!("./f{index:04}.py"));
            let mut cells = vec![
                ResultCell::new(path.clone(), tools::tool_by_name("contents").unwrap()),
                ResultCell::new(path.clone(), tools::tool_by_name("metadata").unwrap()),
            ];
            cells[0].set_status(Status::Ok);
            cells[0].compression = Some(Compression::Gzip);
            cells[1].set_status(Status::Running);
            summary.insert_entry(Entry::new(path, 7, cells));
        }
        summary
    }

    #[test]
    fn round_trips_inline() {
        let dir = tempfile::tempdir().unwrap();
        let summary = sample_summary(5);
        let snapshot =
            Snapshot::capture(&summary, vec!["a log line".to_string()], 3);
        write(dir.path(), snapshot, SUMMARY_PAGE_THRESHOLD).unwrap();

        let loaded = read(dir.path()).unwrap();
        assert_eq!(loaded.entry_count(), 5);
        assert_eq!(loaded.log_tail(), &["a log line".to_string()]);
        assert_eq!(loaded.unsaved_jobs_total(), 3);
        let entries: Vec<_> =
            loaded.entries(dir.path()).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries[0].cells[0].status, Status::Ok);
        assert_eq!(entries[0].cells[1].status, Status::Running);
        assert_eq!(entries[0].change_time, 7);
    }

    #[test]
    fn huge_matrix_pages_out() {
        let dir = tempfile::tempdir().unwrap();
        let summary = sample_summary(30);
        let snapshot = Snapshot::capture(&summary, Vec::new(), 0);
        // Tiny threshold to exercise the paged path.
        write(dir.path(), snapshot, 10).unwrap();
        assert!(dir.path().join(SUMMARY_PAGES_DIR).is_dir());

        let loaded = read(dir.path()).unwrap();
        assert_eq!(loaded.entry_count(), 30);
        let entries: Vec<_> =
            loaded.entries(dir.path()).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 30);
        assert_eq!(entries[29].path, RelPath::new("./f0029.py"));
    }

    #[test]
    fn missing_snapshot_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(read(dir.path()), Err(EngineError::Load(_))));
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);
        fs::write(&path, b"NOPE0000junk").unwrap();
        assert!(matches!(read(dir.path()), Err(EngineError::Load(_))));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&99u32.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        match read(dir.path()) {
            Err(EngineError::Load(msg)) => assert!(msg.contains("version")),
            other => panic!("expected load failure, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        bytes.extend_from_slice(b"this is not gzip");
        fs::write(&path, bytes).unwrap();
        assert!(matches!(read(dir.path()), Err(EngineError::Load(_))));
    }
}
