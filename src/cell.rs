//! Result cells: the in-memory handle for one (path, tool) pair.

use crate::{
    compression::Compression,
    error::Result,
    status::Status,
    store::ReportStore,
    tools::Tool,
    utils::RelPath,
};

/// One cell of the summary matrix: the state of one tool's report for one
/// file.
///
/// A cell is created `Pending` when its file appears (or when a refresh
/// resets it), moves to `Running` on dispatch, and lands on a terminal
/// status when the worker replies. The rendered report itself lives in the
/// artifact store; the cell only remembers how to find it.
#[derive(Debug)]
pub struct ResultCell {
    pub path: RelPath,
    pub tool: &'static Tool,
    pub status: Status,
    /// Scroll position of the report viewer for this cell, `(col, row)`.
    pub scroll_position: (usize, usize),
    /// Codec the report was written with; `None` until the first completion.
    pub compression: Option<Compression>,
}

impl ResultCell {
    pub fn new(path: RelPath, tool: &'static Tool) -> Self {
        ResultCell { path, tool, status: Status::Pending, scroll_position: (0, 0), compression: None }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Atomically records a new status. Does not persist anything; the
    /// snapshot pass picks the value up later.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Returns the cell to `Pending` and removes its artifact from disk.
    /// Safe to call repeatedly.
    pub fn reset(&mut self, store: &ReportStore) -> Result<()> {
        self.set_status(Status::Pending);
        self.scroll_position = (0, 0);
        self.compression = None;
        store.delete(&self.path, self.tool.name)
    }

    /// Loads this cell's report from the store; `Unknown` when it has never
    /// completed or the artifact is unreadable.
    pub fn report(&self, store: &ReportStore) -> crate::store::Report {
        match self.compression {
            Some(compression) if self.is_terminal() => {
                store.get(&self.path, self.tool.name, compression)
            }
            _ => crate::store::Report::Unknown,
        }
    }

    pub fn glyph(&self) -> String {
        self.status.glyph()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools;

    fn cell() -> ResultCell {
        ResultCell::new(RelPath::new("./a.py"), tools::tool_by_name("contents").unwrap())
    }

    #[test]
    fn new_cells_are_pending() {
        let cell = cell();
        assert_eq!(cell.status, Status::Pending);
        assert!(!cell.is_terminal());
        assert!(cell.compression.is_none());
    }

    #[test]
    fn reset_is_idempotent_and_deletes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        let mut cell = cell();
        store
            .put(&cell.path, cell.tool.name, vec!["x".to_string()], Compression::Gzip)
            .unwrap();
        cell.set_status(Status::Ok);
        cell.compression = Some(Compression::Gzip);
        cell.scroll_position = (3, 7);

        cell.reset(&store).unwrap();
        assert_eq!(cell.status, Status::Pending);
        assert_eq!(cell.scroll_position, (0, 0));
        assert!(!store.exists(&cell.path, cell.tool.name));

        // Resetting again changes nothing and does not fail.
        cell.reset(&store).unwrap();
        assert_eq!(cell.status, Status::Pending);
    }

    #[test]
    fn report_is_unknown_until_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        let mut cell = cell();
        assert!(cell.report(&store).is_unknown());

        store
            .put(&cell.path, cell.tool.name, vec!["out".to_string()], Compression::Gzip)
            .unwrap();
        cell.set_status(Status::Ok);
        cell.compression = Some(Compression::Gzip);
        let report = cell.report(&store);
        assert!(!report.is_unknown());
        assert_eq!(report.line(0).unwrap(), "out");
    }
}
