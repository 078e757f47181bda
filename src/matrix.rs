//! The summary matrix: one ordered row per file, one cell per applicable
//! tool, with the cursor, counters and mutation operations the rest of the
//! engine is built on.

use crate::{
    cell::ResultCell,
    error::Result,
    status::Status,
    store::ReportStore,
    tools::{Tool, ToolRegistry},
    utils::RelPath,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Total order of the matrix rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// `(dirname, extension, basename)`: files grouped by location.
    #[default]
    Directory,
    /// `(extension, dirname, basename)`: files grouped by type.
    Type,
}

impl SortOrder {
    pub fn toggled(self) -> SortOrder {
        match self {
            SortOrder::Directory => SortOrder::Type,
            SortOrder::Type => SortOrder::Directory,
        }
    }

    fn key(self, path: &RelPath) -> (String, String, String) {
        match self {
            SortOrder::Directory => (
                path.dirname().to_string(),
                path.extension().to_string(),
                path.basename().to_string(),
            ),
            SortOrder::Type => (
                path.extension().to_string(),
                path.dirname().to_string(),
                path.basename().to_string(),
            ),
        }
    }
}

/// One file's row: its path, the change time observed when the row was last
/// synced, and one cell per tool applicable at creation time.
#[derive(Debug)]
pub struct Entry {
    pub path: RelPath,
    pub change_time: u64,
    pub cells: Vec<ResultCell>,
    appearance: RefCell<Option<String>>,
}

impl Entry {
    pub fn new(path: RelPath, change_time: u64, cells: Vec<ResultCell>) -> Self {
        Entry { path, change_time, cells, appearance: RefCell::new(None) }
    }

    pub fn width(&self) -> usize {
        self.cells.len()
    }

    pub fn invalidate_appearance(&self) {
        *self.appearance.borrow_mut() = None;
    }

    /// Rendered status row: one glyph per cell, padded so the path column
    /// lines up across rows. Cached until a cell changes.
    pub fn appearance(&self, max_width: usize) -> String {
        if let Some(cached) = self.appearance.borrow().as_ref() {
            return cached.clone();
        }
        let glyphs: String = self.cells.iter().map(ResultCell::glyph).collect();
        let padding = " ".repeat(max_width.saturating_sub(self.cells.len()) + 1);
        let rendered = format!("{glyphs}{padding}{}", self.path.stripped());
        *self.appearance.borrow_mut() = Some(rendered.clone());
        rendered
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Entry {}

/// The ordered set of entries plus the cursor and derived counters.
///
/// Mutations bump `revision`, which is how the placeholder scheduler learns
/// that its in-flight sweep is stale.
#[derive(Debug)]
pub struct Summary {
    entries: Vec<Entry>,
    sort_order: SortOrder,
    /// Virtual cursor; `x` may exceed the current row's width.
    cursor: (usize, usize),
    viewport_top: usize,
    viewport_height: usize,
    result_total: usize,
    completed_total: usize,
    max_entry_width: usize,
    max_path_length: usize,
    revision: u64,
}

impl Default for Summary {
    fn default() -> Self {
        Summary::new(SortOrder::Directory)
    }
}

impl Summary {
    pub fn new(sort_order: SortOrder) -> Self {
        Summary {
            entries: Vec::new(),
            sort_order,
            cursor: (0, 0),
            viewport_top: 0,
            viewport_height: 20,
            result_total: 0,
            completed_total: 0,
            max_entry_width: 0,
            max_path_length: 0,
            revision: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    pub fn result_total(&self) -> usize {
        self.result_total
    }

    pub fn completed_total(&self) -> usize {
        self.completed_total
    }

    pub fn max_entry_width(&self) -> usize {
        self.max_entry_width
    }

    pub fn max_path_length(&self) -> usize {
        self.max_path_length
    }

    /// Monotonic mutation counter; changes whenever anything the scheduler
    /// depends on (structure, statuses, cursor, sort) changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) {
        self.revision += 1;
    }

    /// `(width, height)` of the rendered matrix.
    pub fn appearance_dimensions(&self) -> (usize, usize) {
        (self.max_path_length + 1 + self.max_entry_width, self.entries.len())
    }

    pub fn set_viewport_height(&mut self, height: usize) {
        self.viewport_height = height.max(1);
    }

    // --- lookup ---------------------------------------------------------

    fn position(&self, path: &RelPath) -> std::result::Result<usize, usize> {
        let key = self.sort_order.key(path);
        self.entries.binary_search_by(|entry| self.sort_order.key(&entry.path).cmp(&key))
    }

    pub fn contains(&self, path: &RelPath) -> bool {
        self.position(path).is_ok()
    }

    pub fn entry_index(&self, path: &RelPath) -> Option<usize> {
        self.position(path).ok()
    }

    pub fn entry(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    pub fn cell(&self, entry_index: usize, cell_index: usize) -> Option<&ResultCell> {
        self.entries.get(entry_index)?.cells.get(cell_index)
    }

    /// Locates a cell by path and tool name; indices are only valid until
    /// the next structural mutation.
    pub fn find_cell(&self, path: &RelPath, tool_name: &str) -> Option<(usize, usize)> {
        let entry_index = self.entry_index(path)?;
        let cell_index = self.entries[entry_index]
            .cells
            .iter()
            .position(|cell| cell.tool.name == tool_name)?;
        Some((entry_index, cell_index))
    }

    // --- structural mutations -------------------------------------------

    /// Handles a newly appeared file: builds its row from the tools
    /// applicable right now and inserts it in sort order. A path already
    /// present is a no-op. Returns `true` when pending cells were added.
    pub fn on_file_added(
        &mut self,
        path: RelPath,
        change_time: u64,
        registry: &ToolRegistry,
    ) -> bool {
        if self.contains(&path) {
            return false;
        }
        let cells = registry
            .tools_for_path(&path)
            .into_iter()
            .map(|tool| ResultCell::new(path.clone(), tool))
            .collect();
        self.insert_entry(Entry::new(path, change_time, cells))
    }

    /// Inserts a prebuilt row (restores use this; its cells may already be
    /// terminal). Returns `true` when the row brought pending cells.
    pub fn insert_entry(&mut self, entry: Entry) -> bool {
        let index = match self.position(&entry.path) {
            Ok(_) => return false,
            Err(index) => index,
        };
        let pending = entry.cells.iter().any(|cell| !cell.is_terminal());
        self.result_total += entry.cells.len();
        self.completed_total += entry.cells.iter().filter(|cell| cell.is_terminal()).count();
        self.max_entry_width = self.max_entry_width.max(entry.width());
        self.max_path_length = self.max_path_length.max(entry.path.len());
        let had_rows = !self.entries.is_empty();
        self.entries.insert(index, entry);
        if had_rows && index <= self.cursor.1 {
            self.cursor.1 += 1;
            if index <= self.viewport_top {
                self.viewport_top += 1;
            }
        }
        self.bump();
        pending
    }

    /// Handles a disappeared file: removes the row, its counters and every
    /// on-disk artifact. Unknown paths are a no-op.
    pub fn on_file_deleted(&mut self, path: &RelPath, store: &ReportStore) -> Result<()> {
        let index = match self.position(path) {
            Ok(index) => index,
            Err(_) => return Ok(()),
        };
        let entry = self.entries.remove(index);
        self.result_total -= entry.cells.len();
        self.completed_total -= entry.cells.iter().filter(|cell| cell.is_terminal()).count();
        if entry.width() == self.max_entry_width || entry.path.len() == self.max_path_length {
            self.recompute_maxima();
        }
        if index < self.cursor.1 {
            self.cursor.1 -= 1;
        }
        if self.cursor.1 >= self.entries.len() {
            self.cursor.1 = self.entries.len().saturating_sub(1);
        }
        self.viewport_top = self.viewport_top.min(self.entries.len().saturating_sub(1));
        self.bump();
        for cell in &entry.cells {
            store.delete(&entry.path, cell.tool.name)?;
        }
        Ok(())
    }

    /// Handles a modified file: every cell of the row goes back to
    /// `Pending` so the row reflects exactly the new content, and the
    /// observed change time is updated. Returns `true` when jobs were
    /// added.
    pub fn on_file_modified(
        &mut self,
        path: &RelPath,
        change_time: u64,
        store: &ReportStore,
    ) -> Result<bool> {
        let index = match self.position(path) {
            Ok(index) => index,
            Err(_) => return Ok(false),
        };
        self.entries[index].change_time = change_time;
        let mut jobs_added = false;
        for cell_index in 0..self.entries[index].cells.len() {
            self.reset_cell(index, cell_index, store)?;
            jobs_added = true;
        }
        Ok(jobs_added)
    }

    fn recompute_maxima(&mut self) {
        self.max_entry_width = self.entries.iter().map(Entry::width).max().unwrap_or(0);
        self.max_path_length = self.entries.iter().map(|entry| entry.path.len()).max().unwrap_or(0);
    }

    // --- cell mutations -------------------------------------------------

    /// Records a new status for one cell, keeping `completed_total` in sync
    /// and invalidating the row's rendered appearance.
    pub fn set_cell_status(&mut self, entry_index: usize, cell_index: usize, status: Status) {
        let Some(entry) = self.entries.get_mut(entry_index) else { return };
        let Some(cell) = entry.cells.get_mut(cell_index) else { return };
        let was_terminal = cell.is_terminal();
        cell.set_status(status);
        entry.invalidate_appearance();
        match (was_terminal, status.is_terminal()) {
            (false, true) => self.completed_total += 1,
            (true, false) => self.completed_total -= 1,
            _ => {}
        }
        self.bump();
    }

    /// Records the compression a completed report was written with.
    pub fn set_cell_compression(
        &mut self,
        entry_index: usize,
        cell_index: usize,
        compression: crate::compression::Compression,
    ) {
        if let Some(entry) = self.entries.get_mut(entry_index) {
            if let Some(cell) = entry.cells.get_mut(cell_index) {
                cell.compression = Some(compression);
            }
        }
    }

    fn reset_cell(&mut self, entry_index: usize, cell_index: usize, store: &ReportStore) -> Result<()> {
        let entry = &mut self.entries[entry_index];
        let cell = &mut entry.cells[cell_index];
        let was_terminal = cell.is_terminal();
        cell.reset(store)?;
        entry.invalidate_appearance();
        if was_terminal {
            self.completed_total -= 1;
        }
        self.bump();
        Ok(())
    }

    /// Re-runs a completed cell: resets it and reports whether a job was
    /// added. Non-terminal cells are left alone (refresh is advisory).
    pub fn refresh(&mut self, entry_index: usize, cell_index: usize, store: &ReportStore) -> Result<bool> {
        match self.cell(entry_index, cell_index) {
            Some(cell) if cell.is_terminal() => {}
            _ => return Ok(false),
        }
        self.reset_cell(entry_index, cell_index, store)?;
        Ok(true)
    }

    /// Refreshes every completed cell of the given tool across all rows.
    /// Returns the number of jobs added.
    pub fn refresh_tool(&mut self, tool: &'static Tool, store: &ReportStore) -> Result<usize> {
        let mut refreshed = 0;
        for entry_index in 0..self.entries.len() {
            let cell_index = self.entries[entry_index]
                .cells
                .iter()
                .position(|cell| std::ptr::eq(cell.tool, tool));
            if let Some(cell_index) = cell_index {
                if self.refresh(entry_index, cell_index, store)? {
                    refreshed += 1;
                }
            }
        }
        Ok(refreshed)
    }

    /// Coerces every `Running` cell back to `Pending`. Used after a
    /// restore: the workers of the previous run are gone.
    pub fn clear_running(&mut self) {
        for entry in &mut self.entries {
            let mut changed = false;
            for cell in &mut entry.cells {
                if cell.status == Status::Running {
                    cell.set_status(Status::Pending);
                    changed = true;
                }
            }
            if changed {
                entry.invalidate_appearance();
            }
        }
        self.bump();
    }

    // --- sorting and selection ------------------------------------------

    /// Re-sorts under the new key, preserving the selection by path.
    pub fn sort_entries(&mut self, order: SortOrder) {
        self.sort_order = order;
        self.keep_selection(|summary| {
            summary
                .entries
                .sort_by(|a, b| order.key(&a.path).cmp(&order.key(&b.path)));
        });
        self.bump();
    }

    /// Runs `block`, then moves the cursor back to the row holding the
    /// remembered path, or clamps to the last row when it vanished.
    pub fn keep_selection<T>(&mut self, block: impl FnOnce(&mut Self) -> T) -> T {
        let selected = self.selection().map(|(entry, _)| entry.path.clone());
        let result = block(self);
        if let Some(path) = selected {
            if let Some(index) = self.entries.iter().position(|entry| entry.path == path) {
                self.cursor.1 = index;
            } else if self.cursor.1 >= self.entries.len() {
                self.cursor.1 = self.entries.len().saturating_sub(1);
            }
        }
        result
    }

    /// The selected entry and cell, if the matrix is non-empty.
    pub fn selection(&self) -> Option<(&Entry, &ResultCell)> {
        let (x, y) = self.cursor_position();
        let entry = self.entries.get(y)?;
        let cell = entry.cells.get(x)?;
        Some((entry, cell))
    }

    // --- cursor ---------------------------------------------------------

    /// Effective cursor position: the virtual x clamped to the current
    /// row's width, so the cursor glides across rows of different widths
    /// without losing its remembered column. `(0, 0)` on an empty matrix.
    pub fn cursor_position(&self) -> (usize, usize) {
        let (x, y) = self.cursor;
        match self.entries.get(y) {
            Some(entry) if entry.width() > 0 => (x.min(entry.width() - 1), y),
            _ => (0, y.min(self.entries.len().saturating_sub(1))),
        }
    }

    /// Places the cursor directly, clamping the row to the matrix; used
    /// when restoring a snapshot and by mouse selection.
    pub fn set_cursor_position(&mut self, x: usize, y: usize) {
        let y = y.min(self.entries.len().saturating_sub(1));
        self.set_cursor((x, y));
    }

    fn set_cursor(&mut self, cursor: (usize, usize)) {
        if cursor != self.cursor {
            self.cursor = cursor;
            self.bump();
        }
    }

    pub fn cursor_down(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let (x, y) = self.cursor;
        self.set_cursor((x, (y + 1) % self.entries.len()));
    }

    pub fn cursor_up(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let (x, y) = self.cursor;
        self.set_cursor((x, (y + self.entries.len() - 1) % self.entries.len()));
    }

    pub fn cursor_right(&mut self) {
        let (x, y) = self.cursor_position();
        let Some(width) = self.entries.get(y).map(Entry::width).filter(|w| *w > 0) else {
            return;
        };
        self.set_cursor(((x + 1) % width, y));
    }

    pub fn cursor_left(&mut self) {
        let (x, y) = self.cursor_position();
        let Some(width) = self.entries.get(y).map(Entry::width).filter(|w| *w > 0) else {
            return;
        };
        self.set_cursor(((x + width - 1) % width, y));
    }

    pub fn cursor_home(&mut self) {
        let (x, _) = self.cursor;
        self.set_cursor((x, 0));
    }

    pub fn cursor_end(&mut self) {
        let (x, _) = self.cursor;
        self.set_cursor((x, self.entries.len().saturating_sub(1)));
    }

    pub fn cursor_page_up(&mut self) {
        self.scroll(0, self.viewport_height as isize);
    }

    pub fn cursor_page_down(&mut self) {
        self.scroll(0, -(self.viewport_height as isize));
    }

    /// Mouse-drag style scrolling: positive `dy` scrolls the view up, the
    /// cursor moves with the content.
    pub fn scroll(&mut self, _dx: isize, dy: isize) {
        if self.entries.is_empty() {
            return;
        }
        let dy = dy.min(self.viewport_top as isize);
        self.viewport_top = (self.viewport_top as isize - dy)
            .clamp(0, self.entries.len() as isize - 1) as usize;
        let (x, y) = self.cursor;
        let len = self.entries.len() as isize;
        let new_y = ((y as isize - dy) % len + len) % len;
        self.set_cursor((x, new_y as usize));
    }

    pub fn viewport_top(&self) -> usize {
        self.viewport_top
    }

    /// Moves the cursor to the next cell with a `Problem` status, scanning
    /// rows from the cursor downward (wrapping), left to right within each
    /// row. With `only_tool`, other tools' problems are skipped. The cursor
    /// stays put when there is no such cell.
    pub fn move_to_next_issue(&mut self, only_tool: Option<&'static Tool>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let (x, y) = self.cursor_position();
        let row_count = self.entries.len();
        for step in 0..=row_count {
            let row_index = (step + y) % row_count;
            for (cell_index, cell) in self.entries[row_index].cells.iter().enumerate() {
                if cell.status != Status::Problem {
                    continue;
                }
                // Skip the cells at or before the cursor on the first visit
                // of its own row; they are reachable again after the wrap.
                if row_index == y && cell_index <= x && step != row_count {
                    continue;
                }
                if let Some(tool) = only_tool {
                    if !std::ptr::eq(cell.tool, tool) {
                        continue;
                    }
                }
                self.set_cursor((cell_index, row_index));
                return true;
            }
        }
        false
    }
}
