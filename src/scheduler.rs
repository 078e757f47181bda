//! The placeholder scheduler: hands idle workers the pending cell closest to
//! the cursor, so the visible region of the matrix comes alive first.
//!
//! Two lazy sweeps start at the cursor: one walks down-and-right, the other
//! up-and-left, both wrapping around the matrix. The down sweep serves the
//! rest of the cursor row first, so the row under the cursor always
//! completes before anything else; after that, picks alternate between the
//! two arms. A pass inspects at most `result_total` cells so a matrix with
//! no pending cells terminates instead of spinning. The scheduler owns no
//! state beyond the current sweep; any matrix change (structure, sort,
//! cursor, statuses) discards it, and the next demand starts a fresh pass
//! from the cursor.

use crate::{matrix::Summary, status::Status, tools::Tool, utils::RelPath};

/// A cell picked by the scheduler, identified structurally: the matrix may
/// mutate between the pick and its dispatch, so indices would go stale.
#[derive(Clone, Debug)]
pub struct CellRef {
    pub path: RelPath,
    pub tool: &'static Tool,
}

/// One scheduling step. `Continue` means "inspected a non-pending cell";
/// the caller yields to the event loop and steps again, so a large matrix
/// never starves other tasks.
#[derive(Clone, Debug)]
pub enum SweepStep {
    Found(CellRef),
    Continue,
    End,
}

/// Walks `row[y][x..]`, then full rows below the cursor, wrapping.
#[derive(Debug)]
struct DownArm {
    y: usize,
    x: usize,
}

impl DownArm {
    fn next(&mut self, summary: &Summary) -> Option<(usize, usize)> {
        let rows = summary.len();
        let mut scanned = 0;
        loop {
            let width = summary.entry(self.y)?.width();
            if self.x < width {
                let position = (self.y, self.x);
                self.x += 1;
                return Some(position);
            }
            self.y = (self.y + 1) % rows;
            self.x = 0;
            scanned += 1;
            if scanned > rows {
                return None;
            }
        }
    }
}

/// Walks `row[y][..x]` right-to-left, then full rows above the cursor,
/// wrapping, each right-to-left.
#[derive(Debug)]
struct UpArm {
    y: usize,
    /// Cells still to emit in the current row; the next emitted index is
    /// `remaining - 1`.
    remaining: usize,
}

impl UpArm {
    fn next(&mut self, summary: &Summary) -> Option<(usize, usize)> {
        let rows = summary.len();
        let mut scanned = 0;
        loop {
            if self.remaining > 0 {
                self.remaining -= 1;
                return Some((self.y, self.remaining));
            }
            self.y = (self.y + rows - 1) % rows;
            self.remaining = summary.entry(self.y)?.width();
            scanned += 1;
            if scanned > rows {
                return None;
            }
        }
    }
}

#[derive(Debug)]
struct Sweep {
    revision: u64,
    inspected: usize,
    cap: usize,
    down: DownArm,
    up: UpArm,
    /// Cursor-row cells the down arm still owes before alternation starts.
    cursor_row_remaining: usize,
    next_is_down: bool,
}

impl Sweep {
    fn new(summary: &Summary) -> Self {
        let (x, y) = summary.cursor_position();
        let cursor_row_remaining =
            summary.entry(y).map(|entry| entry.width().saturating_sub(x)).unwrap_or(0);
        Sweep {
            revision: summary.revision(),
            inspected: 0,
            cap: summary.result_total(),
            down: DownArm { y, x },
            up: UpArm { y, remaining: x },
            cursor_row_remaining,
            // The cursor row counts as the down arm's turn, so the up arm
            // opens the alternation.
            next_is_down: false,
        }
    }

    fn step(&mut self, summary: &Summary) -> SweepStep {
        if self.inspected >= self.cap {
            return SweepStep::End;
        }
        let from_cursor_row = self.cursor_row_remaining > 0;
        let position = if from_cursor_row {
            self.cursor_row_remaining -= 1;
            self.down.next(summary)
        } else if self.next_is_down {
            self.down.next(summary)
        } else {
            self.up.next(summary)
        };
        let Some((y, x)) = position else { return SweepStep::End };
        self.inspected += 1;
        let Some(cell) = summary.cell(y, x) else { return SweepStep::Continue };
        if cell.status == Status::Pending {
            if !from_cursor_row {
                self.next_is_down = !self.next_is_down;
            }
            SweepStep::Found(CellRef { path: cell.path.clone(), tool: cell.tool })
        } else {
            SweepStep::Continue
        }
    }
}

/// Produces pending cells in cursor-proximity order.
#[derive(Debug, Default)]
pub struct PlaceholderScheduler {
    sweep: Option<Sweep>,
}

impl PlaceholderScheduler {
    pub fn new() -> Self {
        PlaceholderScheduler::default()
    }

    /// Advances the current pass by one inspected cell.
    ///
    /// The returned cell was `Pending` at the moment it was observed;
    /// nothing reserves it, and by dispatch time it may have been reset.
    /// That race is benign: the superseded artifact is overwritten on the
    /// next pass.
    pub fn step(&mut self, summary: &Summary) -> SweepStep {
        let stale = match &self.sweep {
            Some(sweep) => sweep.revision != summary.revision(),
            None => true,
        };
        if stale {
            self.sweep = Some(Sweep::new(summary));
        }
        self.sweep.as_mut().expect("sweep was just ensured").step(summary)
    }

    /// Discards the in-flight pass explicitly.
    pub fn invalidate(&mut self) {
        self.sweep = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cell::ResultCell,
        matrix::Entry,
        tools,
    };
    use pretty_assertions::assert_eq;

    fn summary(rows: usize, cols: usize) -> Summary {
        let mut summary = Summary::default();
        let names = ["contents", "metadata", "pycodestyle", "pyflakes"];
        for row in 0..rows {
            let path = RelPath::new(format!("./f{row:02}.py"));
            let cells = names[..cols]
                .iter()
                .map(|name| ResultCell::new(path.clone(), tools::tool_by_name(name).unwrap()))
                .collect();
            summary.insert_entry(Entry::new(path, 0, cells));
        }
        summary
    }

    /// Drains one pass, recording every yielded cell.
    fn drain(scheduler: &mut PlaceholderScheduler, summary: &mut Summary) -> Vec<(String, String)> {
        let mut picked = Vec::new();
        loop {
            match scheduler.step(summary) {
                SweepStep::Found(cell) => {
                    let position = summary.find_cell(&cell.path, cell.tool.name).unwrap();
                    summary.set_cell_status(position.0, position.1, Status::Ok);
                    picked.push((cell.path.as_str().to_string(), cell.tool.name.to_string()));
                }
                SweepStep::Continue => {}
                SweepStep::End => return picked,
            }
        }
    }

    #[test]
    fn empty_matrix_ends_immediately() {
        let summary = Summary::default();
        let mut scheduler = PlaceholderScheduler::new();
        assert!(matches!(scheduler.step(&summary), SweepStep::End));
    }

    #[test]
    fn down_sweep_dominates_from_cursor() {
        let mut summary = summary(20, 2);
        for _ in 0..10 {
            summary.cursor_down();
        }
        let mut scheduler = PlaceholderScheduler::new();
        let picked = drain(&mut scheduler, &mut summary);
        assert_eq!(picked[0], ("./f10.py".to_string(), "contents".to_string()));
        assert_eq!(picked[1], ("./f10.py".to_string(), "metadata".to_string()));
        // Everything gets picked exactly once overall.
        assert_eq!(picked.len(), 40);
        assert_eq!(summary.completed_total(), 40);
    }

    #[test]
    fn yields_only_pending_cells() {
        let mut summary = summary(4, 2);
        summary.set_cell_status(1, 0, Status::Ok);
        summary.set_cell_status(2, 1, Status::Running);
        let mut scheduler = PlaceholderScheduler::new();
        let picked = drain(&mut scheduler, &mut summary);
        assert_eq!(picked.len(), 6);
        assert!(!picked.contains(&("./f01.py".to_string(), "contents".to_string())));
        assert!(!picked.contains(&("./f02.py".to_string(), "metadata".to_string())));
    }

    #[test]
    fn pass_is_capped_at_result_total() {
        let mut summary = summary(5, 2);
        // Complete everything; a pass must end after at most result_total
        // inspections rather than looping.
        for row in 0..5 {
            for col in 0..2 {
                summary.set_cell_status(row, col, Status::Normal);
            }
        }
        let mut scheduler = PlaceholderScheduler::new();
        let mut steps = 0;
        loop {
            match scheduler.step(&summary) {
                SweepStep::End => break,
                SweepStep::Continue => steps += 1,
                SweepStep::Found(_) => panic!("nothing is pending"),
            }
            assert!(steps <= summary.result_total());
        }
        assert_eq!(steps, summary.result_total());
    }

    #[test]
    fn cursor_move_restarts_the_pass() {
        let mut summary = summary(6, 1);
        let mut scheduler = PlaceholderScheduler::new();
        let first = match scheduler.step(&summary) {
            SweepStep::Found(cell) => cell,
            other => panic!("expected a pick, got {other:?}"),
        };
        assert_eq!(first.path, RelPath::new("./f00.py"));
        // Moving the cursor invalidates the sweep; the next pick starts at
        // the new cursor row.
        summary.cursor_down();
        summary.cursor_down();
        match scheduler.step(&summary) {
            SweepStep::Found(cell) => assert_eq!(cell.path, RelPath::new("./f02.py")),
            other => panic!("expected a pick, got {other:?}"),
        }
    }

    #[test]
    fn cursor_row_first_then_alternation() {
        let mut summary = summary(5, 2);
        for _ in 0..2 {
            summary.cursor_down();
        }
        // Sweep without mutating statuses: the whole cursor row comes
        // first, then picks alternate up/down around it.
        let mut scheduler = PlaceholderScheduler::new();
        let mut order = Vec::new();
        loop {
            match scheduler.step(&summary) {
                SweepStep::Found(cell) => {
                    order.push((cell.path.as_str().to_string(), cell.tool.name));
                    if order.len() == 6 {
                        break;
                    }
                }
                SweepStep::Continue => {}
                SweepStep::End => break,
            }
        }
        let expected = [
            ("./f02.py", "contents"),
            ("./f02.py", "metadata"),
            ("./f01.py", "metadata"),
            ("./f03.py", "contents"),
            ("./f01.py", "contents"),
            ("./f03.py", "metadata"),
        ];
        let expected: Vec<_> =
            expected.iter().map(|(path, tool)| (path.to_string(), *tool)).collect();
        assert_eq!(order, expected);
    }
}
