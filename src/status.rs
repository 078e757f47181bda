//! The status sum type shared between the engine and its workers.

use serde::{Deserialize, Serialize};
use yansi::{Color, Paint};

/// Outcome of one tool run on one file, or the run's lifecycle state.
///
/// The discriminants are the wire protocol: a worker reports a completed job
/// as a single status integer on stdout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Status {
    Ok = 1,
    Problem = 2,
    Normal = 3,
    Error = 4,
    NotApplicable = 5,
    Running = 6,
    Pending = 7,
    TimedOut = 8,
}

impl Status {
    /// All statuses a worker is allowed to report for a finished job.
    pub const REPORTABLE: &'static [Status] = &[
        Status::Ok,
        Status::Problem,
        Status::Normal,
        Status::Error,
        Status::NotApplicable,
        Status::TimedOut,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Status> {
        Some(match code {
            1 => Status::Ok,
            2 => Status::Problem,
            3 => Status::Normal,
            4 => Status::Error,
            5 => Status::NotApplicable,
            6 => Status::Running,
            7 => Status::Pending,
            8 => Status::TimedOut,
            _ => return None,
        })
    }

    /// Translates a worker's reply into a terminal status.
    ///
    /// Anything outside the reportable set, including a syntactically valid
    /// but non-terminal code, is treated as `Error`.
    pub fn from_worker_reply(line: &str) -> Status {
        match line.trim().parse::<u8>().ok().and_then(Status::from_code) {
            Some(status) if Status::REPORTABLE.contains(&status) => status,
            _ => Status::Error,
        }
    }

    /// `true` once the cell no longer needs a worker: anything but `Pending`
    /// and `Running`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending | Status::Running)
    }

    pub fn meaning(self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Problem => "Problem",
            Status::Normal => "Normal",
            Status::Error => "Error",
            Status::NotApplicable => "Not applicable",
            Status::Running => "Running",
            Status::Pending => "Pending",
            Status::TimedOut => "Timed out",
        }
    }

    fn color(self) -> Option<Color> {
        match self {
            Status::Ok => Some(Color::Green),
            Status::Problem => Some(Color::Red),
            Status::Normal => Some(Color::Fixed(252)),
            Status::NotApplicable => Some(Color::Fixed(244)),
            Status::Running => Some(Color::Blue),
            Status::TimedOut => Some(Color::Magenta),
            Status::Error => Some(Color::Red),
            Status::Pending => None,
        }
    }

    /// Single-character colored indicator used in the summary matrix.
    pub fn glyph(self) -> String {
        match self {
            Status::Pending => ".".to_string(),
            Status::Error => Paint::new("E").bg(Color::Red).fg(Color::White).to_string(),
            other => {
                let color = other.color().expect("non-pending status has a color");
                Paint::new(" ").bg(color).to_string()
            }
        }
    }
}
