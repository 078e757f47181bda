//! The filesystem watcher: translates native notify events into the three
//! changes the matrix understands.

use crate::{
    error::{EngineError, Result},
    utils::{is_path_excluded, RelPath},
};
use notify::{
    event::{AccessKind, AccessMode, ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// A change to a path under the project root. Hidden paths never appear.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsChange {
    Added(RelPath),
    Deleted(RelPath),
    Modified(RelPath),
    /// The watcher backend reported an error; live updates may be degraded.
    Failed(String),
}

/// Recursive watch over the project root, delivering [`FsChange`]s to the
/// engine's event loop.
///
/// The notify callback runs on the backend's own thread and must not block:
/// it only translates the event and pushes it onto an unbounded channel.
#[derive(Debug)]
pub struct FsWatcher {
    // Kept alive for the duration of the watch.
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<FsChange>,
}

impl FsWatcher {
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let root_owned = root.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in translate(&root_owned, &event) {
                        let _ = tx.send(change);
                    }
                }
                Err(err) => {
                    let _ = tx.send(FsChange::Failed(err.to_string()));
                }
            }
        })
        .map_err(|err| EngineError::Watcher(err.to_string()))?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| EngineError::Watcher(err.to_string()))?;
        Ok(FsWatcher { _watcher: watcher, rx })
    }

    /// The next change; `None` only if the backend thread is gone.
    pub async fn next(&mut self) -> Option<FsChange> {
        self.rx.recv().await
    }

    /// Non-blocking drain, used by tests and the sync pass.
    pub fn try_next(&mut self) -> Option<FsChange> {
        self.rx.try_recv().ok()
    }
}

/// Maps one native event onto matrix changes. Events for excluded paths and
/// event kinds the engine does not care about are dropped.
fn translate(root: &Path, event: &Event) -> Vec<FsChange> {
    let rel = |path: &PathBuf| -> Option<RelPath> {
        let stripped = path.strip_prefix(root).ok()?;
        if is_path_excluded(stripped) {
            return None;
        }
        RelPath::from_root(root, path)
    };
    let mut changes = Vec::new();
    match &event.kind {
        EventKind::Create(_) => {
            changes.extend(event.paths.iter().filter_map(&rel).map(FsChange::Added));
        }
        EventKind::Remove(_) => {
            changes.extend(event.paths.iter().filter_map(&rel).map(FsChange::Deleted));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            changes.extend(event.paths.iter().filter_map(&rel).map(FsChange::Deleted));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            changes.extend(event.paths.iter().filter_map(&rel).map(FsChange::Added));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // First path is the old name, second the new one.
            if let Some(old) = event.paths.first() {
                changes.extend(rel(old).map(FsChange::Deleted));
            }
            if let Some(new) = event.paths.get(1) {
                changes.extend(rel(new).map(FsChange::Added));
            }
        }
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Metadata(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            changes.extend(event.paths.iter().filter_map(&rel).map(FsChange::Modified));
        }
        _ => {}
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use pretty_assertions::assert_eq;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn create_and_remove_translate() {
        let root = Path::new("/project");
        let created = event(EventKind::Create(CreateKind::File), &["/project/src/a.rs"]);
        assert_eq!(
            translate(root, &created),
            vec![FsChange::Added(RelPath::new("./src/a.rs"))]
        );
        let removed = event(EventKind::Remove(RemoveKind::File), &["/project/src/a.rs"]);
        assert_eq!(
            translate(root, &removed),
            vec![FsChange::Deleted(RelPath::new("./src/a.rs"))]
        );
    }

    #[test]
    fn renames_translate_to_delete_and_add() {
        let root = Path::new("/project");
        let from =
            event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/project/old.rs"]);
        assert_eq!(translate(root, &from), vec![FsChange::Deleted(RelPath::new("./old.rs"))]);
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/project/old.rs", "/project/new.rs"],
        );
        assert_eq!(
            translate(root, &both),
            vec![
                FsChange::Deleted(RelPath::new("./old.rs")),
                FsChange::Added(RelPath::new("./new.rs")),
            ]
        );
    }

    #[test]
    fn writes_and_attrib_changes_translate_to_modified() {
        let root = Path::new("/project");
        for kind in [
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            EventKind::Access(AccessKind::Close(AccessMode::Write)),
        ] {
            let modified = event(kind, &["/project/a.rs"]);
            assert_eq!(
                translate(root, &modified),
                vec![FsChange::Modified(RelPath::new("./a.rs"))]
            );
        }
    }

    #[test]
    fn hidden_and_foreign_paths_are_dropped() {
        let root = Path::new("/project");
        let hidden =
            event(EventKind::Create(CreateKind::File), &["/project/.git/index"]);
        assert_eq!(translate(root, &hidden), vec![]);
        let outside = event(EventKind::Create(CreateKind::File), &["/elsewhere/a.rs"]);
        assert_eq!(translate(root, &outside), vec![]);
    }

    #[test]
    fn irrelevant_kinds_are_ignored() {
        let root = Path::new("/project");
        let accessed = event(
            EventKind::Access(AccessKind::Close(AccessMode::Read)),
            &["/project/a.rs"],
        );
        assert_eq!(translate(root, &accessed), vec![]);
    }

    #[tokio::test]
    async fn live_events_are_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FsWatcher::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("fresh.rs"), "x").unwrap();
        let change = tokio::time::timeout(std::time::Duration::from_secs(5), watcher.next())
            .await
            .expect("watcher should report the new file")
            .unwrap();
        match change {
            FsChange::Added(path) | FsChange::Modified(path) => {
                assert_eq!(path, RelPath::new("./fresh.rs"));
            }
            other => panic!("unexpected change {other:?}"),
        }
    }
}
