//! The engine controller.
//!
//! Owns the matrix, scheduler, store, registry, log and the two
//! synchronisation events, wires the filesystem watcher and the worker pool
//! together, and snapshots the whole state to the cache directory.
//!
//! Everything runs on a single-threaded cooperative runtime: state is held
//! in `RefCell`s and every mutation completes between `.await` points, so
//! no locks are needed. Parallelism comes from the worker subprocesses.

use crate::{
    compression::Compression,
    error::{EngineError, Result},
    events::Event,
    log::ActivityLog,
    matrix::{Entry, SortOrder, Summary},
    cell::ResultCell,
    scheduler::{CellRef, PlaceholderScheduler, SweepStep},
    snapshot::{self, Snapshot, SUMMARY_PAGE_THRESHOLD},
    status::Status,
    store::ReportStore,
    tools::{self, ToolRegistry, THEME_ENV},
    utils::{self, RelPath},
    watcher::{FsChange, FsWatcher},
    worker::{WorkerHandle, WORKER_RETRY_LIMIT},
    CACHE_DIR_NAME,
};
use std::{
    cell::{Cell, Ref, RefCell},
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
    time::Instant,
};
use tokio::task::{self, JoinHandle};

/// Completed jobs between automatic snapshots.
pub const SNAPSHOT_INTERVAL: usize = 5_000;

/// Entries between progress log lines during restore and the initial walk.
const PROGRESS_INTERVAL: usize = 5_000;

/// File whose mtime marks when the cache was created.
const CREATION_TIME_FILE: &str = "creation_time";

/// File recording the tool-table fingerprint the cache was built with.
const TOOLS_FINGERPRINT_FILE: &str = "tools.fingerprint";

pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Startup configuration, handed over by the external launcher.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub worker_count: usize,
    pub compression: Compression,
    /// Syntax highlighting theme, exported to workers via the environment.
    pub theme: Option<String>,
    /// Editor command for the UI layer; the engine only carries it.
    pub editor_command: Option<String>,
    /// Under test, completion triggers a shutdown instead of idling.
    pub under_test: bool,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        EngineConfig {
            root: root.into(),
            worker_count: default_worker_count(),
            compression: Compression::default(),
            theme: None,
            editor_command: None,
            under_test: false,
        }
    }
}

/// The report-maintenance engine for one project directory.
#[derive(Debug)]
pub struct Engine {
    root: PathBuf,
    cache_root: PathBuf,
    compression: Compression,
    worker_count: usize,
    under_test: bool,
    editor_command: Option<String>,
    registry: ToolRegistry,
    store: ReportStore,
    summary: RefCell<Summary>,
    scheduler: RefCell<PlaceholderScheduler>,
    log: RefCell<ActivityLog>,
    /// Set whenever new pending cells may exist; cleared by a worker loop
    /// each time it drains the scheduler.
    pub jobs_added: Event,
    /// Set whenever a visible quantity changed; consumed by the UI layer.
    pub appearance_changed: Event,
    /// Set once every cell is terminal.
    pub completion: Event,
    shutdown: Event,
    unsaved_jobs_total: Cell<usize>,
    restore_complete: Cell<bool>,
    pending_restore: RefCell<Option<Snapshot>>,
    worker_pgids: RefCell<Vec<i32>>,
    warm_start: bool,
}

impl Engine {
    /// Validates the project directory, prepares the cache and loads the
    /// previous snapshot if a compatible one exists.
    pub fn new(config: EngineConfig) -> Result<Rc<Engine>> {
        let meta = fs::metadata(&config.root)
            .map_err(|err| EngineError::fatal_init(&config.root, err))?;
        if !meta.is_dir() {
            return Err(EngineError::fatal_init(&config.root, "not a directory"));
        }
        let root = config
            .root
            .canonicalize()
            .map_err(|err| EngineError::fatal_init(&config.root, err))?;
        if let Some(theme) = &config.theme {
            std::env::set_var(THEME_ENV, theme);
        }

        let cache_root = root.join(CACHE_DIR_NAME);
        manage_cache(&cache_root)?;

        let mut log = ActivityLog::new(&cache_root);
        log.delete_file();

        let pending_restore = match snapshot::read(&cache_root) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                debug!("cold start: {err}");
                None
            }
        };
        let warm_start = pending_restore.is_some();
        let summary = Summary::new(
            pending_restore.as_ref().map(Snapshot::sort_order).unwrap_or_default(),
        );
        let unsaved_jobs_total =
            pending_restore.as_ref().map(Snapshot::unsaved_jobs_total).unwrap_or(0);
        if let Some(snapshot) = &pending_restore {
            log.restore_tail(snapshot.log_tail().to_vec());
        }
        log.message("Program started.");

        Ok(Rc::new(Engine {
            registry: ToolRegistry::new(&root),
            store: ReportStore::new(&cache_root),
            root,
            cache_root,
            compression: config.compression,
            worker_count: config.worker_count.max(1),
            under_test: config.under_test,
            editor_command: config.editor_command,
            summary: RefCell::new(summary),
            scheduler: RefCell::new(PlaceholderScheduler::new()),
            log: RefCell::new(log),
            jobs_added: Event::new(),
            appearance_changed: Event::new(),
            completion: Event::new(),
            shutdown: Event::new(),
            unsaved_jobs_total: Cell::new(unsaved_jobs_total),
            restore_complete: Cell::new(false),
            pending_restore: RefCell::new(pending_restore),
            worker_pgids: RefCell::new(Vec::new()),
            warm_start,
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn editor_command(&self) -> Option<&str> {
        self.editor_command.as_deref()
    }

    pub fn is_warm_start(&self) -> bool {
        self.warm_start
    }

    pub fn summary(&self) -> Ref<'_, Summary> {
        self.summary.borrow()
    }

    pub fn summary_mut(&self) -> std::cell::RefMut<'_, Summary> {
        self.summary.borrow_mut()
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    pub fn log_tail(&self) -> Vec<String> {
        self.log.borrow().tail()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.set();
    }

    /// Runs the engine until an interrupt (or, under test, completion).
    /// Must execute inside a `tokio::task::LocalSet` on a current-thread
    /// runtime.
    pub async fn run(self: Rc<Self>) -> Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let engine = self.clone();
        tasks.push(task::spawn_local(async move { engine.initial_pass().await }));

        let engine = self.clone();
        tasks.push(task::spawn_local(async move { engine.watch_loop().await }));

        self.log
            .borrow_mut()
            .message(format!("Starting workers ({}) …", self.worker_count));
        for _ in 0..self.worker_count {
            let engine = self.clone();
            tasks.push(task::spawn_local(async move { engine.job_runner().await }));
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = self.shutdown.wait() => {}
        }

        self.log.borrow_mut().command("Exiting…");
        for task in &tasks {
            task.abort();
        }
        self.summary.borrow_mut().clear_running();
        for pgid in self.worker_pgids.borrow().iter() {
            unsafe {
                libc::killpg(*pgid, libc::SIGKILL);
            }
        }
        if let Err(err) = self.snapshot_now() {
            self.log_error(&err);
        }
        self.log.borrow_mut().message("Program stopped.");
        Ok(())
    }

    // --- startup --------------------------------------------------------

    /// Restores the snapshot (or walks the tree on a cold start), then
    /// reconciles against the current filesystem. Runs as a background
    /// task so the matrix streams in without blocking anything.
    async fn initial_pass(self: Rc<Self>) {
        let pending = self.pending_restore.borrow_mut().take();
        match pending {
            Some(snapshot) => match self.restore(&snapshot).await {
                Ok(()) => {
                    self.sync_with_filesystem(true).await;
                }
                Err(err) => {
                    self.log_error(&err);
                    self.log.borrow_mut().message("Recalculating all results…");
                    *self.summary.borrow_mut() = Summary::new(SortOrder::default());
                    self.walk_tree().await;
                }
            },
            None => self.walk_tree().await,
        }
        self.restore_complete.set(true);
        self.signal_jobs();
        self.appearance_changed.set();
        self.note_completion_if_done();
    }

    async fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let mut loaded = 0usize;
        for item in snapshot.entries(&self.cache_root)? {
            let snap = item?;
            let mut cells = Vec::with_capacity(snap.cells.len());
            for cell_snap in &snap.cells {
                let Some(tool) = tools::tool_by_name(&cell_snap.tool) else {
                    debug!("dropping cell for vanished tool \"{}\"", cell_snap.tool);
                    continue;
                };
                let mut cell = ResultCell::new(snap.path.clone(), tool);
                // Keep the result only if the tool that produced it is still
                // the same tool; otherwise the cell recomputes.
                if cell_snap.status.is_terminal() && cell_snap.identity == tool.identity_hash() {
                    cell.set_status(cell_snap.status);
                    cell.compression = cell_snap.compression;
                }
                cell.scroll_position = cell_snap.scroll;
                cells.push(cell);
            }
            self.summary
                .borrow_mut()
                .insert_entry(Entry::new(snap.path.clone(), snap.change_time, cells));
            loaded += 1;
            if loaded % PROGRESS_INTERVAL == 0 {
                self.log.borrow_mut().message(format!("Loading summary: {loaded} entries…"));
                self.appearance_changed.set();
            }
            task::yield_now().await;
        }
        let mut summary = self.summary.borrow_mut();
        summary.clear_running();
        let (x, y) = snapshot.cursor();
        summary.set_cursor_position(x, y);
        debug!("restored {loaded} entries from snapshot");
        Ok(())
    }

    async fn walk_tree(&self) {
        let mut walked = 0usize;
        for path in utils::codebase_files(&self.root) {
            if self.note_added(path) {
                self.signal_jobs();
            }
            walked += 1;
            if walked % PROGRESS_INTERVAL == 0 {
                self.log.borrow_mut().message(format!("Scanning: {walked} files…"));
            }
            task::yield_now().await;
        }
        self.appearance_changed.set();
    }

    /// Reconciles the matrix against the filesystem: deletes vanished rows,
    /// resets modified ones, adds new files, and logs a `+A -R ~M` summary.
    pub async fn sync_with_filesystem(&self, log_stats: bool) {
        let now = utils::codebase_files(&self.root);
        let now_set: HashSet<RelPath> = now.iter().cloned().collect();
        let known: Vec<(RelPath, u64)> = self
            .summary
            .borrow()
            .entries()
            .iter()
            .map(|entry| (entry.path.clone(), entry.change_time))
            .collect();

        let (mut added, mut removed, mut modified) = (0usize, 0usize, 0usize);
        for (path, change_time) in known {
            if !now_set.contains(&path) {
                if let Err(err) = self.summary.borrow_mut().on_file_deleted(&path, &self.store) {
                    self.log_error(&err);
                }
                removed += 1;
            } else if let Ok(new_time) = utils::change_time(&path.to_fs_path(&self.root)) {
                if new_time != change_time {
                    match self.summary.borrow_mut().on_file_modified(&path, new_time, &self.store)
                    {
                        Ok(true) => {
                            modified += 1;
                            self.signal_jobs();
                        }
                        Ok(false) => {}
                        Err(err) => self.log_error(&err),
                    }
                }
            }
            task::yield_now().await;
        }
        for path in now {
            if self.note_added(path) {
                added += 1;
                self.signal_jobs();
            }
            task::yield_now().await;
        }
        if added + removed + modified > 0 {
            self.appearance_changed.set();
            if log_stats {
                self.log
                    .borrow_mut()
                    .message(format!("Filesystem changed: +{added} -{removed} ~{modified}."));
            }
        }
    }

    /// Adds a file to the matrix if it is a regular (or symlinked) file not
    /// already present. Returns whether pending cells were added.
    fn note_added(&self, path: RelPath) -> bool {
        let fs_path = path.to_fs_path(&self.root);
        let Ok(meta) = fs::metadata(&fs_path) else { return false };
        if !meta.is_file() {
            return false;
        }
        let Ok(change_time) = utils::change_time(&fs_path) else { return false };
        let added = self.summary.borrow_mut().on_file_added(path, change_time, &self.registry);
        if added {
            self.appearance_changed.set();
        }
        added
    }

    // --- watcher --------------------------------------------------------

    async fn watch_loop(self: Rc<Self>) {
        let mut watcher = match FsWatcher::new(&self.root) {
            Ok(watcher) => watcher,
            Err(err) => {
                self.log
                    .borrow_mut()
                    .message(format!("{err}; continuing without live updates."));
                warn!("{err}");
                return;
            }
        };
        while let Some(change) = watcher.next().await {
            self.apply_fs_change(change);
        }
    }

    pub fn apply_fs_change(&self, change: FsChange) {
        match change {
            FsChange::Added(path) => {
                if self.note_added(path) {
                    self.signal_jobs();
                }
            }
            FsChange::Deleted(path) => {
                if let Err(err) = self.summary.borrow_mut().on_file_deleted(&path, &self.store) {
                    self.log_error(&err);
                }
                self.appearance_changed.set();
            }
            FsChange::Modified(path) => {
                let Ok(change_time) = utils::change_time(&path.to_fs_path(&self.root)) else {
                    return;
                };
                match self.summary.borrow_mut().on_file_modified(&path, change_time, &self.store) {
                    Ok(true) => {
                        self.signal_jobs();
                        self.appearance_changed.set();
                    }
                    Ok(false) => {}
                    Err(err) => self.log_error(&err),
                }
            }
            FsChange::Failed(reason) => {
                let err = EngineError::Watcher(reason);
                self.log
                    .borrow_mut()
                    .message(format!("{err}; continuing without live updates."));
                warn!("{err}");
            }
        }
    }

    // --- refresh --------------------------------------------------------

    /// Refreshes the selected cell (advisory; only completed cells reset).
    pub fn refresh_selection(&self) {
        let mut summary = self.summary.borrow_mut();
        let Some((path, tool)) =
            summary.selection().map(|(entry, cell)| (entry.path.clone(), cell.tool))
        else {
            return;
        };
        let Some((entry_index, cell_index)) = summary.find_cell(&path, tool.name) else {
            return;
        };
        match summary.refresh(entry_index, cell_index, &self.store) {
            Ok(true) => {
                drop(summary);
                self.log
                    .borrow_mut()
                    .command(format!("Refreshing {} result of {}…", tool.name, path));
                self.signal_jobs();
                self.appearance_changed.set();
            }
            Ok(false) => {}
            Err(err) => {
                drop(summary);
                self.log_error(&err);
            }
        }
    }

    /// Refreshes every completed cell of the selected cell's tool.
    pub fn refresh_selected_tool(&self) {
        let tool = match self.summary.borrow().selection() {
            Some((_, cell)) => cell.tool,
            None => return,
        };
        self.log.borrow_mut().command(format!("Refreshing all results of {}…", tool.name));
        match self.summary.borrow_mut().refresh_tool(tool, &self.store) {
            Ok(count) if count > 0 => {
                self.signal_jobs();
                self.appearance_changed.set();
            }
            Ok(_) => {}
            Err(err) => self.log_error(&err),
        }
    }

    // --- worker pool ----------------------------------------------------

    /// One worker's driving task: wait for `jobs_added`, drain the
    /// scheduler, clear the event, repeat.
    async fn job_runner(self: Rc<Self>) {
        let mut handle = match WorkerHandle::spawn(&self.root, self.compression).await {
            Ok(handle) => handle,
            Err(err) => {
                self.log.borrow_mut().message(format!("Failed to start a worker: {err}"));
                error!("worker spawn failed: {err}");
                return;
            }
        };
        self.worker_pgids.borrow_mut().push(handle.pgid());
        loop {
            self.jobs_added.wait().await;
            loop {
                let step = {
                    let summary = self.summary.borrow();
                    self.scheduler.borrow_mut().step(&summary)
                };
                match step {
                    SweepStep::Continue => task::yield_now().await,
                    SweepStep::End => break,
                    SweepStep::Found(cell) => self.run_cell(&mut handle, cell).await,
                }
            }
            self.jobs_added.clear();
        }
    }

    /// Runs one picked cell through a worker, with bounded respawn-retry
    /// when the worker dies mid-job.
    async fn run_cell(&self, handle: &mut WorkerHandle, cell: CellRef) {
        {
            let mut summary = self.summary.borrow_mut();
            let Some((entry_index, cell_index)) = summary.find_cell(&cell.path, cell.tool.name)
            else {
                return;
            };
            summary.set_cell_status(entry_index, cell_index, Status::Running);
        }
        self.log
            .borrow_mut()
            .message(format!("Running {} on {}…", cell.tool.name, cell.path));
        self.appearance_changed.set();

        let started = Instant::now();
        let mut failures = 0usize;
        let mut crashed = false;
        let status = loop {
            match handle.run_job(cell.tool.name, &cell.path).await {
                Ok(status) => break status,
                Err(err) => {
                    failures += 1;
                    warn!("{err} (attempt {failures})");
                    if failures >= WORKER_RETRY_LIMIT {
                        crashed = true;
                        break Status::Error;
                    }
                    let old_pgid = handle.pgid();
                    match handle.respawn().await {
                        Ok(()) => {
                            let mut pgids = self.worker_pgids.borrow_mut();
                            pgids.retain(|pgid| *pgid != old_pgid);
                            pgids.push(handle.pgid());
                        }
                        Err(spawn_err) => {
                            self.log
                                .borrow_mut()
                                .message(format!("Failed to respawn a worker: {spawn_err}"));
                            crashed = true;
                            break Status::Error;
                        }
                    }
                }
            }
        };
        if crashed {
            // The worker never wrote an artifact; leave a short explanation.
            let note = vec![format!(
                "The worker running {} crashed {failures} times.",
                cell.tool.name
            )];
            if let Err(err) = self.store.put(&cell.path, cell.tool.name, note, self.compression) {
                self.log_error(&err);
            }
        }

        {
            let mut summary = self.summary.borrow_mut();
            if let Some((entry_index, cell_index)) = summary.find_cell(&cell.path, cell.tool.name)
            {
                summary.set_cell_status(entry_index, cell_index, status);
                summary.set_cell_compression(entry_index, cell_index, self.compression);
            }
        }
        self.store.evict(&cell.path, cell.tool.name);
        self.appearance_changed.set();
        self.log.borrow_mut().message(format!(
            "Finished running {} on {}. {} {:.2} secs",
            cell.tool.name,
            cell.path,
            status.meaning(),
            started.elapsed().as_secs_f64()
        ));
        self.after_job_completed();
    }

    /// New pending cells may exist: wake the workers and retract any
    /// earlier completion.
    fn signal_jobs(&self) {
        self.completion.clear();
        self.jobs_added.set();
    }

    fn after_job_completed(&self) {
        self.unsaved_jobs_total.set(self.unsaved_jobs_total.get() + 1);
        if self.unsaved_jobs_total.get() >= SNAPSHOT_INTERVAL && self.restore_complete.get() {
            self.log.borrow_mut().message("Auto-saving…");
            if let Err(err) = self.snapshot_now() {
                self.log_error(&err);
            }
        }
        self.note_completion_if_done();
    }

    fn note_completion_if_done(&self) {
        // While the initial pass is still streaming entries in, a transient
        // completed == total is meaningless.
        if !self.restore_complete.get() {
            return;
        }
        let (completed, total) = {
            let summary = self.summary.borrow();
            (summary.completed_total(), summary.result_total())
        };
        if total > 0 && completed == total && !self.completion.is_set() {
            self.log.borrow_mut().message("All results are up to date.");
            self.log.borrow_mut().message("Auto-saving…");
            if let Err(err) = self.snapshot_now() {
                self.log_error(&err);
            }
            self.completion.set();
            if self.under_test {
                self.shutdown.set();
            }
        }
    }

    // --- persistence ----------------------------------------------------

    /// Serialises the engine state to the cache directory and resets the
    /// unsaved-jobs counter.
    pub fn snapshot_now(&self) -> Result<()> {
        let snapshot = {
            let summary = self.summary.borrow();
            Snapshot::capture(&summary, self.log.borrow().tail(), 0)
        };
        snapshot::write(&self.cache_root, snapshot, SUMMARY_PAGE_THRESHOLD)?;
        self.unsaved_jobs_total.set(0);
        Ok(())
    }

    fn log_error(&self, err: &EngineError) {
        error!("{err}");
        self.log.borrow_mut().message(err.to_string());
    }
}

/// Prepares the cache directory, wiping it when the engine binary is newer
/// than the cache's recorded creation time or the tool table changed.
fn manage_cache(cache_root: &Path) -> Result<()> {
    let timestamp = cache_root.join(CREATION_TIME_FILE);
    let fingerprint_path = cache_root.join(TOOLS_FINGERPRINT_FILE);
    let fingerprint = tools::registry_fingerprint();
    if cache_root.exists() {
        let engine_mtime = std::env::current_exe()
            .and_then(|exe| fs::metadata(exe))
            .and_then(|meta| meta.modified());
        let cache_mtime = fs::metadata(&timestamp).and_then(|meta| meta.modified());
        let newer_binary = match (engine_mtime, cache_mtime) {
            (Ok(engine), Ok(cache)) => engine > cache,
            (_, Err(_)) => true,
            _ => false,
        };
        let changed_tools = fs::read_to_string(&fingerprint_path)
            .map(|recorded| recorded.trim() != fingerprint)
            .unwrap_or(true);
        if newer_binary || changed_tools {
            info!("cache is stale (newer binary or changed tools); recalculating all results");
            fs::remove_dir_all(cache_root)
                .map_err(|err| EngineError::io(err, cache_root))?;
        }
    }
    if !cache_root.exists() {
        fs::create_dir_all(cache_root).map_err(|err| EngineError::io(err, cache_root))?;
        utils::touch(&timestamp)?;
        fs::write(&fingerprint_path, &fingerprint)
            .map_err(|err| EngineError::io(err, fingerprint_path.as_path()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(root: &Path) -> EngineConfig {
        let mut config = EngineConfig::new(root);
        config.worker_count = 1;
        config.under_test = true;
        config
    }

    #[test]
    fn missing_root_is_fatal() {
        let err = Engine::new(config(Path::new("/definitely/not/here"))).unwrap_err();
        assert!(matches!(err, EngineError::FatalInit { .. }));
    }

    #[test]
    fn file_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, "x").unwrap();
        let err = Engine::new(config(&file)).unwrap_err();
        assert!(matches!(err, EngineError::FatalInit { .. }));
    }

    #[test]
    fn cache_directory_is_created_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config(dir.path())).unwrap();
        assert!(engine.cache_root().is_dir());
        assert!(engine.cache_root().join(CREATION_TIME_FILE).exists());
        assert!(!engine.is_warm_start());
    }

    #[tokio::test]
    async fn initial_pass_builds_matrix_from_tree() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                fs::write(dir.path().join("a.py"), "pass\n").unwrap();
                fs::write(dir.path().join("b.md"), "# hi\n").unwrap();
                let engine = Engine::new(config(dir.path())).unwrap();
                engine.clone().initial_pass().await;
                let summary = engine.summary();
                assert_eq!(summary.len(), 2);
                assert!(summary.result_total() >= 4);
                assert!(engine.jobs_added.is_set());
            })
            .await;
    }

    #[tokio::test]
    async fn fs_events_mutate_matrix() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                fs::write(dir.path().join("a.py"), "pass\n").unwrap();
                let engine = Engine::new(config(dir.path())).unwrap();
                engine.clone().initial_pass().await;
                assert_eq!(engine.summary().len(), 1);

                fs::write(dir.path().join("c.html"), "<html></html>").unwrap();
                engine.apply_fs_change(FsChange::Added(RelPath::new("./c.html")));
                assert_eq!(engine.summary().len(), 2);

                engine.apply_fs_change(FsChange::Deleted(RelPath::new("./a.py")));
                assert_eq!(engine.summary().len(), 1);

                // Events for unknown paths are no-ops.
                engine.apply_fs_change(FsChange::Modified(RelPath::new("./nope.py")));
                assert_eq!(engine.summary().len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_matrix_shape() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                fs::write(dir.path().join("a.py"), "pass\n").unwrap();
                fs::write(dir.path().join("b.py"), "pass\n").unwrap();
                let engine = Engine::new(config(dir.path())).unwrap();
                engine.clone().initial_pass().await;
                // Complete one cell, leave another running.
                engine.summary_mut().set_cell_status(0, 0, Status::Ok);
                engine.summary_mut().set_cell_status(1, 0, Status::Running);
                engine.snapshot_now().unwrap();

                let restored = Engine::new(config(dir.path())).unwrap();
                assert!(restored.is_warm_start());
                restored.clone().initial_pass().await;
                let summary = restored.summary();
                assert_eq!(summary.len(), 2);
                assert_eq!(summary.entries()[0].cells[0].status, Status::Ok);
                // Non-terminal statuses come back as Pending.
                assert_eq!(summary.entries()[1].cells[0].status, Status::Pending);
            })
            .await;
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_back_to_cold_start() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                fs::write(dir.path().join("a.py"), "pass\n").unwrap();
                {
                    let engine = Engine::new(config(dir.path())).unwrap();
                    engine.clone().initial_pass().await;
                }
                fs::write(
                    dir.path().join(CACHE_DIR_NAME).join(snapshot::SNAPSHOT_FILE),
                    b"garbage",
                )
                .unwrap();
                let engine = Engine::new(config(dir.path())).unwrap();
                assert!(!engine.is_warm_start());
                engine.clone().initial_pass().await;
                assert_eq!(engine.summary().len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn sync_detects_adds_deletes_and_modifications() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                fs::write(dir.path().join("keep.py"), "pass\n").unwrap();
                fs::write(dir.path().join("gone.py"), "pass\n").unwrap();
                let engine = Engine::new(config(dir.path())).unwrap();
                engine.clone().initial_pass().await;
                assert_eq!(engine.summary().len(), 2);

                fs::remove_file(dir.path().join("gone.py")).unwrap();
                fs::write(dir.path().join("new.py"), "pass\n").unwrap();
                engine.sync_with_filesystem(true).await;

                let summary = engine.summary();
                assert_eq!(summary.len(), 2);
                assert!(summary.contains(&RelPath::new("./keep.py")));
                assert!(summary.contains(&RelPath::new("./new.py")));
                drop(summary);
                let tail = engine.log_tail();
                assert!(
                    tail.iter().any(|line| line.contains("Filesystem changed: +1 -1 ~0.")),
                    "{tail:?}"
                );
            })
            .await;
    }
}
