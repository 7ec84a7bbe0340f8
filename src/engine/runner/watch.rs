//! Incremental rebuilds driven by file system events.
//!
//! The watcher is built from three parts:
//!
//! 1. **Bindings** map glob patterns below the source root to registered
//!    tasks. A binding naming an unknown task is rejected when it is made.
//! 2. **Debouncer**: raw events from `notify` settle for the configured
//!    window, so a burst of saves reaches the watcher as a single batch and
//!    turns into at most one request per task.
//! 3. **Lanes**: every bound task owns a lane which allows a single run at a
//!    time. Requests arriving during a run collapse into one pending marker,
//!    and exactly one follow-up run starts once the current run finishes.
//!    Lanes of different tasks are independent and run concurrently.
//!
//! After each run the changed outputs are pushed to the
//! [`ReloadBus`](super::reload::ReloadBus), if one is attached.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use camino::Utf8PathBuf;
use glob::Pattern;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{Debouncer, RecommendedCache, new_debouncer};

use crate::blueprint::Website;
use crate::engine::runner::reload::ReloadBus;
use crate::engine::{ErrorSink, Handle, Report};
use crate::error::{ConfigError, WatchError};
use crate::pipeline::source::{MATCH, split_glob};

/// How often the event thread checks whether it should stop.
const POLL: Duration = Duration::from_millis(100);

type Runner = Arc<dyn Fn(&Website, Handle, &ErrorSink) -> Report + Send + Sync>;

#[derive(Debug)]
enum LaneState {
    Idle,
    Running { pending: bool },
}

/// At-most-one-in-flight gate of a single task.
#[derive(Debug)]
pub(crate) struct Lane {
    state: Mutex<LaneState>,
}

impl Lane {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LaneState::Idle),
        }
    }

    /// Asks for a run. Returns `true` if the caller has to start it, or
    /// `false` if a run is in flight and the request was folded into it.
    pub(crate) fn request(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            LaneState::Idle => {
                *state = LaneState::Running { pending: false };
                true
            }
            LaneState::Running { pending } => {
                *pending = true;
                false
            }
        }
    }

    /// Marks the current run as done. Returns `true` if a follow-up run is
    /// owed, in which case the lane stays busy.
    pub(crate) fn finish(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            LaneState::Running { pending } if *pending => {
                *pending = false;
                true
            }
            _ => {
                *state = LaneState::Idle;
                false
            }
        }
    }
}

struct Binding {
    glob: String,
    task: Handle,
}

/// State shared between the watcher, its event thread and the lane workers.
struct Shared {
    site: Arc<Website>,
    sink: ErrorSink,
    bus: Mutex<Option<Arc<ReloadBus>>>,
    runner: Mutex<Runner>,
    lanes: Mutex<HashMap<Handle, Arc<Lane>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Requests a run of `task`, starting a worker if its lane is idle.
    fn trigger(self: &Arc<Self>, task: Handle) {
        let lane = self
            .lanes
            .lock()
            .unwrap()
            .entry(task)
            .or_insert_with(|| Arc::new(Lane::new()))
            .clone();

        if !lane.request() {
            tracing::debug!("{} is running, follow-up queued", self.site.name(task));
            return;
        }

        let shared = self.clone();
        let worker = std::thread::spawn(move || {
            loop {
                let runner = shared.runner.lock().unwrap().clone();
                let report = runner(&shared.site, task, &shared.sink);
                shared.publish(&report);

                if !lane.finish() {
                    break;
                }
            }
        });

        let mut workers = self.workers.lock().unwrap();
        workers.retain(|worker| !worker.is_finished());
        workers.push(worker);
    }

    fn publish(&self, report: &Report) {
        let Some(bus) = self.bus.lock().unwrap().clone() else {
            return;
        };

        for change in &report.changes {
            bus.notify(change.category, &change.paths);
        }
    }

    /// Routes a batch of changed paths to the lanes of their tasks.
    fn dispatch<'a>(
        self: &Arc<Self>,
        routes: &[(Pattern, Handle)],
        paths: impl IntoIterator<Item = &'a Path>,
    ) {
        let mut tasks = BTreeSet::new();

        for path in paths {
            for (pattern, task) in routes {
                if pattern.matches_path_with(path, MATCH) {
                    tasks.insert(*task);
                }
            }
        }

        for task in tasks {
            tracing::info!("change detected, running {}", self.site.name(task));
            self.trigger(task);
        }
    }

    /// Blocks until no worker is running.
    fn wait(&self) {
        loop {
            let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
            if workers.is_empty() {
                break;
            }

            for worker in workers {
                if worker.join().is_err() {
                    tracing::error!("watch worker panicked");
                }
            }
        }
    }
}

struct Active {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    events: JoinHandle<()>,
}

/// Ends a [`Watcher::wait`] from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Asks the event thread to exit. It notices within 100 ms.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Re-runs bound tasks whenever files matching their globs change.
pub struct Watcher {
    shared: Arc<Shared>,
    bindings: Vec<Binding>,
    running: Arc<AtomicBool>,
    active: Option<Active>,
}

impl Watcher {
    pub fn new(site: Arc<Website>, sink: ErrorSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                site,
                sink,
                bus: Mutex::new(None),
                runner: Mutex::new(Arc::new(
                    |site: &Website, task: Handle, sink: &ErrorSink| site.run(task, sink),
                )),
                lanes: Mutex::default(),
                workers: Mutex::default(),
            }),
            bindings: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            active: None,
        }
    }

    /// Sends the changes of every watch-triggered run to `bus`.
    pub fn with_bus(self, bus: Arc<ReloadBus>) -> Self {
        *self.shared.bus.lock().unwrap() = Some(bus);
        self
    }

    /// Replaces the function used to run a triggered task.
    #[cfg(test)]
    fn with_runner(
        self,
        runner: impl Fn(&Website, Handle, &ErrorSink) -> Report + Send + Sync + 'static,
    ) -> Self {
        *self.shared.runner.lock().unwrap() = Arc::new(runner);
        self
    }

    /// A handle which makes [`wait`](Self::wait) return.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    /// Binds `glob`, relative to the source root, to the task named `task`.
    pub fn bind(&mut self, glob: &str, task: &str) -> Result<(), ConfigError> {
        let handle = self
            .shared
            .site
            .lookup(task)
            .ok_or_else(|| ConfigError::UnknownTask(task.to_owned()))?;

        Pattern::new(glob)?;

        self.bindings.push(Binding {
            glob: self.shared.site.env().glob(glob),
            task: handle,
        });

        Ok(())
    }

    /// Rejects bound tasks which plan to write the same output path.
    ///
    /// Watch-triggered runs of different tasks overlap freely, even when the
    /// graph orders them. Call this before building anything; [`start`](Self::start)
    /// checks again.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tasks: BTreeSet<Handle> = self.bindings.iter().map(|b| b.task).collect();
        self.shared.site.check_disjoint(tasks.into_iter().collect())
    }

    pub fn start(&mut self) -> Result<(), WatchError> {
        if self.active.is_some() {
            return Err(WatchError::AlreadyStarted);
        }

        self.validate()?;

        let mut roots = HashSet::new();
        let mut routes = Vec::new();
        for binding in &self.bindings {
            match resolve_watch_path(&binding.glob) {
                Ok((root, pattern)) => {
                    roots.insert(root);
                    routes.push((pattern, binding.task));
                }
                Err(err) => tracing::warn!("not watching {}: {err}", binding.glob),
            }
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(self.shared.site.env().debounce, None, tx)?;

        for root in collapse_watch_paths(roots) {
            tracing::info!("watching {}", root);
            debouncer.watch(&root, RecursiveMode::Recursive)?;
        }

        self.running.store(true, Ordering::SeqCst);
        let events = {
            let shared = self.shared.clone();
            let running = self.running.clone();

            std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match rx.recv_timeout(POLL) {
                        Ok(Ok(events)) => shared.dispatch(
                            &routes,
                            events.iter().flat_map(|event| {
                                event.event.paths.iter().map(|path| path.as_path())
                            }),
                        ),
                        Ok(Err(errors)) => {
                            for err in errors {
                                tracing::warn!("watch error: {err}");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
        };

        self.active = Some(Active { debouncer, events });

        Ok(())
    }

    /// Stops watching and waits for runs already in flight.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            self.running.store(false, Ordering::SeqCst);
            active.debouncer.stop();
            if active.events.join().is_err() {
                tracing::error!("watch event thread panicked");
            }
        }

        self.shared.wait();
    }

    /// Blocks until [`StopHandle::stop`] is called from another thread, then
    /// shuts the watcher down. Otherwise it only returns once the event
    /// source goes away.
    pub fn wait(&mut self) {
        if let Some(active) = self.active.take() {
            active.events.join().ok();
            active.debouncer.stop();
        }

        self.shared.wait();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub(crate) fn resolve_watch_path(glob: &str) -> Result<(Utf8PathBuf, Pattern), WatchError> {
    let (root, suffix) = split_glob(glob);

    let absolute = root
        .canonicalize_utf8()
        .map_err(|err| WatchError::Resolve(glob.to_owned(), err.into()))?;

    // A concrete file is matched exactly but its parent is watched, so
    // editors replacing the file on save are still noticed.
    let (watch_root, pattern) = if suffix.as_str().is_empty() && absolute.is_file() {
        let parent = absolute.parent().unwrap_or(&absolute).to_path_buf();
        (parent, absolute)
    } else {
        let pattern = absolute.join(&suffix);
        (absolute, pattern)
    };

    let pattern = Pattern::new(pattern.as_str())
        .map_err(|err| WatchError::Resolve(glob.to_owned(), err.into()))?;

    Ok((watch_root, pattern))
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive.
pub(crate) fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{Receiver, channel};

    use camino::Utf8Path;

    use super::*;
    use crate::core::{Environment, Mode};
    use crate::engine::{Category, Change, Outcome};
    use crate::{Blueprint, TaskContext};

    fn noop(_: &TaskContext<'_>) -> anyhow::Result<Outcome> {
        Ok(Outcome::default())
    }

    fn site(src: &Utf8Path) -> Arc<Website> {
        let mut blueprint = Blueprint::new();
        blueprint.task("styles", noop).unwrap();
        blueprint.task("scripts", noop).unwrap();
        Arc::new(blueprint.finish(Environment::new(Mode::Watch, src, "app")).unwrap())
    }

    fn report(task: &str) -> Report {
        Report {
            succeeded: true,
            failure: None,
            diagnostics: Vec::new(),
            changes: vec![Change {
                task: task.to_owned(),
                category: Category::Styles,
                paths: vec!["css/main.css".into()],
            }],
            timings: Vec::new(),
        }
    }

    #[test]
    fn test_lane_coalesces_requests() {
        let lane = Lane::new();
        assert!(lane.request());
        for _ in 0..10 {
            assert!(!lane.request());
        }
        assert!(lane.finish());
        assert!(!lane.finish());
        assert!(lane.request());
    }

    #[test]
    fn test_burst_during_run_yields_one_follow_up() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = channel();
        let (gate_tx, gate_rx) = channel::<()>();
        let gate_rx = Mutex::new(gate_rx);

        let watcher = Watcher::new(site(Utf8Path::new("src")), ErrorSink::new()).with_runner({
            let runs = runs.clone();
            move |site: &Website, task, _: &ErrorSink| {
                runs.fetch_add(1, Ordering::SeqCst);
                started_tx.send(()).unwrap();
                gate_rx.lock().unwrap().recv().unwrap();
                report(site.name(task))
            }
        });

        let styles = watcher.shared.site.lookup("styles").unwrap();

        watcher.shared.trigger(styles);
        started_rx.recv().unwrap();

        for _ in 0..10 {
            watcher.shared.trigger(styles);
        }

        gate_tx.send(()).unwrap();
        started_rx.recv().unwrap();
        gate_tx.send(()).unwrap();

        watcher.shared.wait();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(started_rx.try_recv().is_err());
    }

    #[test]
    fn test_distinct_tasks_run_concurrently() {
        let (started_tx, started_rx) = channel();
        let (gate_tx, gate_rx) = channel::<()>();
        let gate_rx = Mutex::new(gate_rx);

        let watcher = Watcher::new(site(Utf8Path::new("src")), ErrorSink::new()).with_runner(
            move |site: &Website, task, _: &ErrorSink| {
                started_tx.send(site.name(task).to_owned()).unwrap();
                gate_rx.lock().unwrap().recv().unwrap();
                report(site.name(task))
            },
        );

        let styles = watcher.shared.site.lookup("styles").unwrap();
        let scripts = watcher.shared.site.lookup("scripts").unwrap();
        watcher.shared.trigger(styles);
        watcher.shared.trigger(scripts);

        // both runs start before either is allowed to finish
        let mut started = vec![started_rx.recv().unwrap(), started_rx.recv().unwrap()];
        started.sort();
        assert_eq!(started, vec!["scripts", "styles"]);

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        watcher.shared.wait();
    }

    #[test]
    fn test_changes_reach_the_bus() {
        struct Forward(std::sync::mpsc::Sender<String>);

        impl crate::engine::runner::reload::Peer for Forward {
            fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
                self.0.send(text.to_owned())?;
                Ok(())
            }
        }

        let bus = Arc::new(ReloadBus::detached());
        let (tx, rx): (_, Receiver<String>) = channel();
        bus.connect(Forward(tx));

        let watcher = Watcher::new(site(Utf8Path::new("src")), ErrorSink::new())
            .with_bus(bus)
            .with_runner(|site: &Website, task, _: &ErrorSink| report(site.name(task)));

        let styles = watcher.shared.site.lookup("styles").unwrap();
        watcher.shared.trigger(styles);
        watcher.shared.wait();

        assert_eq!(rx.recv().unwrap(), r#"{"kind":"css","paths":["css/main.css"]}"#);
    }

    #[test]
    fn test_dispatch_routes_paths_to_tasks() {
        let runs = Arc::new(Mutex::new(Vec::new()));

        let watcher = Watcher::new(site(Utf8Path::new("src")), ErrorSink::new()).with_runner({
            let runs = runs.clone();
            move |site: &Website, task, _: &ErrorSink| {
                runs.lock().unwrap().push(site.name(task).to_owned());
                report(site.name(task))
            }
        });

        let styles = watcher.shared.site.lookup("styles").unwrap();
        let routes = vec![(Pattern::new("/site/src/scss/**/*.scss").unwrap(), styles)];

        watcher.shared.dispatch(
            &routes,
            [
                Path::new("/site/src/scss/main.scss"),
                Path::new("/site/src/scss/blocks/_card.scss"),
                Path::new("/site/src/js/main.js"),
            ],
        );
        watcher.shared.wait();

        assert_eq!(*runs.lock().unwrap(), vec!["styles"]);
    }

    #[test]
    fn test_bind_unknown_task() {
        let mut watcher = Watcher::new(site(Utf8Path::new("src")), ErrorSink::new());
        assert!(matches!(
            watcher.bind("fonts/*.ttf", "fonts"),
            Err(ConfigError::UnknownTask(name)) if name == "fonts"
        ));
        assert!(watcher.bind("scss/**/*.scss", "styles").is_ok());
    }

    #[test]
    fn test_start_twice() {
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::create_dir_all(src.join("scss")).unwrap();

        let mut watcher = Watcher::new(site(src), ErrorSink::new());
        watcher.bind("scss/**/*.scss", "styles").unwrap();
        watcher.start().unwrap();
        assert!(matches!(watcher.start(), Err(WatchError::AlreadyStarted)));
        watcher.stop();
    }

    #[test]
    fn test_bus_attached_after_sharing() {
        struct Forward(std::sync::mpsc::Sender<String>);

        impl crate::engine::runner::reload::Peer for Forward {
            fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
                self.0.send(text.to_owned())?;
                Ok(())
            }
        }

        let bus = Arc::new(ReloadBus::detached());
        let (tx, rx) = channel();
        bus.connect(Forward(tx));

        let watcher = Watcher::new(site(Utf8Path::new("src")), ErrorSink::new());
        let held = watcher.shared.clone();
        let watcher = watcher
            .with_bus(bus)
            .with_runner(|site: &Website, task, _: &ErrorSink| report(site.name(task)));

        let styles = held.site.lookup("styles").unwrap();
        held.trigger(styles);
        watcher.shared.wait();

        assert!(rx.recv().unwrap().contains("css/main.css"));
    }

    /// Claims a single output path without writing anything.
    struct Claims(&'static str);

    impl crate::engine::Runnable for Claims {
        fn run(&self, _: &TaskContext<'_>) -> Result<Outcome, crate::TaskError> {
            Ok(Outcome::default())
        }

        fn plan(&self, _: &Environment) -> Result<Vec<Utf8PathBuf>, crate::TaskError> {
            Ok(vec![Utf8PathBuf::from(self.0)])
        }
    }

    #[test]
    fn test_validate_rejects_overlap_of_sequential_siblings() {
        let mut blueprint = Blueprint::new();
        let resources = blueprint.register("resources", Claims("css/main.css")).unwrap();
        let styles = blueprint.register("styles", Claims("css/main.css")).unwrap();
        blueprint.sequential("dev", [resources, styles]).unwrap();

        // ordered by the graph, so the blueprint itself is fine
        let env = Environment::new(Mode::Watch, "src", "app");
        let site = Arc::new(blueprint.finish(env).unwrap());

        let mut watcher = Watcher::new(site, ErrorSink::new());
        watcher.bind("resources/**/*", "resources").unwrap();
        watcher.bind("scss/**/*.scss", "styles").unwrap();

        match watcher.validate() {
            Err(ConfigError::OutputCollision { path, .. }) => assert_eq!(path, "css/main.css"),
            other => panic!("expected a collision, got {other:?}"),
        }
        assert!(matches!(watcher.start(), Err(WatchError::Config(_))));
    }

    #[test]
    fn test_stop_handle_ends_wait() {
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::create_dir_all(src.join("scss")).unwrap();

        let mut watcher = Watcher::new(site(src), ErrorSink::new());
        watcher.bind("scss/**/*.scss", "styles").unwrap();
        watcher.start().unwrap();

        let handle = watcher.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.stop();
        });

        watcher.wait();
        stopper.join().unwrap();
    }

    #[test]
    fn test_concrete_file() {
        let (watch, pattern) = resolve_watch_path("Cargo.toml").expect("Should resolve");

        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();

        assert_eq!(watch.as_str(), cwd);
        assert_eq!(pattern.as_str(), cwd.join("Cargo.toml"));
    }

    #[test]
    fn test_directory_wildcard() {
        let (watch, pattern) = resolve_watch_path("src/**/*.rs").expect("Should resolve");

        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();

        assert_eq!(watch.as_str(), cwd.join("src"));
        assert_eq!(pattern.as_str(), cwd.join("src/**/*.rs"));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        assert!(matches!(
            resolve_watch_path("does-not-exist/**/*.scss"),
            Err(WatchError::Resolve(..))
        ));
    }

    #[test]
    fn test_collapse_watch_paths() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/a"));
        paths.insert(Utf8PathBuf::from("/a/b"));
        paths.insert(Utf8PathBuf::from("/b"));
        paths.insert(Utf8PathBuf::from("/foo"));
        paths.insert(Utf8PathBuf::from("/foo-bar"));

        assert_eq!(
            collapse_watch_paths(paths),
            vec![
                Utf8PathBuf::from("/a"),
                Utf8PathBuf::from("/b"),
                Utf8PathBuf::from("/foo"),
                Utf8PathBuf::from("/foo-bar")
            ]
        );
    }
}
