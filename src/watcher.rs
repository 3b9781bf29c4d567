//! Debounced filesystem watcher for job directories.
//!
//! A single background task owns the `notify` subscription and a "latest
//! pending" slot. Every relevant event overwrites the slot and pushes the
//! deadline out by the debounce window; when the deadline passes with no
//! further relevant event the callback is awaited once with the pending
//! job name.
//!
//! If the watch root does not exist (yet), the task re-checks it on a slow
//! poll and subscribes once it appears. If it disappears or is replaced by a
//! new directory later, the subscription is dropped, a change is emitted so
//! the owner can observe it, and the task resubscribes once a root exists
//! again.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::WatcherError;

/// Callback invoked with a job name once a burst of events has settled.
pub type ChangeCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Current set of top-level directory names worth watching.
pub type NamesToWatch = Arc<dyn Fn() -> HashSet<String> + Send + Sync>;

/// Timing knobs for a [`ChangeWatcher`].
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Quiet period required before the callback fires.
    pub debounce: Duration,
    /// How often a missing root is re-checked.
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Handle to a running watcher. Dropping it stops the watch.
pub struct ChangeWatcher {
    root: PathBuf,
    stopped: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
}

impl ChangeWatcher {
    /// Start watching `root`. Must be called from within a tokio runtime.
    pub fn watch(
        root: PathBuf,
        on_change: ChangeCallback,
        relevant_file_names: HashSet<String>,
        names_to_watch: NamesToWatch,
        options: WatchOptions,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = WatchTask {
            root: root.clone(),
            on_change,
            relevant_file_names,
            names_to_watch,
            options,
            stopped: Arc::clone(&stopped),
        };
        tokio::spawn(task.run(stop_rx));

        Self {
            root,
            stopped,
            stop_tx,
        }
    }

    /// Cancel any pending debounce and unsubscribe. Idempotent.
    ///
    /// A callback already in flight runs to completion; nothing fires after
    /// it.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // The task exits at its next await point.
        let _ = self.stop_tx.send(true);
        debug!(root = %self.root.display(), "Change watcher stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("root", &self.root)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct WatchTask {
    root: PathBuf,
    on_change: ChangeCallback,
    relevant_file_names: HashSet<String>,
    names_to_watch: NamesToWatch,
    options: WatchOptions,
    stopped: Arc<AtomicBool>,
}

impl WatchTask {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut subscription: Option<RecommendedWatcher> = None;
        // Identity of the root directory the subscription was made on.
        let mut subscribed_root: Option<RootIdentity> = None;
        let mut pending: Option<String> = None;
        let mut deadline: Option<Instant> = None;
        let mut warned_missing = false;

        let mut poll = tokio::time::interval(self.options.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let at = deadline;
            let debounce_elapsed = async move {
                match at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = stop_rx.changed() => break,

                _ = poll.tick() => {
                    let identity = root_identity(&self.root);
                    match (subscription.is_some(), identity) {
                        (false, Some(identity)) => match subscribe(&self.root, event_tx.clone()) {
                            Ok(w) => {
                                info!(root = %self.root.display(), "Watching for job changes");
                                subscription = Some(w);
                                subscribed_root = Some(identity);
                                // Jobs may have appeared together with the root.
                                if warned_missing {
                                    pending = Some(String::new());
                                    deadline = Some(Instant::now() + self.options.debounce);
                                }
                                warned_missing = false;
                            }
                            Err(e) => warn!(root = %self.root.display(), "Failed to watch: {e}"),
                        },
                        (false, None) => {
                            if !warned_missing {
                                warn!(
                                    root = %self.root.display(),
                                    "Watch root does not exist; retrying every {:?}",
                                    self.options.poll_interval
                                );
                                warned_missing = true;
                            }
                        }
                        (true, current) if current != subscribed_root => {
                            if current.is_some() {
                                warn!(root = %self.root.display(), "Watch root replaced");
                                // Resubscribe on the new directory right away.
                                poll.reset_immediately();
                            } else {
                                warn!(root = %self.root.display(), "Watch root removed");
                            }
                            subscription = None;
                            subscribed_root = None;
                            warned_missing = true;
                            pending = Some(String::new());
                            deadline = Some(Instant::now() + self.options.debounce);
                        }
                        (true, _) => {}
                    }
                }

                Some(res) = event_rx.recv() => match res {
                    Ok(event) if subscription.is_some() && is_root_removal(&self.root, &event) => {
                        warn!(root = %self.root.display(), "Watch root removed or moved");
                        subscription = None;
                        subscribed_root = None;
                        warned_missing = true;
                        pending = Some(String::new());
                        deadline = Some(Instant::now() + self.options.debounce);
                        poll.reset_immediately();
                    }
                    Ok(event) => {
                        if let Some(name) = self.relevant_name(&event) {
                            debug!(job = %name, kind = ?event.kind, "Relevant change, debouncing");
                            pending = Some(name);
                            deadline = Some(Instant::now() + self.options.debounce);
                        }
                    }
                    Err(e) => warn!(root = %self.root.display(), "Watch error: {e}"),
                },

                _ = debounce_elapsed => {
                    deadline = None;
                    if let Some(name) = pending.take() {
                        if self.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        (self.on_change)(name).await;
                    }
                }
            }
        }

        drop(subscription);
        debug!(root = %self.root.display(), "Watch task exited");
    }

    fn relevant_name(&self, event: &Event) -> Option<String> {
        relevant_name(
            &self.root,
            event,
            &self.relevant_file_names,
            self.names_to_watch.as_ref(),
        )
    }
}

/// Device and inode of a directory; tells a recreated root from the one
/// that was subscribed.
type RootIdentity = (u64, u64);

#[cfg(unix)]
fn root_identity(root: &Path) -> Option<RootIdentity> {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata(root)
        .ok()
        .filter(|m| m.is_dir())
        .map(|m| (m.dev(), m.ino()))
}

#[cfg(not(unix))]
fn root_identity(root: &Path) -> Option<RootIdentity> {
    root.is_dir().then_some((0, 0))
}

/// The watched root itself was deleted or moved away. The subscription is
/// dead afterwards even if a new directory already sits at the same path.
fn is_root_removal(root: &Path, event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(notify::event::ModifyKind::Name(_))
    ) && event.paths.iter().any(|p| p == root)
}

fn subscribe(
    root: &Path,
    tx: mpsc::UnboundedSender<notify::Result<Event>>,
) -> Result<RecommendedWatcher, WatcherError> {
    if !root.is_dir() {
        return Err(WatcherError::RootMissing(root.to_path_buf()));
    }
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        // Receiver gone means the task has exited.
        let _ = tx.send(res);
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Decide whether `event` concerns a watched job.
///
/// Returns the top-level directory name the event lies under (empty for
/// files directly in `root`) when the event's file name is one of
/// `relevant_file_names`, or when its top-level directory is currently
/// watched. `names_to_watch` is only evaluated when needed.
pub fn relevant_name(
    root: &Path,
    event: &Event,
    relevant_file_names: &HashSet<String>,
    names_to_watch: &(dyn Fn() -> HashSet<String> + Send + Sync),
) -> Option<String> {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    ) {
        return None;
    }

    let mut watched: Option<HashSet<String>> = None;

    for path in &event.paths {
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();
        let Some(last) = parts.last() else {
            continue;
        };

        let top = if parts.len() > 1 {
            parts[0].clone()
        } else {
            String::new()
        };

        if relevant_file_names.contains(last) {
            return Some(top);
        }

        let names = watched.get_or_insert_with(names_to_watch);
        if names.contains(&parts[0]) {
            return Some(parts[0].clone());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind, RenameMode};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn check(root: &Path, event: Event, watched: &'static [&'static str]) -> Option<String> {
        relevant_name(root, &event, &names(&["host.json"]), &move || names(watched))
    }

    #[test]
    fn relevant_file_name_matches_anywhere() {
        let root = PathBuf::from("/jobs");
        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(root.join("other").join("host.json"));
        assert_eq!(check(&root, event, &[]), Some("other".to_string()));

        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(root.join("host.json"));
        assert_eq!(check(&root, event, &[]), Some(String::new()));
    }

    #[test]
    fn watched_directory_matches_any_file_under_it() {
        let root = PathBuf::from("/jobs");
        let event = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(root.join("functions").join("myFn").join("run.csx"));
        assert_eq!(check(&root, event, &["functions"]), Some("functions".to_string()));

        let event = Event::new(EventKind::Create(CreateKind::Folder)).add_path(root.join("functions"));
        assert_eq!(check(&root, event, &["functions"]), Some("functions".to_string()));
    }

    #[test]
    fn rename_counts_as_change() {
        let root = PathBuf::from("/jobs");
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.join("tmp.swp"))
            .add_path(root.join("functions").join("index.js"));
        assert_eq!(check(&root, event, &["functions"]), Some("functions".to_string()));
    }

    #[test]
    fn unrelated_paths_and_access_events_ignored() {
        let root = PathBuf::from("/jobs");
        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(root.join("unwatched").join("run.csx"));
        assert_eq!(check(&root, event, &["functions"]), None);

        let event = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(root.join("functions").join("host.json"));
        assert_eq!(check(&root, event, &["functions"]), None);

        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/elsewhere/host.json"));
        assert_eq!(check(&root, event, &["functions"]), None);
    }

    #[test]
    fn names_to_watch_is_lazy() {
        let root = PathBuf::from("/jobs");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(root.join("a").join("host.json"));
        let found = relevant_name(&root, &event, &names(&["host.json"]), &move || {
            counter.fetch_add(1, Ordering::SeqCst);
            HashSet::new()
        });
        assert_eq!(found, Some("a".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn only_events_on_the_root_itself_are_root_removals() {
        let root = Path::new("/jobs");
        let removed = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(root.to_path_buf());
        assert!(is_root_removal(root, &removed));

        let moved = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(root.to_path_buf());
        assert!(is_root_removal(root, &moved));

        let child = Event::new(EventKind::Remove(RemoveKind::Folder))
            .add_path(root.join("functions"));
        assert!(!is_root_removal(root, &child));

        let created = Event::new(EventKind::Create(CreateKind::Folder)).add_path(root.to_path_buf());
        assert!(!is_root_removal(root, &created));
    }

    fn counting_callback() -> (ChangeCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let callback: ChangeCallback = Arc::new(move |_name: String| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        (callback, count)
    }

    fn start(dir: &TempDir, callback: ChangeCallback) -> ChangeWatcher {
        ChangeWatcher::watch(
            dir.path().to_path_buf(),
            callback,
            names(&["host.json"]),
            Arc::new(|| names(&["functions"])),
            WatchOptions {
                debounce: Duration::from_millis(200),
                poll_interval: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn burst_of_events_fires_once() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("functions")).unwrap();
        let (callback, count) = counting_callback();
        let _watcher = start(&dir, callback);
        tokio::time::sleep(Duration::from_millis(150)).await;

        for i in 0..10 {
            std::fs::write(dir.path().join("functions").join("host.json"), format!("{{\"n\": {i}}}"))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_suppresses_pending_and_later_events() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("functions")).unwrap();
        let (callback, count) = counting_callback();
        let watcher = start(&dir, callback);
        tokio::time::sleep(Duration::from_millis(150)).await;

        std::fs::write(dir.path().join("functions").join("host.json"), "{}").unwrap();
        watcher.stop();
        watcher.stop();
        std::fs::write(dir.path().join("functions").join("host.json"), "{ }").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(watcher.is_stopped());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_root_is_picked_up_when_created() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("late");
        let (callback, count) = counting_callback();
        let _watcher = ChangeWatcher::watch(
            root.clone(),
            callback,
            names(&["host.json"]),
            Arc::new(|| names(&["functions"])),
            WatchOptions {
                debounce: Duration::from_millis(100),
                poll_interval: Duration::from_millis(50),
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::create_dir_all(root.join("functions")).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        std::fs::write(root.join("functions").join("host.json"), "{}").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    fn start_at(root: &Path, callback: ChangeCallback) -> ChangeWatcher {
        ChangeWatcher::watch(
            root.to_path_buf(),
            callback,
            names(&["host.json"]),
            Arc::new(|| names(&["functions"])),
            WatchOptions {
                debounce: Duration::from_millis(200),
                poll_interval: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn root_removal_emits_one_change_and_recreation_resumes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("jobs");
        std::fs::create_dir_all(root.join("functions")).unwrap();
        std::fs::write(root.join("functions").join("host.json"), "{}").unwrap();
        let (callback, count) = counting_callback();
        let _watcher = start_at(&root, callback);
        tokio::time::sleep(Duration::from_millis(250)).await;

        std::fs::remove_dir_all(&root).unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Recreating the root is itself a change.
        std::fs::create_dir_all(root.join("functions")).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let after_recreate = count.load(Ordering::SeqCst);
        assert!(after_recreate >= 2);

        std::fs::write(root.join("functions").join("host.json"), "{}").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(count.load(Ordering::SeqCst) > after_recreate);
    }

    #[tokio::test]
    async fn replaced_root_keeps_delivering() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("jobs");
        std::fs::create_dir_all(root.join("functions")).unwrap();
        let (callback, count) = counting_callback();
        let _watcher = start_at(&root, callback);
        tokio::time::sleep(Duration::from_millis(250)).await;

        std::fs::remove_dir_all(&root).unwrap();
        std::fs::create_dir_all(root.join("functions")).unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        let after_replace = count.load(Ordering::SeqCst);
        assert!(after_replace >= 1);

        std::fs::write(root.join("functions").join("host.json"), "{}").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(count.load(Ordering::SeqCst) > after_replace);
    }
}
