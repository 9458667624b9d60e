//! Change monitoring.
//!
//! Watches monitored sources and enqueues their ids on the orchestrator's
//! work queue. Local sources get file-system watches (notify); remote
//! sources are re-enqueued on a poll interval. Event bursts for one source
//! coalesce into a single enqueue per debounce window, and the watcher
//! thread never runs pipeline code — it only forwards paths into the
//! monitor loop's channel.
//!
//! A watch that cannot be established downgrades the source
//! (`monitoring_enabled = false`, status `error`) instead of failing the
//! process.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::models::{KnowledgeSource, SourceKind};
use crate::registry::SourceRegistry;

/// Control messages for a running monitor.
pub enum MonitorCommand {
    Watch(KnowledgeSource),
    Unwatch(String),
    Shutdown,
}

/// Handle to a spawned monitor loop.
pub struct MonitorHandle {
    cmd: mpsc::UnboundedSender<MonitorCommand>,
    task: tokio::task::JoinHandle<()>,
}

impl MonitorHandle {
    /// Start watching (or polling) a source.
    pub fn watch(&self, source: KnowledgeSource) {
        let _ = self.cmd.send(MonitorCommand::Watch(source));
    }

    /// Stop watching a source.
    pub fn unwatch(&self, source_id: &str) {
        let _ = self.cmd.send(MonitorCommand::Unwatch(source_id.to_string()));
    }

    /// Stop the monitor loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.cmd.send(MonitorCommand::Shutdown);
        let _ = self.task.await;
    }
}

/// Spawn the monitor loop. Sources already marked `monitoring_enabled` in
/// the registry are registered at startup; later additions arrive via
/// [`MonitorHandle::watch`]. Triggered source ids are sent to `queue`.
pub fn spawn_monitor(
    registry: SourceRegistry,
    queue: mpsc::UnboundedSender<String>,
    config: MonitorConfig,
) -> MonitorHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(registry, queue, config, cmd_rx));
    MonitorHandle { cmd: cmd_tx, task }
}

struct WatchedRoots {
    /// `(watched path, event-match prefix, source id)` per local source.
    local: Vec<(PathBuf, PathBuf, String)>,
    /// Remote source ids re-enqueued on the poll interval.
    polled: Vec<String>,
}

impl WatchedRoots {
    fn contains(&self, source_id: &str) -> bool {
        self.local.iter().any(|(_, _, id)| id == source_id)
            || self.polled.iter().any(|id| id == source_id)
    }
}

async fn run(
    registry: SourceRegistry,
    queue: mpsc::UnboundedSender<String>,
    config: MonitorConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<MonitorCommand>,
) {
    let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watcher: RecommendedWatcher =
        match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let _ = fs_tx.send(path);
                }
            }
        }) {
            Ok(watcher) => watcher,
            Err(err) => {
                warn!(error = %err, "file watcher unavailable, monitor loop not started");
                return;
            }
        };

    let mut roots = WatchedRoots {
        local: Vec::new(),
        polled: Vec::new(),
    };

    // Register everything already marked for monitoring.
    match registry.monitored().await {
        Ok(sources) => {
            for source in sources {
                add_source(&registry, &mut watcher, &mut roots, source).await;
            }
        }
        Err(err) => warn!(error = %err, "could not load monitored sources"),
    }

    let debounce = Duration::from_millis(config.debounce_ms.max(1));
    let poll = Duration::from_secs(config.poll_interval_secs.max(1));

    let mut debounce_tick = tokio::time::interval(debounce);
    let mut poll_tick =
        tokio::time::interval_at(tokio::time::Instant::now() + poll, poll);

    let mut pending: HashSet<String> = HashSet::new();

    info!(
        local = roots.local.len(),
        polled = roots.polled.len(),
        "change monitor running"
    );

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(MonitorCommand::Watch(source)) => {
                    add_source(&registry, &mut watcher, &mut roots, source).await;
                }
                Some(MonitorCommand::Unwatch(source_id)) => {
                    remove_source(&mut watcher, &mut roots, &source_id);
                }
                Some(MonitorCommand::Shutdown) | None => break,
            },
            Some(path) = fs_rx.recv() => {
                for (_, prefix, source_id) in &roots.local {
                    if path.starts_with(prefix) {
                        pending.insert(source_id.clone());
                    }
                }
            }
            _ = debounce_tick.tick() => {
                for source_id in pending.drain() {
                    debug!(source = %source_id, "change detected, enqueueing re-scan");
                    let _ = queue.send(source_id);
                }
            }
            _ = poll_tick.tick() => {
                for source_id in &roots.polled {
                    debug!(source = %source_id, "poll interval elapsed, enqueueing re-scan");
                    let _ = queue.send(source_id.clone());
                }
            }
        }
    }

    debug!("change monitor stopped");
}

async fn add_source(
    registry: &SourceRegistry,
    watcher: &mut RecommendedWatcher,
    roots: &mut WatchedRoots,
    source: KnowledgeSource,
) {
    // One live registration per source, never two.
    if roots.contains(&source.id) {
        return;
    }

    if !source.kind.is_local() {
        roots.polled.push(source.id);
        return;
    }

    let target = Path::new(&source.locator).to_path_buf();
    // Single files are watched through their parent directory; events are
    // filtered back down to the file itself by prefix.
    let (watch_path, mode) = match source.kind {
        SourceKind::LocalFile => (
            target
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| target.clone()),
            RecursiveMode::NonRecursive,
        ),
        _ => (target.clone(), RecursiveMode::Recursive),
    };

    match watcher.watch(&watch_path, mode) {
        Ok(()) => {
            debug!(source = %source.id, path = %watch_path.display(), "watch established");
            roots.local.push((watch_path, target, source.id));
        }
        Err(err) => {
            if let Err(db_err) = registry
                .disable_monitoring(&source.id, &err.to_string())
                .await
            {
                warn!(source = %source.id, error = %db_err, "could not record watch failure");
            }
        }
    }
}

fn remove_source(watcher: &mut RecommendedWatcher, roots: &mut WatchedRoots, source_id: &str) {
    if let Some(pos) = roots.local.iter().position(|(_, _, id)| id == source_id) {
        let (watch_path, _, _) = roots.local.remove(pos);
        // Another source may still be watching the same path.
        let still_used = roots.local.iter().any(|(p, _, _)| *p == watch_path);
        if !still_used {
            if let Err(err) = watcher.unwatch(&watch_path) {
                debug!(path = %watch_path.display(), error = %err, "unwatch failed");
            }
        }
    }
    roots.polled.retain(|id| id != source_id);
}
