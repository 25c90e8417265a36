use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const IGNORED_DIRS: [&str; 2] = ["target", "node_modules"];

type Roots = Arc<StdMutex<BTreeSet<PathBuf>>>;

/// Watches registered worktrees and reports the root of every tree that
/// changed.
pub struct BranchWatcher {
    watcher: StdMutex<Option<RecommendedWatcher>>,
    roots: Roots,
}

impl BranchWatcher {
    pub fn start() -> (Self, mpsc::UnboundedReceiver<PathBuf>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let roots: Roots = Arc::new(StdMutex::new(BTreeSet::new()));
        let watched = roots.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else {
                return;
            };
            let Ok(roots) = watched.lock() else {
                return;
            };
            let mut changed = BTreeSet::new();
            for path in &event.paths {
                if let Some(root) = root_for(&roots, path) {
                    if !is_ignored(&root, path) {
                        changed.insert(root);
                    }
                }
            }
            for root in changed {
                let _ = tx.send(root);
            }
        });
        let watcher = match watcher {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(event = "branch_watch_unavailable", error = %err);
                None
            }
        };
        (
            Self {
                watcher: StdMutex::new(watcher),
                roots,
            },
            rx,
        )
    }

    /// Returns true when the root was not watched before.
    pub fn register(&self, root: &Path) -> bool {
        let Ok(mut roots) = self.roots.lock() else {
            return false;
        };
        if roots.contains(root) {
            return false;
        }
        let Ok(mut watcher) = self.watcher.lock() else {
            return false;
        };
        if let Some(watcher) = watcher.as_mut() {
            if let Err(err) = watcher.watch(root, RecursiveMode::Recursive) {
                warn!(event = "branch_watch_failed", root = %root.display(), error = %err);
                return false;
            }
        }
        roots.insert(root.to_path_buf());
        debug!(event = "branch_watch_registered", root = %root.display());
        true
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots
            .lock()
            .map(|roots| roots.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stop(&self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            watcher.take();
        }
    }
}

/// Deepest registered root containing `path`.
pub fn root_for(roots: &BTreeSet<PathBuf>, path: &Path) -> Option<PathBuf> {
    roots
        .iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
        .cloned()
}

pub fn is_ignored(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return true;
    };
    let parts = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>();
    if parts.len() >= 2 && parts[0] == ".git" && parts[1] == "objects" {
        return true;
    }
    parts.iter().any(|part| IGNORED_DIRS.contains(part))
}
