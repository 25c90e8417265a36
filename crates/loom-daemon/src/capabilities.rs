use crate::git::{GitCapabilities, GitOutcome};
use chrono::Utc;
use loom_core::ephemeral::{EnvironmentInfo, MachineCapabilities, Namespace};
use loom_core::store::{DocStore, Origin};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{info, warn};

/// Detects what this machine offers and publishes it to the room.
pub struct CapabilityPublisher {
    machine_id: String,
    git: Arc<dyn GitCapabilities>,
    store: Arc<DocStore>,
    repo_roots: StdMutex<Vec<PathBuf>>,
}

impl CapabilityPublisher {
    pub fn new(
        machine_id: &str,
        git: Arc<dyn GitCapabilities>,
        store: Arc<DocStore>,
        repo_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            git,
            store,
            repo_roots: StdMutex::new(repo_roots),
        }
    }

    pub fn add_root(&self, root: &Path) {
        if let Ok(mut roots) = self.repo_roots.lock() {
            if !roots.iter().any(|existing| existing == root) {
                roots.push(root.to_path_buf());
            }
        }
    }

    pub async fn detect(&self) -> MachineCapabilities {
        let roots = self
            .repo_roots
            .lock()
            .map(|roots| roots.clone())
            .unwrap_or_default();
        let mut environments = Vec::new();
        for root in roots {
            match self.git.list_worktrees(&root).await {
                Ok(GitOutcome::Value(entries)) => {
                    environments.extend(entries.into_iter().map(|entry| EnvironmentInfo {
                        path: entry.path.to_string_lossy().to_string(),
                        branch: entry.branch,
                        is_worktree: !entry.is_main,
                    }));
                }
                Ok(GitOutcome::Empty(_)) => {}
                Err(err) => {
                    warn!(event = "capabilities_worktrees_failed", root = %root.display(), error = %err);
                }
            }
        }
        environments.sort_by(|a, b| a.path.cmp(&b.path));
        environments.dedup_by(|a, b| a.path == b.path);

        MachineCapabilities {
            machine_id: self.machine_id.clone(),
            hostname: hostname().unwrap_or_else(|| self.machine_id.clone()),
            shell: env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
            environments,
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    pub async fn publish(&self) -> MachineCapabilities {
        let capabilities = self.detect().await;
        let room = self.store.room();
        if let Err(err) = room
            .ephemeral()
            .set(
                Namespace::Capabilities,
                &self.machine_id,
                &capabilities,
                Origin::Local,
            )
            .await
        {
            warn!(event = "capabilities_publish_failed", error = %err);
        } else {
            info!(
                event = "capabilities_published",
                machine_id = %self.machine_id,
                environments = capabilities.environments.len()
            );
        }
        capabilities
    }
}

fn hostname() -> Option<String> {
    if let Ok(value) = env::var("HOSTNAME") {
        if !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGit;

    #[tokio::test]
    async fn publish_lists_worktrees_of_every_root() {
        let git = FakeGit::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let worktree = dir.path().join("wt-feature");
        git.create_worktree(Path::new("/repo"), &worktree, "feature", None)
            .await
            .expect("worktree");
        let store = Arc::new(DocStore::new("room"));
        let publisher = CapabilityPublisher::new("m1", git, store.clone(), vec![PathBuf::from("/repo")]);

        let published = publisher.publish().await;
        assert_eq!(published.environments.len(), 2);
        assert!(published
            .environments
            .iter()
            .any(|env| env.is_worktree && env.branch.as_deref() == Some("feature")));

        let stored: MachineCapabilities = store
            .room()
            .ephemeral()
            .get_as(Namespace::Capabilities, "m1")
            .await
            .expect("decode")
            .expect("entry");
        assert_eq!(stored.machine_id, "m1");
        assert_eq!(stored.environments, published.environments);
    }
}
