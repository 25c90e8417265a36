//! Local replica of the replicated documents.
//!
//! The CRDT sync engine lives outside this crate; it applies browser writes
//! through the same handles with [`Origin::Remote`]. Everything the daemon
//! writes is tagged [`Origin::Local`] so subscribers can skip their own echoes.

use crate::ephemeral::Namespace;
use crate::{RoomDocument, TaskDocument, TaskIndexEntry, TaskStatus};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone)]
pub struct DocChange<T> {
    pub origin: Origin,
    pub doc: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralEvent {
    pub namespace: Namespace,
    pub key: String,
    /// `None` when the entry was deleted.
    pub value: Option<Value>,
    pub origin: Origin,
}

struct EphemeralEntry {
    value: Value,
    origin: Origin,
    stored_at: Instant,
}

pub struct EphemeralSpace {
    entries: RwLock<HashMap<Namespace, HashMap<String, EphemeralEntry>>>,
    events: broadcast::Sender<EphemeralEvent>,
}

impl EphemeralSpace {
    fn new() -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub async fn set<V: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &V,
        origin: Origin,
    ) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(value).map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.set_value(namespace, key, value, origin).await;
        Ok(())
    }

    pub async fn set_value(&self, namespace: Namespace, key: &str, value: Value, origin: Origin) {
        {
            let mut entries = self.entries.write().await;
            entries.entry(namespace).or_default().insert(
                key.to_string(),
                EphemeralEntry {
                    value: value.clone(),
                    origin,
                    stored_at: Instant::now(),
                },
            );
        }
        let _ = self.events.send(EphemeralEvent {
            namespace,
            key: key.to_string(),
            value: Some(value),
            origin,
        });
    }

    pub async fn get(&self, namespace: Namespace, key: &str) -> Option<Value> {
        self.get_with_origin(namespace, key)
            .await
            .map(|(value, _)| value)
    }

    pub async fn get_with_origin(&self, namespace: Namespace, key: &str) -> Option<(Value, Origin)> {
        let entries = self.entries.read().await;
        entries
            .get(&namespace)
            .and_then(|space| space.get(key))
            .map(|entry| (entry.value.clone(), entry.origin))
    }

    pub async fn get_as<V: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Result<Option<V>, StoreError> {
        match self.get(namespace, key).await {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| StoreError::Serialization(err.to_string())),
            None => Ok(None),
        }
    }

    /// Returns whether an entry existed. Delete events are only emitted for
    /// entries that were present.
    pub async fn delete(&self, namespace: Namespace, key: &str, origin: Origin) -> bool {
        let removed = {
            let mut entries = self.entries.write().await;
            entries
                .get_mut(&namespace)
                .and_then(|space| space.remove(key))
                .is_some()
        };
        if removed {
            let _ = self.events.send(EphemeralEvent {
                namespace,
                key: key.to_string(),
                value: None,
                origin,
            });
        }
        removed
    }

    pub async fn keys(&self, namespace: Namespace) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut keys = entries
            .get(&namespace)
            .map(|space| space.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EphemeralEvent> {
        self.events.subscribe()
    }

    pub async fn sweep_expired<F>(&self, ttl_for: F) -> usize
    where
        F: Fn(Namespace) -> Duration,
    {
        let now = Instant::now();
        let expired = {
            let mut entries = self.entries.write().await;
            let mut expired = Vec::new();
            for (namespace, space) in entries.iter_mut() {
                let ttl = ttl_for(*namespace);
                space.retain(|key, entry| {
                    let keep = now.duration_since(entry.stored_at) <= ttl;
                    if !keep {
                        expired.push((*namespace, key.clone()));
                    }
                    keep
                });
            }
            expired
        };
        for (namespace, key) in &expired {
            let _ = self.events.send(EphemeralEvent {
                namespace: *namespace,
                key: key.clone(),
                value: None,
                origin: Origin::Local,
            });
        }
        expired.len()
    }
}

pub struct DocHandle<T> {
    id: String,
    doc: RwLock<T>,
    changes: broadcast::Sender<DocChange<T>>,
    ephemeral: EphemeralSpace,
}

impl<T> DocHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>, doc: T) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            id: id.into(),
            doc: RwLock::new(doc),
            changes,
            ephemeral: EphemeralSpace::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn snapshot(&self) -> T {
        self.doc.read().await.clone()
    }

    pub async fn read<R>(&self, view: impl FnOnce(&T) -> R) -> R {
        let doc = self.doc.read().await;
        view(&doc)
    }

    /// Applies a mutation and notifies subscribers with the resulting snapshot.
    pub async fn update<R>(&self, origin: Origin, apply: impl FnOnce(&mut T) -> R) -> R {
        let (result, snapshot) = {
            let mut doc = self.doc.write().await;
            let result = apply(&mut doc);
            (result, doc.clone())
        };
        let _ = self.changes.send(DocChange {
            origin,
            doc: snapshot,
        });
        result
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocChange<T>> {
        self.changes.subscribe()
    }

    pub fn ephemeral(&self) -> &EphemeralSpace {
        &self.ephemeral
    }
}

pub struct DocStore {
    tasks: RwLock<HashMap<String, Arc<DocHandle<TaskDocument>>>>,
    room: Arc<DocHandle<RoomDocument>>,
}

impl DocStore {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            room: Arc::new(DocHandle::new(room_id, RoomDocument::default())),
        }
    }

    pub fn room(&self) -> Arc<DocHandle<RoomDocument>> {
        self.room.clone()
    }

    /// Returns the handle for a task document, creating an empty one on first use.
    pub async fn task(&self, task_id: &str) -> Arc<DocHandle<TaskDocument>> {
        if let Some(handle) = self.tasks.read().await.get(task_id) {
            return handle.clone();
        }
        let mut tasks = self.tasks.write().await;
        tasks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(DocHandle::new(task_id, TaskDocument::default())))
            .clone()
    }

    pub async fn existing_task(&self, task_id: &str) -> Option<Arc<DocHandle<TaskDocument>>> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn task_ids(&self) -> Vec<String> {
        let mut ids = self.tasks.read().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Writes `meta.status` and mirrors it into the room task index.
    pub async fn set_task_status(&self, task_id: &str, status: TaskStatus) {
        let now = Utc::now().to_rfc3339();
        let handle = self.task(task_id).await;
        let title = handle
            .update(Origin::Local, |doc| {
                doc.meta.status = status;
                doc.meta.updated_at = Some(now.clone());
                doc.meta.title.clone()
            })
            .await;
        self.room
            .update(Origin::Local, |room| {
                let entry = room
                    .task_index
                    .entry(task_id.to_string())
                    .or_insert_with(|| TaskIndexEntry {
                        title,
                        ..TaskIndexEntry::default()
                    });
                entry.status = status;
                entry.updated_at = Some(now);
            })
            .await;
    }

    pub async fn sweep_ephemeral<F>(&self, ttl_for: F) -> usize
    where
        F: Fn(Namespace) -> Duration,
    {
        let mut swept = self.room.ephemeral().sweep_expired(&ttl_for).await;
        let tasks = self.tasks.read().await.values().cloned().collect::<Vec<_>>();
        for task in tasks {
            swept += task.ephemeral().sweep_expired(&ttl_for).await;
        }
        swept
    }
}
