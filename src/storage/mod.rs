//! Unified storage engine: durable CRUD for every entity, with an optional
//! write-through cache, post-commit events, and transactional rollback.

pub mod cache;
pub mod engine;
pub mod events;
pub mod file_store;
pub mod stats;

pub use engine::{QueryFilter, StorageEngine, Transaction};
pub use events::{StorageEvent, StorageOp};
pub use stats::StorageStatsSnapshot;

use crate::models::{AtomicTask, Dependency, DependencyGraph, Epic, Project};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Epic,
    Task,
    Dependency,
    Graph,
}

impl EntityKind {
    /// Subdirectory of the data dir holding this kind.
    pub fn dir(&self) -> &'static str {
        match self {
            EntityKind::Project => "projects",
            EntityKind::Epic => "epics",
            EntityKind::Task => "tasks",
            EntityKind::Dependency => "dependencies",
            EntityKind::Graph => "graphs",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Epic => "epic",
            EntityKind::Task => "task",
            EntityKind::Dependency => "dependency",
            EntityKind::Graph => "graph",
        }
    }
}

/// Implemented by every entity the engine can persist.
pub trait Persistable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Advance `updated_at`; called on every mutation before commit.
    fn touch(&mut self);
}

impl Persistable for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

impl Persistable for Epic {
    const KIND: EntityKind = EntityKind::Epic;

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

impl Persistable for AtomicTask {
    const KIND: EntityKind = EntityKind::Task;

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

impl Persistable for Dependency {
    const KIND: EntityKind = EntityKind::Dependency;

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

impl Persistable for DependencyGraph {
    const KIND: EntityKind = EntityKind::Graph;

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}
