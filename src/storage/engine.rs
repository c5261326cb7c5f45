use super::cache::EntityCache;
use super::events::EventHub;
use super::file_store::FileStore;
use super::stats::{OpKind, StorageStats, StorageStatsSnapshot};
use super::{EntityKind, Persistable, StorageOp};
use crate::config::LoomConfig;
use crate::models::{
    AtomicTask, Dependency, DependencyGraph, Epic, Priority, Project, TaskStatus, TaskType,
};
use crate::security::locks::LockManager;
use crate::{LoomError, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Each engine operation locks under a fresh owner so concurrent writers to
/// the same entity genuinely serialise (reentrancy is per owner).
fn op_owner() -> String {
    format!("store-op-{}", Uuid::new_v4())
}

/// Filter for `query_tasks`; all present fields must match.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub project_id: Option<String>,
    pub epic_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub priority: Option<Priority>,
}

/// Durable CRUD over the §-style entity set.
///
/// Writers to the same entity are serialised through the lock manager under
/// the `store:` namespace; the cache is replaced (never left stale) on every
/// committed write, and each commit emits exactly one event.
#[derive(Clone)]
pub struct StorageEngine {
    files: FileStore,
    locks: LockManager,
    events: EventHub,
    stats: Arc<StorageStats>,
    projects: EntityCache<Project>,
    epics: EntityCache<Epic>,
    tasks: EntityCache<AtomicTask>,
    dependencies: EntityCache<Dependency>,
    graphs: EntityCache<DependencyGraph>,
    op_timeout: Duration,
    lock_timeout: Duration,
}

impl StorageEngine {
    pub async fn open(config: &LoomConfig, locks: LockManager) -> Result<Self> {
        let files = FileStore::open(&config.data_dir).await?;
        Ok(Self {
            files,
            locks,
            events: EventHub::new(),
            stats: Arc::new(StorageStats::new()),
            projects: EntityCache::new(&config.cache),
            epics: EntityCache::new(&config.cache),
            tasks: EntityCache::new(&config.cache),
            dependencies: EntityCache::new(&config.cache),
            graphs: EntityCache::new(&config.cache),
            op_timeout: Duration::from_secs(config.timeouts.storage_secs),
            lock_timeout: Duration::from_secs(config.timeouts.lock_secs),
        })
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn subscribe(&self) -> broadcast::Receiver<super::StorageEvent> {
        self.events.subscribe()
    }

    pub fn stats_snapshot(&self) -> StorageStatsSnapshot {
        self.stats.snapshot()
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => {
                self.stats.record_failure();
                Err(LoomError::Timeout {
                    message: "storage operation exceeded its budget".to_string(),
                })
            }
        }
    }

    // ---- generic paths ---------------------------------------------------

    async fn create_in<T: Persistable>(&self, cache: &EntityCache<T>, mut value: T) -> Result<T> {
        let start = Instant::now();
        let key = format!("store:{}:{}", T::KIND.label(), value.id());
        let _guard = self.locks.acquire(&key, &op_owner(), self.lock_timeout).await?;

        if self.timed(self.files.exists(T::KIND, value.id())).await? {
            self.stats.record_failure();
            return Err(LoomError::AlreadyExists(format!(
                "{} {}",
                T::KIND.label(),
                value.id()
            )));
        }

        value.touch();
        self.timed(self.files.write(&value)).await?;
        cache.insert(value.id(), value.clone());
        self.events.emit(
            T::KIND,
            StorageOp::Created,
            value.id(),
            serde_json::to_value(&value).ok(),
        );
        self.stats.record(OpKind::Create, start.elapsed());
        Ok(value)
    }

    async fn get_in<T: Persistable>(&self, cache: &EntityCache<T>, id: &str) -> Result<T> {
        self.try_get_in(cache, id).await?.ok_or_else(|| {
            LoomError::NotFound(format!("{} {}", T::KIND.label(), id))
        })
    }

    async fn try_get_in<T: Persistable>(
        &self,
        cache: &EntityCache<T>,
        id: &str,
    ) -> Result<Option<T>> {
        let start = Instant::now();
        if let Some(hit) = cache.get(id) {
            self.stats.record(OpKind::Read, start.elapsed());
            return Ok(Some(hit));
        }

        let value = self.timed(self.files.read::<T>(id)).await?;
        if let Some(value) = &value {
            cache.insert(id, value.clone());
        }
        self.stats.record(OpKind::Read, start.elapsed());
        Ok(value)
    }

    async fn update_in<T: Persistable>(&self, cache: &EntityCache<T>, mut value: T) -> Result<T> {
        let start = Instant::now();
        let key = format!("store:{}:{}", T::KIND.label(), value.id());
        let _guard = self.locks.acquire(&key, &op_owner(), self.lock_timeout).await?;

        if !self.timed(self.files.exists(T::KIND, value.id())).await? {
            self.stats.record_failure();
            return Err(LoomError::NotFound(format!(
                "{} {}",
                T::KIND.label(),
                value.id()
            )));
        }

        value.touch();
        self.timed(self.files.write(&value)).await?;
        cache.insert(value.id(), value.clone());
        self.events.emit(
            T::KIND,
            StorageOp::Updated,
            value.id(),
            serde_json::to_value(&value).ok(),
        );
        self.stats.record(OpKind::Update, start.elapsed());
        Ok(value)
    }

    /// Read-modify-write under the entity's lock, so concurrent mutators of
    /// the same entity cannot lose updates.
    async fn mutate_in<T: Persistable>(
        &self,
        cache: &EntityCache<T>,
        id: &str,
        f: impl FnOnce(&mut T),
    ) -> Result<T> {
        let start = Instant::now();
        let key = format!("store:{}:{id}", T::KIND.label());
        let _guard = self.locks.acquire(&key, &op_owner(), self.lock_timeout).await?;

        let mut value: T = self
            .timed(self.files.read::<T>(id))
            .await?
            .ok_or_else(|| LoomError::NotFound(format!("{} {}", T::KIND.label(), id)))?;
        f(&mut value);
        value.touch();
        self.timed(self.files.write(&value)).await?;
        cache.insert(id, value.clone());
        self.events.emit(
            T::KIND,
            StorageOp::Updated,
            id,
            serde_json::to_value(&value).ok(),
        );
        self.stats.record(OpKind::Update, start.elapsed());
        Ok(value)
    }

    async fn delete_in<T: Persistable>(&self, cache: &EntityCache<T>, id: &str) -> Result<()> {
        let start = Instant::now();
        let key = format!("store:{}:{}", T::KIND.label(), id);
        let _guard = self.locks.acquire(&key, &op_owner(), self.lock_timeout).await?;

        if !self.timed(self.files.delete(T::KIND, id)).await? {
            self.stats.record_failure();
            return Err(LoomError::NotFound(format!("{} {}", T::KIND.label(), id)));
        }
        cache.invalidate(id);
        self.events.emit(T::KIND, StorageOp::Deleted, id, None);
        self.stats.record(OpKind::Delete, start.elapsed());
        Ok(())
    }

    async fn list_in<T: Persistable>(&self) -> Result<Vec<T>> {
        let start = Instant::now();
        let all = self.timed(self.files.read_all::<T>()).await?;
        self.stats.record(OpKind::List, start.elapsed());
        Ok(all)
    }

    // ---- projects --------------------------------------------------------

    pub async fn create_project(&self, project: Project) -> Result<Project> {
        self.create_in(&self.projects, project).await
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        self.get_in(&self.projects, id).await
    }

    pub async fn try_get_project(&self, id: &str) -> Result<Option<Project>> {
        self.try_get_in(&self.projects, id).await
    }

    pub async fn update_project(&self, project: Project) -> Result<Project> {
        self.update_in(&self.projects, project).await
    }

    pub async fn project_exists(&self, id: &str) -> Result<bool> {
        self.files.exists(EntityKind::Project, id).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.list_in::<Project>().await
    }

    /// Delete a project and everything it owns, transactionally.
    pub async fn delete_project_cascade(&self, project_id: &str) -> Result<()> {
        let project = self.get_project(project_id).await?;
        let epics = self.list_epics_by_project(project_id).await?;
        let tasks = self.list_tasks_by_project(project_id).await?;
        let deps = self.list_dependencies_by_project(project_id).await?;

        let mut tx = self.begin();
        let outcome = async {
            for dep in &deps {
                tx.delete(EntityKind::Dependency, &dep.id).await?;
            }
            let graph_id = format!("graph-{project_id}");
            if self.files.exists(EntityKind::Graph, &graph_id).await? {
                tx.delete(EntityKind::Graph, &graph_id).await?;
            }
            for task in &tasks {
                tx.delete(EntityKind::Task, &task.id).await?;
            }
            for epic in &epics {
                tx.delete(EntityKind::Epic, &epic.id).await?;
            }
            tx.delete(EntityKind::Project, &project.id).await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                tx.commit();
                debug!(project_id, "project cascade delete committed");
                Ok(())
            }
            Err(e) => {
                error!(project_id, error = %e, "project cascade delete failed, rolling back");
                tx.rollback().await;
                Err(e)
            }
        }
    }

    // ---- epics -----------------------------------------------------------

    /// Create an epic and link it into its project's ordered epic list.
    pub async fn create_epic(&self, epic: Epic) -> Result<Epic> {
        if !self.project_exists(&epic.project_id).await? {
            return Err(LoomError::NotFound(format!("project {}", epic.project_id)));
        }
        let epic = self.create_in(&self.epics, epic).await?;
        let epic_id = epic.id.clone();
        self.mutate_in(&self.projects, &epic.project_id, |p| {
            if !p.epic_ids.contains(&epic_id) {
                p.epic_ids.push(epic_id.clone());
            }
        })
        .await?;
        Ok(epic)
    }

    pub async fn get_epic(&self, id: &str) -> Result<Epic> {
        self.get_in(&self.epics, id).await
    }

    pub async fn update_epic(&self, epic: Epic) -> Result<Epic> {
        self.update_in(&self.epics, epic).await
    }

    pub async fn delete_epic(&self, id: &str) -> Result<()> {
        let epic = self.get_epic(id).await?;
        self.delete_in(&self.epics, id).await?;
        let epic_id = id.to_string();
        match self
            .mutate_in(&self.projects, &epic.project_id, |p| {
                p.epic_ids.retain(|e| e != &epic_id);
            })
            .await
        {
            Ok(_) | Err(LoomError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_epics_by_project(&self, project_id: &str) -> Result<Vec<Epic>> {
        let all = self.list_in::<Epic>().await?;
        Ok(all.into_iter().filter(|e| e.project_id == project_id).collect())
    }

    // ---- tasks -----------------------------------------------------------

    /// Create a task under an existing epic of the same project.
    pub async fn create_task(&self, task: AtomicTask) -> Result<AtomicTask> {
        let epic = self.get_epic(&task.epic_id).await?;
        if epic.project_id != task.project_id {
            return Err(LoomError::Validation(format!(
                "task {} project does not match its epic's project",
                task.id
            )));
        }
        let task = self.create_in(&self.tasks, task).await?;
        let task_id = task.id.clone();
        self.mutate_in(&self.epics, &task.epic_id, |e| {
            if !e.task_ids.contains(&task_id) {
                e.task_ids.push(task_id.clone());
            }
        })
        .await?;
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<AtomicTask> {
        self.get_in(&self.tasks, id).await
    }

    pub async fn try_get_task(&self, id: &str) -> Result<Option<AtomicTask>> {
        self.try_get_in(&self.tasks, id).await
    }

    pub async fn update_task(&self, task: AtomicTask) -> Result<AtomicTask> {
        self.update_in(&self.tasks, task).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let task = self.get_task(id).await?;
        self.delete_in(&self.tasks, id).await?;
        let task_id = id.to_string();
        match self
            .mutate_in(&self.epics, &task.epic_id, |e| {
                e.task_ids.retain(|t| t != &task_id);
            })
            .await
        {
            Ok(_) | Err(LoomError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn task_exists(&self, id: &str) -> Result<bool> {
        self.files.exists(EntityKind::Task, id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<AtomicTask>> {
        self.list_in::<AtomicTask>().await
    }

    pub async fn list_tasks_by_project(&self, project_id: &str) -> Result<Vec<AtomicTask>> {
        let all = self.list_in::<AtomicTask>().await?;
        Ok(all.into_iter().filter(|t| t.project_id == project_id).collect())
    }

    pub async fn list_tasks_by_epic(&self, epic_id: &str) -> Result<Vec<AtomicTask>> {
        let all = self.list_in::<AtomicTask>().await?;
        Ok(all.into_iter().filter(|t| t.epic_id == epic_id).collect())
    }

    pub async fn query_tasks(&self, filter: &QueryFilter) -> Result<Vec<AtomicTask>> {
        let all = self.list_in::<AtomicTask>().await?;
        Ok(all
            .into_iter()
            .filter(|t| {
                filter.project_id.as_ref().is_none_or(|p| &t.project_id == p)
                    && filter.epic_id.as_ref().is_none_or(|e| &t.epic_id == e)
                    && filter.status.is_none_or(|s| t.status == s)
                    && filter.task_type.is_none_or(|ty| t.task_type == ty)
                    && filter.priority.is_none_or(|p| t.priority == p)
            })
            .collect())
    }

    // ---- dependencies ----------------------------------------------------

    /// Create a dependency edge and maintain the task mirrors.
    ///
    /// `from_task` must complete before `to_task`. Both endpoints must exist
    /// in the dependency's project, and the new edge must not close a cycle.
    pub async fn create_dependency(&self, dep: Dependency) -> Result<Dependency> {
        if dep.from_task == dep.to_task {
            return Err(LoomError::Validation(
                "dependency endpoints must differ".to_string(),
            ));
        }
        let from = self.get_task(&dep.from_task).await?;
        let to = self.get_task(&dep.to_task).await?;
        if from.project_id != dep.project_id || to.project_id != dep.project_id {
            return Err(LoomError::Validation(
                "dependency endpoints must belong to the dependency's project".to_string(),
            ));
        }

        let existing = self.list_dependencies_by_project(&dep.project_id).await?;
        if would_close_cycle(&existing, &dep.from_task, &dep.to_task) {
            return Err(LoomError::Validation(format!(
                "dependency {} -> {} would create a cycle",
                dep.from_task, dep.to_task
            )));
        }

        let dep = self.create_in(&self.dependencies, dep).await?;

        let from_id = dep.from_task.clone();
        self.mutate_in(&self.tasks, &dep.to_task, |t| {
            if !t.depends_on.contains(&from_id) {
                t.depends_on.push(from_id.clone());
            }
        })
        .await?;
        let to_id = dep.to_task.clone();
        self.mutate_in(&self.tasks, &dep.from_task, |t| {
            if !t.dependents.contains(&to_id) {
                t.dependents.push(to_id.clone());
            }
        })
        .await?;
        Ok(dep)
    }

    pub async fn delete_dependency(&self, id: &str) -> Result<()> {
        let dep = self.get_in(&self.dependencies, id).await?;
        self.delete_in(&self.dependencies, id).await?;

        let from_id = dep.from_task.clone();
        if let Err(e) = self
            .mutate_in(&self.tasks, &dep.to_task, |t| {
                t.depends_on.retain(|x| x != &from_id);
            })
            .await
        {
            if !matches!(e, LoomError::NotFound(_)) {
                return Err(e);
            }
        }
        let to_id = dep.to_task.clone();
        if let Err(e) = self
            .mutate_in(&self.tasks, &dep.from_task, |t| {
                t.dependents.retain(|x| x != &to_id);
            })
            .await
        {
            if !matches!(e, LoomError::NotFound(_)) {
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn list_dependencies_by_project(&self, project_id: &str) -> Result<Vec<Dependency>> {
        let all = self.list_in::<Dependency>().await?;
        Ok(all.into_iter().filter(|d| d.project_id == project_id).collect())
    }

    // ---- graphs ----------------------------------------------------------

    pub async fn save_graph(&self, graph: DependencyGraph) -> Result<DependencyGraph> {
        if self.files.exists(EntityKind::Graph, &graph.id).await? {
            self.update_in(&self.graphs, graph).await
        } else {
            self.create_in(&self.graphs, graph).await
        }
    }

    pub async fn get_graph(&self, project_id: &str) -> Result<Option<DependencyGraph>> {
        self.try_get_in(&self.graphs, &format!("graph-{project_id}")).await
    }

    // ---- transactions ----------------------------------------------------

    pub fn begin(&self) -> Transaction {
        Transaction {
            engine: self.clone(),
            owner: format!("txn-{}", Uuid::new_v4()),
            undo: Vec::new(),
        }
    }

    fn invalidate_raw(&self, kind: EntityKind, id: &str) {
        match kind {
            EntityKind::Project => self.projects.invalidate(id),
            EntityKind::Epic => self.epics.invalidate(id),
            EntityKind::Task => self.tasks.invalidate(id),
            EntityKind::Dependency => self.dependencies.invalidate(id),
            EntityKind::Graph => self.graphs.invalidate(id),
        }
    }
}

/// Returns true when adding `from -> to` would make `from` reachable from `to`.
fn would_close_cycle(existing: &[Dependency], from: &str, to: &str) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in existing {
        adjacency
            .entry(dep.from_task.as_str())
            .or_default()
            .push(dep.to_task.as_str());
    }

    let mut stack = vec![to];
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == from {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = adjacency.get(node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

struct UndoEntry {
    kind: EntityKind,
    id: String,
    prior: Option<serde_json::Value>,
}

/// Journal of prior states; either `commit` (drop the journal) or `rollback`
/// (restore every touched entity in reverse order).
pub struct Transaction {
    engine: StorageEngine,
    owner: String,
    undo: Vec<UndoEntry>,
}

impl Transaction {
    async fn snapshot(&mut self, kind: EntityKind, id: &str) -> Result<()> {
        if self.undo.iter().any(|u| u.kind == kind && u.id == id) {
            return Ok(());
        }
        let prior = self.engine.files.read_raw(kind, id).await?;
        self.undo.push(UndoEntry {
            kind,
            id: id.to_string(),
            prior,
        });
        Ok(())
    }

    pub async fn put(
        &mut self,
        kind: EntityKind,
        id: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.snapshot(kind, id).await?;
        let key = format!("store:{}:{id}", kind.label());
        let _guard = self
            .engine
            .locks
            .acquire(&key, &self.owner, self.engine.lock_timeout)
            .await?;
        let existed = self.engine.files.exists(kind, id).await?;
        self.engine.files.write_raw(kind, id, &value).await?;
        self.engine.invalidate_raw(kind, id);
        let op = if existed { StorageOp::Updated } else { StorageOp::Created };
        self.engine.events.emit(kind, op, id, Some(value));
        Ok(())
    }

    pub async fn delete(&mut self, kind: EntityKind, id: &str) -> Result<()> {
        self.snapshot(kind, id).await?;
        let key = format!("store:{}:{id}", kind.label());
        let _guard = self
            .engine
            .locks
            .acquire(&key, &self.owner, self.engine.lock_timeout)
            .await?;
        if self.engine.files.delete(kind, id).await? {
            self.engine.invalidate_raw(kind, id);
            self.engine.events.emit(kind, StorageOp::Deleted, id, None);
        }
        Ok(())
    }

    pub fn commit(self) {}

    /// Best-effort restoration; failures are logged and skipped so the rest
    /// of the journal still unwinds.
    pub async fn rollback(mut self) {
        while let Some(entry) = self.undo.pop() {
            let result = match &entry.prior {
                Some(value) => self.engine.files.write_raw(entry.kind, &entry.id, value).await,
                None => self.engine.files.delete(entry.kind, &entry.id).await.map(|_| ()),
            };
            if let Err(e) = result {
                warn!(
                    kind = entry.kind.label(),
                    id = %entry.id,
                    error = %e,
                    "rollback step failed"
                );
                continue;
            }
            self.engine.invalidate_raw(entry.kind, &entry.id);
            let op = if entry.prior.is_some() {
                StorageOp::Updated
            } else {
                StorageOp::Deleted
            };
            self.engine.events.emit(entry.kind, op, &entry.id, entry.prior.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DependencyKind, TaskType};
    use crate::security::locks::LockManager;

    async fn engine() -> (tempfile::TempDir, StorageEngine) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LoomConfig::default();
        config.data_dir = dir.path().to_string_lossy().to_string();
        let locks = LockManager::new(Duration::from_secs(5));
        let engine = StorageEngine::open(&config, locks).await.unwrap();
        (dir, engine)
    }

    async fn seed_project(engine: &StorageEngine) -> (Project, Epic) {
        let project = engine
            .create_project(Project::new("demo", "/srv/demo"))
            .await
            .unwrap();
        let epic = engine
            .create_epic(Epic::new(&project.id, "auth"))
            .await
            .unwrap();
        (project, epic)
    }

    #[tokio::test]
    async fn create_get_roundtrip_deep_equal() {
        let (_dir, engine) = engine().await;
        let (project, epic) = seed_project(&engine).await;

        let task = AtomicTask::new(&project.id, &epic.id, "add model", TaskType::Development);
        let created = engine.create_task(task).await.unwrap();
        let fetched = engine.get_task(&created.id).await.unwrap();
        assert_eq!(created, fetched);
    }

    #[tokio::test]
    async fn duplicate_create_is_already_exists() {
        let (_dir, engine) = engine().await;
        let project = Project::new("demo", "/srv/demo");
        engine.create_project(project.clone()).await.unwrap();
        let err = engine.create_project(project).await.unwrap_err();
        assert!(matches!(err, LoomError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_then_exists_is_false() {
        let (_dir, engine) = engine().await;
        let (project, epic) = seed_project(&engine).await;
        let task = engine
            .create_task(AtomicTask::new(&project.id, &epic.id, "t", TaskType::Docs))
            .await
            .unwrap();

        engine.delete_task(&task.id).await.unwrap();
        assert!(!engine.task_exists(&task.id).await.unwrap());

        let epic = engine.get_epic(&epic.id).await.unwrap();
        assert!(!epic.task_ids.contains(&task.id));
    }

    #[tokio::test]
    async fn cache_matches_store_after_update() {
        let (_dir, engine) = engine().await;
        let (project, epic) = seed_project(&engine).await;
        let mut task = engine
            .create_task(AtomicTask::new(&project.id, &epic.id, "t", TaskType::Testing))
            .await
            .unwrap();

        task.status = TaskStatus::InProgress;
        let updated = engine.update_task(task).await.unwrap();

        // Cached read and on-disk read agree.
        let cached = engine.get_task(&updated.id).await.unwrap();
        let disk: AtomicTask = engine.files.read(&updated.id).await.unwrap().unwrap();
        assert_eq!(cached, disk);
        assert_eq!(cached.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn each_mutation_emits_exactly_one_event() {
        let (_dir, engine) = engine().await;
        let mut rx = engine.subscribe();

        let project = engine
            .create_project(Project::new("demo", "/srv/demo"))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity, EntityKind::Project);
        assert_eq!(event.op, StorageOp::Created);
        assert_eq!(event.id, project.id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_advances_updated_at() {
        let (_dir, engine) = engine().await;
        let (project, _) = seed_project(&engine).await;
        let before = engine.get_project(&project.id).await.unwrap().updated_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let updated = engine.update_project(project).await.unwrap();
        assert!(updated.updated_at > before);
    }

    #[tokio::test]
    async fn dependency_maintains_mirrors_and_rejects_cycles() {
        let (_dir, engine) = engine().await;
        let (project, epic) = seed_project(&engine).await;
        let a = engine
            .create_task(AtomicTask::new(&project.id, &epic.id, "a", TaskType::Development))
            .await
            .unwrap();
        let b = engine
            .create_task(AtomicTask::new(&project.id, &epic.id, "b", TaskType::Development))
            .await
            .unwrap();

        engine
            .create_dependency(Dependency::new(&project.id, &a.id, &b.id, DependencyKind::TaskOrder))
            .await
            .unwrap();

        let a = engine.get_task(&a.id).await.unwrap();
        let b = engine.get_task(&b.id).await.unwrap();
        assert!(a.dependents.contains(&b.id));
        assert!(b.depends_on.contains(&a.id));

        let err = engine
            .create_dependency(Dependency::new(&project.id, &b.id, &a.id, DependencyKind::TaskOrder))
            .await
            .unwrap_err();
        assert!(matches!(err, LoomError::Validation(_)));
    }

    #[tokio::test]
    async fn cascade_delete_removes_everything() {
        let (_dir, engine) = engine().await;
        let (project, epic) = seed_project(&engine).await;
        let a = engine
            .create_task(AtomicTask::new(&project.id, &epic.id, "a", TaskType::Development))
            .await
            .unwrap();
        let b = engine
            .create_task(AtomicTask::new(&project.id, &epic.id, "b", TaskType::Testing))
            .await
            .unwrap();
        engine
            .create_dependency(Dependency::new(&project.id, &a.id, &b.id, DependencyKind::TaskOrder))
            .await
            .unwrap();

        engine.delete_project_cascade(&project.id).await.unwrap();

        assert!(!engine.project_exists(&project.id).await.unwrap());
        assert!(!engine.task_exists(&a.id).await.unwrap());
        assert!(!engine.task_exists(&b.id).await.unwrap());
        assert!(engine
            .list_dependencies_by_project(&project.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn query_filters_compose() {
        let (_dir, engine) = engine().await;
        let (project, epic) = seed_project(&engine).await;
        engine
            .create_task(AtomicTask::new(&project.id, &epic.id, "dev", TaskType::Development))
            .await
            .unwrap();
        engine
            .create_task(AtomicTask::new(&project.id, &epic.id, "test", TaskType::Testing))
            .await
            .unwrap();

        let filter = QueryFilter {
            project_id: Some(project.id.clone()),
            task_type: Some(TaskType::Testing),
            ..Default::default()
        };
        let hits = engine.query_tasks(&filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "test");
    }

    #[tokio::test]
    async fn rollback_restores_prior_state() {
        let (_dir, engine) = engine().await;
        let (project, _) = seed_project(&engine).await;

        let mut tx = engine.begin();
        tx.delete(EntityKind::Project, &project.id).await.unwrap();
        assert!(!engine.project_exists(&project.id).await.unwrap());
        tx.rollback().await;

        let restored = engine.get_project(&project.id).await.unwrap();
        assert_eq!(restored.name, "demo");
    }
}
