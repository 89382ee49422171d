use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use crate::core::field::{DefaultValue, FieldDefinition, WORKSPACE_FIELDS};
use crate::core::identity::{IdentityProvider, UserDirectory, UserId};
use crate::core::revision::Revision;
use crate::core::validate::{ValidationErrors, Validator};
use crate::core::workspace::{now_secs, RevisionId, Workspace, WorkspaceId, WorkspaceTypeId};
use crate::index::sequence::{Change, SequenceId, SequenceIndex, SequenceRecord};
use crate::query::matcher::Matcher;
use crate::stats::RegistryReport;
use crate::storage::checkpoint::Checkpoint;
use crate::storage::snapshot::SnapshotStore;
use crate::storage::wal::{WalEntry, WalStore};

pub const DEFAULT_WORKSPACE_LABEL: &str = "Live";
pub const DEFAULT_WORKSPACE_MACHINE_NAME: &str = "live";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error("workspace {0} not found")]
    NotFound(WorkspaceId),
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

/// 创建参数；未给出的字段由 schema 默认值回调填充
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewWorkspace {
    pub label: String,
    pub machine_name: String,
    #[serde(default, rename = "type")]
    pub workspace_type: Option<WorkspaceTypeId>,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub published: Option<bool>,
}

impl NewWorkspace {
    pub fn new(label: &str, machine_name: &str) -> Self {
        Self {
            label: label.to_string(),
            machine_name: machine_name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SaveOutcome {
    pub id: WorkspaceId,
    pub revision_id: RevisionId,
    pub is_new: bool,
}

#[derive(Default)]
struct State {
    workspaces: BTreeMap<WorkspaceId, Workspace>,
    revisions: BTreeMap<WorkspaceId, Vec<Revision>>,
    next_workspace_id: u64,
    next_revision_id: u64,
}

impl State {
    fn empty() -> Self {
        Self {
            next_workspace_id: 1,
            next_revision_id: 1,
            ..Self::default()
        }
    }

    /// 回放一次保存；revision 不新于已有记录时跳过（snapshot 与 WAL 重叠）
    fn apply_saved(&mut self, workspace: Workspace, revision: Revision) -> bool {
        let id = revision.workspace_id;
        let history = self.revisions.entry(id).or_default();
        if history
            .last()
            .is_some_and(|r| r.revision_id >= revision.revision_id)
        {
            return false;
        }
        self.next_workspace_id = self.next_workspace_id.max(id.0 + 1);
        self.next_revision_id = self.next_revision_id.max(revision.revision_id.0 + 1);
        history.push(revision);
        self.workspaces.insert(id, workspace);
        true
    }
}

/// workspace 的存储与生命周期：create -> (修改) -> save（校验 + 新 revision + WAL）。
///
/// 持久化分两层：
/// - WAL：每次 save / record_change 立即追加
/// - snapshot：周期性全量，写入后清理已 seal 的 WAL 段
pub struct WorkspaceRegistry {
    state: RwLock<State>,
    sequences: SequenceIndex,
    validator: Validator,
    wal: RwLock<Option<Arc<WalStore>>>,
    loaded_seal_id: AtomicU64,
    dirty: AtomicBool,
}

impl WorkspaceRegistry {
    pub fn new(default_workspace: WorkspaceId) -> anyhow::Result<Self> {
        Ok(Self {
            state: RwLock::new(State::empty()),
            sequences: SequenceIndex::new(),
            validator: Validator::new(default_workspace)?,
            wal: RwLock::new(None),
            loaded_seal_id: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    /// 保存时校验 owner 引用的用户存在
    pub fn with_users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.validator = self.validator.with_users(users);
        self
    }

    pub fn from_checkpoint(cp: Checkpoint, default_workspace: WorkspaceId) -> anyhow::Result<Self> {
        let reg = Self::new(default_workspace)?;
        {
            let mut st = reg.state.write();
            st.next_workspace_id = cp.next_workspace_id.max(1);
            st.next_revision_id = cp.next_revision_id.max(1);
            for ws in cp.workspaces {
                if let Some(id) = ws.id() {
                    st.workspaces.insert(id, ws);
                }
            }
            for rev in cp.revisions {
                st.revisions.entry(rev.workspace_id).or_default().push(rev);
            }
            for history in st.revisions.values_mut() {
                history.sort_by_key(|r| r.revision_id);
            }
        }
        reg.sequences.restore(cp.sequences);
        reg.loaded_seal_id.store(cp.wal_seal_id, Ordering::Relaxed);
        Ok(reg)
    }

    pub async fn load_or_empty(
        store: &SnapshotStore,
        default_workspace: WorkspaceId,
    ) -> anyhow::Result<Self> {
        match store.load_if_valid().await {
            Ok(Some(cp)) if cp.is_empty() => {
                tracing::info!("Snapshot holds no workspaces, starting with empty registry");
                Self::from_checkpoint(cp, default_workspace)
            }
            Ok(Some(cp)) => {
                tracing::info!(
                    "Loaded registry snapshot: {} workspaces, {} sequence records",
                    cp.workspaces.len(),
                    cp.sequences.len()
                );
                Self::from_checkpoint(cp, default_workspace)
            }
            Ok(None) => {
                tracing::info!("No valid snapshot, starting with empty registry");
                Self::new(default_workspace)
            }
            Err(e) => {
                tracing::warn!("Failed to load snapshot: {}, starting empty", e);
                Self::new(default_workspace)
            }
        }
    }

    /// 打开 WAL 并回放 snapshot 之后的变更
    pub fn attach_wal(&self, dir: PathBuf) -> anyhow::Result<()> {
        let wal = Arc::new(WalStore::open_in_dir(dir)?);
        let seal_id = self.loaded_seal_id.load(Ordering::Relaxed);
        match wal.replay_since_seal(seal_id) {
            Ok(r) => {
                let total = r.entries.len();
                let applied = self.apply_wal_entries(r.entries);
                if total > 0 {
                    tracing::info!(
                        "WAL replay in {:?}: {} entries ({} applied) from {} sealed segments",
                        wal.dir(),
                        total,
                        applied,
                        r.sealed_used
                    );
                }
                if r.truncated_tail_records > 0 {
                    tracing::warn!(
                        "WAL had {} torn tail record(s); sealing to start a clean segment",
                        r.truncated_tail_records
                    );
                    wal.seal()?;
                }
                if applied > 0 {
                    self.dirty.store(true, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::warn!("WAL replay failed, ignoring: {}", e);
            }
        }
        *self.wal.write() = Some(wal);
        Ok(())
    }

    fn apply_wal_entries(&self, entries: Vec<WalEntry>) -> usize {
        let mut applied = 0usize;
        let mut records = Vec::new();
        {
            let mut st = self.state.write();
            for e in entries {
                match e {
                    WalEntry::WorkspaceSaved {
                        workspace,
                        revision,
                    } => {
                        if st.apply_saved(workspace, revision) {
                            applied += 1;
                        }
                    }
                    WalEntry::Sequence(rec) => records.push(rec),
                }
            }
        }
        applied + self.sequences.restore(records)
    }

    fn wal(&self) -> Option<Arc<WalStore>> {
        self.wal.read().clone()
    }

    pub fn sequences(&self) -> &SequenceIndex {
        &self.sequences
    }

    pub fn default_workspace(&self) -> WorkspaceId {
        self.validator.default_workspace()
    }

    /// 构造未保存的 workspace，按 schema 跑默认值回调
    pub fn create(&self, values: NewWorkspace, identity: &dyn IdentityProvider) -> Workspace {
        let mut ws = Workspace::new(
            values.workspace_type.clone().unwrap_or_default(),
            &values.label,
            &values.machine_name,
        );
        for def in WORKSPACE_FIELDS {
            apply_default(&mut ws, def, &values, identity);
        }
        ws
    }

    /// 校验并持久化：分配 id（首次）与新 revision_id，刷新 changed，写 WAL。
    /// 成功后 `ws` 被更新为已保存的状态。
    pub fn save(&self, ws: &mut Workspace) -> Result<SaveOutcome, RegistryError> {
        self.save_inner(ws, None)
    }

    fn save_inner(
        &self,
        ws: &mut Workspace,
        forced_id: Option<WorkspaceId>,
    ) -> Result<SaveOutcome, RegistryError> {
        let mut st = self.state.write();

        let original = match ws.id() {
            Some(id) => Some(
                st.workspaces
                    .get(&id)
                    .cloned()
                    .ok_or(RegistryError::NotFound(id))?,
            ),
            None => None,
        };
        let is_new = original.is_none();

        let mut next = ws.clone();
        let id = match (next.id(), forced_id) {
            (Some(id), _) => id,
            (None, Some(id)) => id,
            (None, None) => WorkspaceId(st.next_workspace_id),
        };
        // 先定 id 再校验：新建即为默认 workspace 时也要受 unpublish 约束
        next.id = Some(id);
        next.changed = now_secs();
        self.validator.validate(&next, original.as_ref())?;

        let revision_id = RevisionId(st.next_revision_id);
        next.revision_id = Some(revision_id);
        let revision = Revision::capture(&next)
            .ok_or_else(|| anyhow::anyhow!("workspace {} has no revision after save", id))?;

        if let Some(wal) = self.wal() {
            wal.append(&[WalEntry::WorkspaceSaved {
                workspace: next.clone(),
                revision: revision.clone(),
            }])?;
        }

        st.next_revision_id += 1;
        st.next_workspace_id = st.next_workspace_id.max(id.0 + 1);
        st.revisions.entry(id).or_default().push(revision);
        st.workspaces.insert(id, next.clone());
        drop(st);

        self.dirty.store(true, Ordering::Relaxed);
        if is_new {
            tracing::info!(
                "Workspace created: id={} machine_name={:?}",
                id,
                next.machine_name()
            );
        } else {
            tracing::debug!("Workspace {} saved as revision {}", id, revision_id.0);
        }

        *ws = next;
        Ok(SaveOutcome {
            id,
            revision_id,
            is_new,
        })
    }

    /// 配置的默认 workspace 不存在时以该 id 创建 "live"
    pub fn ensure_default_workspace(
        &self,
        identity: &dyn IdentityProvider,
    ) -> Result<Workspace, RegistryError> {
        let id = self.default_workspace();
        if let Some(ws) = self.load(id) {
            return Ok(ws);
        }
        let mut ws = self.create(
            NewWorkspace::new(DEFAULT_WORKSPACE_LABEL, DEFAULT_WORKSPACE_MACHINE_NAME),
            identity,
        );
        self.save_inner(&mut ws, Some(id))?;
        tracing::info!("Bootstrapped default workspace {}", id);
        Ok(ws)
    }

    pub fn load(&self, id: WorkspaceId) -> Option<Workspace> {
        self.state.read().workspaces.get(&id).cloned()
    }

    /// machine name 不要求唯一；多个同名时取 id 最小者
    pub fn load_by_machine_name(&self, machine_name: &str) -> Option<Workspace> {
        self.state
            .read()
            .workspaces
            .values()
            .find(|w| w.machine_name() == machine_name)
            .cloned()
    }

    pub fn list(&self) -> Vec<Workspace> {
        self.state.read().workspaces.values().cloned().collect()
    }

    pub fn list_matching(&self, matcher: &dyn Matcher) -> Vec<Workspace> {
        let st = self.state.read();
        st.workspaces
            .values()
            .filter(|w| match matcher.prefix() {
                Some(p) => w.machine_name().starts_with(p),
                None => true,
            })
            .filter(|w| matcher.matches(w.machine_name()))
            .cloned()
            .collect()
    }

    pub fn revisions(&self, id: WorkspaceId) -> Result<Vec<Revision>, RegistryError> {
        let st = self.state.read();
        if !st.workspaces.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        Ok(st.revisions.get(&id).cloned().unwrap_or_default())
    }

    /// 在 workspace 的更新序列上追加一次变更（先写 WAL 再可见）
    pub fn record_change(
        &self,
        id: WorkspaceId,
        change: Change,
    ) -> Result<SequenceRecord, RegistryError> {
        if !self.state.read().workspaces.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        let wal = self.wal();
        let rec = self.sequences.record_with(id, change, |rec| match &wal {
            Some(wal) => wal.append(&[WalEntry::Sequence(rec.clone())]),
            None => Ok(()),
        })?;
        self.dirty.store(true, Ordering::Relaxed);
        tracing::debug!("Workspace {} seq -> {}", id, rec.seq);
        Ok(rec)
    }

    pub fn update_seq(&self, id: WorkspaceId) -> Result<SequenceId, RegistryError> {
        let ws = self.load(id).ok_or(RegistryError::NotFound(id))?;
        Ok(ws.update_seq(&self.sequences))
    }

    pub fn changes(
        &self,
        id: WorkspaceId,
        since: SequenceId,
        limit: Option<usize>,
    ) -> Result<Vec<SequenceRecord>, RegistryError> {
        if !self.state.read().workspaces.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        Ok(self.sequences.workspace(id).range(since, limit))
    }

    fn checkpoint(&self, wal_seal_id: u64) -> Checkpoint {
        let st = self.state.read();
        Checkpoint {
            workspaces: st.workspaces.values().cloned().collect(),
            revisions: st.revisions.values().flatten().cloned().collect(),
            sequences: self.sequences.all_records(),
            next_workspace_id: st.next_workspace_id,
            next_revision_id: st.next_revision_id,
            wal_seal_id,
        }
    }

    /// seal WAL -> 写 snapshot -> 删除已被 snapshot 覆盖的 sealed 段。
    /// seal 与取状态之间的写入会同时出现在 snapshot 与新段里，回放按 revision/seq 去重。
    pub async fn snapshot_now(&self, store: &SnapshotStore) -> anyhow::Result<()> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            tracing::debug!("No registry changes, skipping snapshot");
            return Ok(());
        }

        let wal = self.wal();
        let seal_id = match &wal {
            Some(w) => match w.seal() {
                Ok(id) => id,
                Err(e) => {
                    self.dirty.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            },
            None => 0,
        };

        let cp = self.checkpoint(seal_id);
        if let Err(e) = store.write_atomic(&cp).await {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        self.loaded_seal_id.store(seal_id, Ordering::Relaxed);

        if let Some(w) = wal {
            if let Err(e) = w.cleanup_sealed_up_to(seal_id) {
                tracing::warn!("WAL cleanup failed after snapshot: {}", e);
            }
        }
        Ok(())
    }

    pub async fn snapshot_loop(self: Arc<Self>, store: Arc<SnapshotStore>, interval_secs: u64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        // 第一次 tick 立即返回
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.snapshot_now(&store).await {
                tracing::error!("Snapshot failed: {}", e);
            }
        }
    }

    pub fn report(&self) -> RegistryReport {
        let st = self.state.read();
        RegistryReport {
            workspace_count: st.workspaces.len(),
            published_count: st.workspaces.values().filter(|w| w.is_published()).count(),
            revision_count: st.revisions.values().map(Vec::len).sum(),
            default_workspace: self.default_workspace().0,
            sequence_streams: self.sequences.stream_count(),
            sequence_records: self.sequences.record_count(),
            wal_appended: self.wal().map(|w| w.appended()).unwrap_or(0),
            process_rss_bytes: RegistryReport::read_process_rss(),
        }
    }
}

fn apply_default(
    ws: &mut Workspace,
    def: &FieldDefinition,
    values: &NewWorkspace,
    identity: &dyn IdentityProvider,
) {
    match (def.name, def.default) {
        ("uid", DefaultValue::CurrentUser) => {
            ws.owner_id = values
                .owner_id
                .or_else(|| Workspace::current_user_id(identity).into_iter().next());
        }
        ("created", DefaultValue::RequestTime) => {
            ws.set_created_time(values.created.unwrap_or_else(now_secs));
        }
        ("published", DefaultValue::Bool(b)) => {
            ws.set_published(values.published.unwrap_or(b));
        }
        // uuid 在 Workspace::new 中生成
        _ => {}
    }
}
