use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::core::field::FieldValue;
use crate::core::identity::{IdentityProvider, User, UserDirectory, UserId};
use crate::index::sequence::{SequenceId, SequenceService};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub u64);

/// workspace 分类（bundle），创建后只读
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceTypeId(pub String);

impl Default for WorkspaceTypeId {
    fn default() -> Self {
        Self("basic".to_string())
    }
}

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 时间戳整数化：浮点向零截断。
pub trait AsTimestamp {
    fn as_timestamp(&self) -> i64;
}

impl AsTimestamp for i64 {
    fn as_timestamp(&self) -> i64 {
        *self
    }
}

impl AsTimestamp for i32 {
    fn as_timestamp(&self) -> i64 {
        *self as i64
    }
}

impl AsTimestamp for u32 {
    fn as_timestamp(&self) -> i64 {
        *self as i64
    }
}

impl AsTimestamp for u64 {
    fn as_timestamp(&self) -> i64 {
        i64::try_from(*self).unwrap_or(i64::MAX)
    }
}

impl AsTimestamp for f64 {
    fn as_timestamp(&self) -> i64 {
        // `as` 对 NaN 给 0，越界饱和
        self.trunc() as i64
    }
}

impl AsTimestamp for std::time::SystemTime {
    fn as_timestamp(&self) -> i64 {
        use std::time::UNIX_EPOCH;
        match self.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        }
    }
}

pub fn now_secs() -> i64 {
    std::time::SystemTime::now().as_timestamp()
}

/// 一个隔离的变更追踪域。
///
/// 字段修改只落在内存副本上，`WorkspaceRegistry::save` 时统一校验并产生新 revision。
/// `id` / `revision_id` 在首次保存前为 None。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub(crate) id: Option<WorkspaceId>,
    pub(crate) revision_id: Option<RevisionId>,
    pub(crate) workspace_type: WorkspaceTypeId,
    pub(crate) uuid: Uuid,
    pub(crate) label: String,
    pub(crate) machine_name: String,
    pub(crate) owner_id: Option<UserId>,
    pub(crate) created: i64,
    pub(crate) changed: i64,
    pub(crate) published: bool,
}

impl Workspace {
    /// 最小构造：不跑默认值回调（owner/created 由 registry 的 create 填充）
    pub fn new(workspace_type: WorkspaceTypeId, label: &str, machine_name: &str) -> Self {
        Self {
            id: None,
            revision_id: None,
            workspace_type,
            uuid: Uuid::new_v4(),
            label: label.nfc().collect(),
            machine_name: machine_name.to_string(),
            owner_id: None,
            created: 0,
            changed: 0,
            published: true,
        }
    }

    pub fn id(&self) -> Option<WorkspaceId> {
        self.id
    }

    pub fn revision_id(&self) -> Option<RevisionId> {
        self.revision_id
    }

    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn workspace_type(&self) -> &WorkspaceTypeId {
        &self.workspace_type
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: &str) -> &mut Self {
        self.label = label.nfc().collect();
        self
    }

    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    pub fn set_machine_name(&mut self, machine_name: &str) -> &mut Self {
        self.machine_name = machine_name.to_string();
        self
    }

    /// 该 workspace 更新序列的最后一个 sequence id（完全委托给 sequence 服务）。
    /// 未保存的 workspace 还没有 id，不可能有记录，返回 0。
    pub fn update_seq(&self, sequences: &dyn SequenceService) -> SequenceId {
        match self.id {
            Some(id) => sequences.use_workspace(id).last_sequence_id(),
            None => 0,
        }
    }

    pub fn set_created_time<T: AsTimestamp>(&mut self, created: T) -> &mut Self {
        self.created = created.as_timestamp();
        self
    }

    pub fn start_time(&self) -> i64 {
        self.created
    }

    pub fn changed_time(&self) -> i64 {
        self.changed
    }

    pub fn owner(&self, users: &dyn UserDirectory) -> Option<User> {
        users.load_user(self.owner_id?)
    }

    pub fn set_owner(&mut self, account: &User) -> &mut Self {
        self.owner_id = Some(account.id);
        self
    }

    pub fn owner_id(&self) -> Option<UserId> {
        self.owner_id
    }

    pub fn set_owner_id(&mut self, uid: UserId) -> &mut Self {
        self.owner_id = Some(uid);
        self
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    pub fn set_published(&mut self, published: bool) -> &mut Self {
        self.published = published;
        self
    }

    pub fn set_unpublished(&mut self) -> &mut Self {
        self.set_published(false)
    }

    /// `default_workspace` 来自进程配置（注入，不读全局）
    pub fn is_default_workspace(&self, default_workspace: WorkspaceId) -> bool {
        self.id == Some(default_workspace)
    }

    /// `uid` 字段的默认值回调：字段系统约定返回单元素集合
    pub fn current_user_id(identity: &dyn IdentityProvider) -> Vec<UserId> {
        vec![identity.current_user_id()]
    }

    /// 按 schema 字段名取值（供 validator 通用遍历）
    pub fn field(&self, name: &str) -> FieldValue {
        match name {
            "id" => FieldValue::Integer(self.id.map(|v| v.0 as i64)),
            "revision_id" => FieldValue::Integer(self.revision_id.map(|v| v.0 as i64)),
            "type" => FieldValue::Reference(Some(self.workspace_type.0.clone())),
            "uuid" => FieldValue::String(self.uuid.to_string()),
            "label" => FieldValue::String(self.label.clone()),
            "machine_name" => FieldValue::String(self.machine_name.clone()),
            "uid" => FieldValue::Reference(self.owner_id.map(|u| u.0.to_string())),
            "created" => FieldValue::Integer(Some(self.created)),
            "changed" => FieldValue::Integer(Some(self.changed)),
            "published" => FieldValue::Boolean(self.published),
            _ => FieldValue::Missing,
        }
    }
}
