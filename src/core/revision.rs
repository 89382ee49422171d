use serde::{Deserialize, Serialize};

use crate::core::identity::UserId;
use crate::core::workspace::{RevisionId, Workspace, WorkspaceId};

/// 一次保存产生的 revision：只记录 revisionable 字段
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub revision_id: RevisionId,
    pub workspace_id: WorkspaceId,
    pub label: String,
    pub machine_name: String,
    pub owner_id: Option<UserId>,
    pub changed: i64,
    pub published: bool,
}

impl Revision {
    /// 要求 workspace 已分配 id 与 revision_id
    pub fn capture(ws: &Workspace) -> Option<Self> {
        Some(Self {
            revision_id: ws.revision_id()?,
            workspace_id: ws.id()?,
            label: ws.label().to_string(),
            machine_name: ws.machine_name().to_string(),
            owner_id: ws.owner_id(),
            changed: ws.changed_time(),
            published: ws.is_published(),
        })
    }
}
