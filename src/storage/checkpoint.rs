use serde::{Deserialize, Serialize};

use crate::core::revision::Revision;
use crate::core::workspace::Workspace;
use crate::index::sequence::SequenceRecord;

/// registry 全量状态（snapshot body）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workspaces: Vec<Workspace>,
    pub revisions: Vec<Revision>,
    pub sequences: Vec<SequenceRecord>,
    pub next_workspace_id: u64,
    pub next_revision_id: u64,
    /// 生成该 checkpoint 时 seal 的 WAL id；回放只读更新的段
    pub wal_seal_id: u64,
}

impl Checkpoint {
    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty() && self.sequences.is_empty()
    }
}
