use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::workspace::{now_secs, WorkspaceId};

pub type SequenceId = u64;

/// 单个 workspace 的序列视图
pub trait SequenceHandle {
    /// 最后分配的 sequence id；没有任何记录时为 0
    fn last_sequence_id(&self) -> SequenceId;
}

/// sequence 索引服务（按 workspace 划分）
pub trait SequenceService: Send + Sync {
    fn use_workspace(&self, workspace: WorkspaceId) -> Box<dyn SequenceHandle + '_>;
}

/// 一次内容变更（由写入方提交）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub entity_type_id: String,
    pub entity_id: u64,
    pub entity_uuid: Uuid,
    pub revision_id: u64,
    /// 修订标识，如 "3-9f1c..."
    #[serde(default)]
    pub rev: String,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub seq: SequenceId,
    pub workspace: WorkspaceId,
    pub timestamp: i64,
    pub change: Change,
}

#[derive(Default)]
struct Stream {
    records: Mutex<Vec<SequenceRecord>>,
    // 无锁读；只在持有 records 锁时写
    last: AtomicU64,
}

/// 每个 workspace 一条单调递增的更新序列。
///
/// - 分配 seq 与追加记录在同一把 stream 锁内完成：并发写者之间既不重复也不留空洞。
/// - 不同 workspace 的 stream 互不影响（DashMap 分片）。
#[derive(Default)]
pub struct SequenceIndex {
    streams: DashMap<WorkspaceId, Arc<Stream>>,
}

pub struct WorkspaceSequence<'a> {
    index: &'a SequenceIndex,
    workspace: WorkspaceId,
}

impl SequenceHandle for WorkspaceSequence<'_> {
    fn last_sequence_id(&self) -> SequenceId {
        self.index.last_sequence_id(self.workspace)
    }
}

impl WorkspaceSequence<'_> {
    pub fn range(&self, since: SequenceId, limit: Option<usize>) -> Vec<SequenceRecord> {
        self.index.range(self.workspace, since, limit)
    }
}

impl SequenceService for SequenceIndex {
    fn use_workspace(&self, workspace: WorkspaceId) -> Box<dyn SequenceHandle + '_> {
        Box::new(self.workspace(workspace))
    }
}

impl SequenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workspace(&self, workspace: WorkspaceId) -> WorkspaceSequence<'_> {
        WorkspaceSequence {
            index: self,
            workspace,
        }
    }

    fn stream(&self, workspace: WorkspaceId) -> Arc<Stream> {
        self.streams.entry(workspace).or_default().clone()
    }

    pub fn last_sequence_id(&self, workspace: WorkspaceId) -> SequenceId {
        self.streams
            .get(&workspace)
            .map(|s| s.last.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// 分配下一个 seq 并追加。`persist` 在记录对读者可见之前调用（WAL 落盘）；
    /// 失败则本次分配作废，seq 不前进。
    pub fn record_with<F>(
        &self,
        workspace: WorkspaceId,
        change: Change,
        persist: F,
    ) -> anyhow::Result<SequenceRecord>
    where
        F: FnOnce(&SequenceRecord) -> anyhow::Result<()>,
    {
        let stream = self.stream(workspace);
        let mut records = stream.records.lock();
        let seq = stream.last.load(Ordering::Acquire) + 1;
        let rec = SequenceRecord {
            seq,
            workspace,
            timestamp: now_secs(),
            change,
        };
        persist(&rec)?;
        records.push(rec.clone());
        stream.last.store(seq, Ordering::Release);
        Ok(rec)
    }

    /// `seq > since` 的记录，按 seq 升序
    pub fn range(
        &self,
        workspace: WorkspaceId,
        since: SequenceId,
        limit: Option<usize>,
    ) -> Vec<SequenceRecord> {
        let Some(stream) = self.streams.get(&workspace).map(|s| s.clone()) else {
            return Vec::new();
        };
        let records = stream.records.lock();
        let start = records.partition_point(|r| r.seq <= since);
        let tail = &records[start..];
        let take = limit.unwrap_or(tail.len()).min(tail.len());
        tail[..take].to_vec()
    }

    /// 从 snapshot / WAL 回放恢复。seq 不大于当前 last 的记录视为重复，忽略。
    /// 返回实际应用的条数。
    pub fn restore<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = SequenceRecord>,
    {
        let mut applied = 0usize;
        for rec in records {
            let stream = self.stream(rec.workspace);
            let mut guard = stream.records.lock();
            let last = stream.last.load(Ordering::Acquire);
            if rec.seq <= last {
                continue;
            }
            if rec.seq != last + 1 {
                tracing::warn!(
                    "Sequence gap in workspace {}: {} -> {}",
                    rec.workspace,
                    last,
                    rec.seq
                );
            }
            let seq = rec.seq;
            guard.push(rec);
            stream.last.store(seq, Ordering::Release);
            applied += 1;
        }
        applied
    }

    pub fn all_records(&self) -> Vec<SequenceRecord> {
        let mut out = Vec::new();
        for s in self.streams.iter() {
            out.extend(s.value().records.lock().iter().cloned());
        }
        out.sort_by_key(|r| (r.workspace, r.seq));
        out
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn record_count(&self) -> usize {
        self.streams.iter().map(|s| s.value().records.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl SequenceIndex {
        fn record(&self, workspace: WorkspaceId, change: Change) -> SequenceRecord {
            self.record_with(workspace, change, |_| Ok(())).unwrap()
        }
    }

    fn change(entity_id: u64) -> Change {
        Change {
            entity_type_id: "node".to_string(),
            entity_id,
            entity_uuid: Uuid::new_v4(),
            revision_id: entity_id,
            rev: format!("1-{entity_id:x}"),
            deleted: false,
        }
    }

    #[test]
    fn empty_workspace_reports_zero() {
        let idx = SequenceIndex::new();
        assert_eq!(idx.use_workspace(WorkspaceId(9)).last_sequence_id(), 0);
        assert!(idx.range(WorkspaceId(9), 0, None).is_empty());
    }

    #[test]
    fn sequences_are_per_workspace_and_monotonic() {
        let idx = SequenceIndex::new();
        let a = WorkspaceId(1);
        let b = WorkspaceId(2);
        assert_eq!(idx.record(a, change(1)).seq, 1);
        assert_eq!(idx.record(a, change(2)).seq, 2);
        assert_eq!(idx.record(b, change(3)).seq, 1);
        assert_eq!(idx.record(a, change(4)).seq, 3);

        assert_eq!(idx.use_workspace(a).last_sequence_id(), 3);
        assert_eq!(idx.use_workspace(b).last_sequence_id(), 1);
        assert_eq!(idx.stream_count(), 2);
        assert_eq!(idx.record_count(), 4);
    }

    #[test]
    fn range_respects_since_and_limit() {
        let idx = SequenceIndex::new();
        let ws = WorkspaceId(1);
        for i in 0..10 {
            idx.record(ws, change(i));
        }
        let r = idx.workspace(ws).range(4, Some(3));
        assert_eq!(r.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![5, 6, 7]);
        assert_eq!(idx.range(ws, 10, None).len(), 0);
        assert_eq!(idx.range(ws, 0, None).len(), 10);
    }

    #[test]
    fn failed_persist_does_not_advance() {
        let idx = SequenceIndex::new();
        let ws = WorkspaceId(1);
        idx.record(ws, change(1));
        let r = idx.record_with(ws, change(2), |_| Err(anyhow::anyhow!("disk full")));
        assert!(r.is_err());
        assert_eq!(idx.last_sequence_id(ws), 1);
        assert_eq!(idx.record(ws, change(3)).seq, 2);
    }

    #[test]
    fn concurrent_writers_get_unique_gapless_ids() {
        let idx = Arc::new(SequenceIndex::new());
        let ws = WorkspaceId(1);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let idx = idx.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|i| idx.record(ws, change(t * 1000 + i)).seq)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=2000).collect::<Vec<_>>());
        assert_eq!(idx.last_sequence_id(ws), 2000);
    }

    #[test]
    fn restore_skips_duplicates() {
        let src = SequenceIndex::new();
        let ws = WorkspaceId(3);
        for i in 0..5 {
            src.record(ws, change(i));
        }
        let records = src.all_records();

        let dst = SequenceIndex::new();
        assert_eq!(dst.restore(records[..3].to_vec()), 3);
        // 与 WAL 重叠的部分只应用一次
        assert_eq!(dst.restore(records.clone()), 2);
        assert_eq!(dst.last_sequence_id(ws), 5);
        assert_eq!(dst.all_records(), records);
    }
}
