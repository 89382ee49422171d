use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::revision::Revision;
use crate::core::workspace::Workspace;
use crate::index::sequence::SequenceRecord;

const WAL_MAGIC: u32 = 0x5351_5357; // "WSQS"
const WAL_VERSION: u32 = 1;
const WAL_FILE: &str = "registry.wal";
const SEAL_PREFIX: &str = "registry.wal.seal-";

fn now_seal_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// 记录校验：xxh3-64 取低 32 位，只用于发现截断/随机翻转
fn record_checksum(data: &[u8]) -> u32 {
    xxhash_rust::xxh3::xxh3_64(data) as u32
}

/// registry 的全部持久化变更
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    WorkspaceSaved {
        workspace: Workspace,
        revision: Revision,
    },
    Sequence(SequenceRecord),
}

#[derive(Clone, Debug)]
pub struct WalReplayResult {
    pub entries: Vec<WalEntry>,
    pub sealed_used: usize,
    pub truncated_tail_records: usize,
}

/// Append-only registry 日志（WAL）。
///
/// - current: registry.wal
/// - sealed: registry.wal.seal-<id>（snapshot 边界切分）
pub struct WalStore {
    dir: PathBuf,
    current: PathBuf,
    file: Mutex<File>,
    last_seal: AtomicU64,
    appended: AtomicU64,
}

impl WalStore {
    pub fn open_in_dir(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let current = dir.join(WAL_FILE);
        let f = open_or_init(&current)?;
        // 时钟回拨时新 seal id 也必须大于已有段
        let last_seal = max_seal_id(&dir)?;
        Ok(Self {
            dir,
            current,
            file: Mutex::new(f),
            last_seal: AtomicU64::new(last_seal),
            appended: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 本进程内累计追加条数
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn append(&self, entries: &[WalEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut frames = Vec::new();
        for e in entries {
            let payload = bincode::serialize(e)?;
            let len: u32 = payload
                .len()
                .try_into()
                .map_err(|_| anyhow::anyhow!("WAL record too large: {} bytes", payload.len()))?;
            frames.extend_from_slice(&len.to_le_bytes());
            frames.extend_from_slice(&record_checksum(&payload).to_le_bytes());
            frames.extend_from_slice(&payload);
        }

        let mut f = self.file.lock();
        f.write_all(&frames)?;
        f.flush()?;
        f.sync_data()?;
        self.appended
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// seal：把当前 WAL rename 成 sealed 文件，并创建新的空 WAL。
    /// 返回 seal_id（写入 snapshot，作为回放起点）。
    pub fn seal(&self) -> anyhow::Result<u64> {
        let mut f = self.file.lock();
        f.flush()?;

        // 同一纳秒内两次 seal 也要保证 id 递增
        let prev = self.last_seal.load(Ordering::Relaxed);
        let id = now_seal_id().max(prev + 1);
        self.last_seal.store(id, Ordering::Relaxed);

        let sealed = self.dir.join(format!("{SEAL_PREFIX}{id:016x}"));
        if self.current.exists() {
            std::fs::rename(&self.current, &sealed)?;
        }

        // 持锁替换句柄：seal 期间的 append 不会写进已 rename 的文件
        *f = open_or_init(&self.current)?;
        Ok(id)
    }

    pub fn cleanup_sealed_up_to(&self, seal_id: u64) -> anyhow::Result<()> {
        if seal_id == 0 {
            return Ok(());
        }
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if let Some(id) = parse_seal_id(&p) {
                if id <= seal_id {
                    if let Err(e) = std::fs::remove_file(&p) {
                        tracing::warn!("Failed to remove sealed WAL {:?}: {}", p, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// 回放：只读取 seal_id > checkpoint 的 sealed WAL + 当前 WAL。
    pub fn replay_since_seal(&self, checkpoint_seal_id: u64) -> anyhow::Result<WalReplayResult> {
        let mut sealed = Vec::new();
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if let Some(id) = parse_seal_id(&p) {
                if id > checkpoint_seal_id {
                    sealed.push((id, p));
                }
            }
        }
        sealed.sort_by_key(|(id, _)| *id);

        let mut entries = Vec::new();
        let mut truncated = 0usize;
        for (_, p) in sealed.iter() {
            let (mut evs, t) = read_wal_file(p)?;
            truncated += t;
            entries.append(&mut evs);
        }
        let _guard = self.file.lock();
        let (mut cur, t) = read_wal_file(&self.current)?;
        truncated += t;
        entries.append(&mut cur);

        Ok(WalReplayResult {
            entries,
            sealed_used: sealed.len(),
            truncated_tail_records: truncated,
        })
    }
}

fn write_header(f: &mut File) -> anyhow::Result<()> {
    f.write_all(&WAL_MAGIC.to_le_bytes())?;
    f.write_all(&WAL_VERSION.to_le_bytes())?;
    f.flush()?;
    Ok(())
}

fn reopen_truncated(path: &Path) -> anyhow::Result<File> {
    let mut nf = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    write_header(&mut nf)?;
    drop(nf);
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?)
}

fn open_or_init(path: &Path) -> anyhow::Result<File> {
    let exists = path.exists();
    let mut f = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    if !exists {
        write_header(&mut f)?;
        return Ok(f);
    }

    // 快速校验 header；空文件/截断/不兼容都重建
    let mut hdr = [0u8; 8];
    f.seek(SeekFrom::Start(0))?;
    if f.read_exact(&mut hdr).is_err() {
        return reopen_truncated(path);
    }

    let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
    let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        tracing::warn!(
            "WAL header mismatch at {:?} (magic={:#x}, version={}), starting fresh",
            path,
            magic,
            ver
        );
        return reopen_truncated(path);
    }

    Ok(f)
}

fn parse_seal_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix(SEAL_PREFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

fn max_seal_id(dir: &Path) -> anyhow::Result<u64> {
    let mut max = 0u64;
    for ent in std::fs::read_dir(dir)? {
        let Ok(ent) = ent else { continue };
        if let Some(id) = parse_seal_id(&ent.path()) {
            max = max.max(id);
        }
    }
    Ok(max)
}

fn read_wal_file(path: &Path) -> anyhow::Result<(Vec<WalEntry>, usize)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let mut f = File::open(path)?;

    let mut hdr = [0u8; 8];
    if f.read_exact(&mut hdr).is_err() {
        return Ok((Vec::new(), 0));
    }
    let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
    let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        return Ok((Vec::new(), 0));
    }

    let mut out = Vec::new();
    let mut truncated_tail = 0usize;
    loop {
        let mut lb = [0u8; 8];
        if f.read_exact(&mut lb).is_err() {
            break;
        }
        let len = u32::from_le_bytes(lb[0..4].try_into()?) as usize;
        let crc = u32::from_le_bytes(lb[4..8].try_into()?);
        let mut buf = vec![0u8; len];
        if f.read_exact(&mut buf).is_err() {
            truncated_tail += 1;
            break;
        }
        if record_checksum(&buf) != crc {
            // 校验失败：视为截断/损坏，停止读取（保守）。
            truncated_tail += 1;
            break;
        }
        match bincode::deserialize::<WalEntry>(&buf) {
            Ok(e) => out.push(e),
            Err(e) => {
                tracing::warn!("WAL record decode failed in {:?}: {}", path, e);
                truncated_tail += 1;
                break;
            }
        }
    }
    Ok((out, truncated_tail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workspace::WorkspaceId;
    use crate::index::sequence::Change;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("ws-seq-wal-{}-{}", tag, nanos))
    }

    fn seq_entry(seq: u64) -> WalEntry {
        WalEntry::Sequence(SequenceRecord {
            seq,
            workspace: WorkspaceId(1),
            timestamp: 0,
            change: Change {
                entity_type_id: "node".to_string(),
                entity_id: seq,
                entity_uuid: uuid::Uuid::new_v4(),
                revision_id: seq,
                rev: String::new(),
                deleted: false,
            },
        })
    }

    #[test]
    fn wal_append_seal_replay_respects_checkpoint() {
        let dir = unique_tmp_dir("basic");
        let wal = WalStore::open_in_dir(dir.clone()).unwrap();

        wal.append(&[seq_entry(1)]).unwrap();
        let seal1 = wal.seal().unwrap();
        wal.append(&[seq_entry(2)]).unwrap();

        // checkpoint=0：回放 sealed+current
        let r = wal.replay_since_seal(0).unwrap();
        assert_eq!(seqs(&r.entries), vec![1, 2]);
        assert_eq!(r.sealed_used, 1);

        // checkpoint=seal1：只回放 current
        let r2 = wal.replay_since_seal(seal1).unwrap();
        assert_eq!(seqs(&r2.entries), vec![2]);

        wal.cleanup_sealed_up_to(seal1).unwrap();
        assert_eq!(wal.replay_since_seal(0).unwrap().entries.len(), 1);
        assert_eq!(wal.appended(), 2);
    }

    fn seqs(entries: &[WalEntry]) -> Vec<u64> {
        entries
            .iter()
            .filter_map(|e| match e {
                WalEntry::Sequence(r) => Some(r.seq),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn seal_ids_stay_above_existing_segments() {
        let dir = unique_tmp_dir("clock");
        let future = now_seal_id() + 1_000_000_000_000_000;
        {
            let wal = WalStore::open_in_dir(dir.clone()).unwrap();
            wal.append(&[seq_entry(1)]).unwrap();
            let id = wal.seal().unwrap();
            // 模拟时钟回拨：已有段的 id 比当前时间大
            std::fs::rename(
                dir.join(format!("{SEAL_PREFIX}{id:016x}")),
                dir.join(format!("{SEAL_PREFIX}{future:016x}")),
            )
            .unwrap();
        }

        let wal = WalStore::open_in_dir(dir).unwrap();
        wal.append(&[seq_entry(2)]).unwrap();
        let next = wal.seal().unwrap();
        assert!(next > future);

        // 以旧段为 checkpoint 时，新段仍会被回放
        let r = wal.replay_since_seal(future).unwrap();
        assert_eq!(seqs(&r.entries), vec![2]);
    }

    #[test]
    fn torn_tail_is_dropped_and_counted() {
        let dir = unique_tmp_dir("torn");
        {
            let wal = WalStore::open_in_dir(dir.clone()).unwrap();
            wal.append(&[seq_entry(1), seq_entry(2)]).unwrap();
        }
        // 模拟崩溃：最后一条记录写了一半
        let path = dir.join(WAL_FILE);
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 5).unwrap();

        let wal = WalStore::open_in_dir(dir).unwrap();
        let r = wal.replay_since_seal(0).unwrap();
        assert_eq!(r.entries.len(), 1);
        assert_eq!(r.truncated_tail_records, 1);
    }

    #[test]
    fn foreign_header_is_reset() {
        let dir = unique_tmp_dir("header");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(WAL_FILE), b"garbage-garbage").unwrap();

        let wal = WalStore::open_in_dir(dir).unwrap();
        assert!(wal.replay_since_seal(0).unwrap().entries.is_empty());
        wal.append(&[seq_entry(1)]).unwrap();
        assert_eq!(wal.replay_since_seal(0).unwrap().entries.len(), 1);
    }
}
