use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::fs;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::storage::checkpoint::Checkpoint;

/// 快照文件 Header
const MAGIC: u32 = 0x5753_0001;
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8; // magic + version + state + data_len + xxh3

/// 原子快照存储（atomic replacement）
///
/// 落盘流程：
/// 1) 写 registry.db.tmp 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into(file)` 流式写 body，边写边算 xxh3 / data_len
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)（POSIX 原子替换）
/// 6) fsync(dir)
///
/// 任一步骤前崩溃，target 保持旧快照；加载时 magic/version/state/len/checksum 任一不符都拒绝。
pub struct SnapshotStore {
    path: PathBuf,
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<W: Write> Write for ChecksumWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn encode_header(state: u32, data_len: u32, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    header[8..12].copy_from_slice(&state.to_le_bytes());
    header[12..16].copy_from_slice(&data_len.to_le_bytes());
    header[16..24].copy_from_slice(&checksum.to_le_bytes());
    header
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载快照（校验 magic/version/state/checksum）；无效返回 None
    pub async fn load_if_valid(&self) -> anyhow::Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path).await?;
        if data.len() < HEADER_SIZE {
            tracing::warn!("Snapshot too small, ignoring");
            return Ok(None);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into()?);
        let version = u32::from_le_bytes(data[4..8].try_into()?);
        let state = u32::from_le_bytes(data[8..12].try_into()?);
        let data_len = u32::from_le_bytes(data[12..16].try_into()?) as usize;
        let stored_checksum = u64::from_le_bytes(data[16..24].try_into()?);

        if magic != MAGIC {
            tracing::warn!("Snapshot magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return Ok(None);
        }
        if version != VERSION_CURRENT {
            tracing::warn!(
                "Snapshot version mismatch: {} != {}",
                version,
                VERSION_CURRENT
            );
            return Ok(None);
        }
        if state != STATE_COMMITTED {
            tracing::warn!("Snapshot state INCOMPLETE, ignoring");
            return Ok(None);
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            tracing::warn!("Snapshot data length mismatch");
            return Ok(None);
        }

        let computed = xxh3_64(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Snapshot checksum mismatch: {:#x} != {:#x}",
                computed,
                stored_checksum
            );
            return Ok(None);
        }

        match bincode::deserialize::<Checkpoint>(body) {
            Ok(cp) => Ok(Some(cp)),
            Err(e) => {
                tracing::warn!("Snapshot deserialize failed: {}", e);
                Ok(None)
            }
        }
    }

    /// 原子写入快照
    pub async fn write_atomic(&self, cp: &Checkpoint) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("db.tmp");

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&encode_header(STATE_INCOMPLETE, 0, 0))?;

        let (data_len_u64, checksum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, cp)?;
            cw.finish()
        };

        let data_len: u32 = data_len_u64
            .try_into()
            .map_err(|_| anyhow::anyhow!("Snapshot too large (>{} bytes)", u32::MAX))?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(STATE_COMMITTED, data_len, checksum))?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::info!(
            "Snapshot written: {} workspaces, {} sequence records, {} bytes",
            cp.workspaces.len(),
            cp.sequences.len(),
            HEADER_SIZE + data_len as usize
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workspace::{Workspace, WorkspaceTypeId};

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("ws-seq-snap-{}-{}", tag, nanos))
    }

    fn sample() -> Checkpoint {
        Checkpoint {
            workspaces: vec![Workspace::new(WorkspaceTypeId::default(), "Live", "live")],
            next_workspace_id: 2,
            next_revision_id: 2,
            wal_seal_id: 42,
            ..Checkpoint::default()
        }
    }

    #[tokio::test]
    async fn write_then_load() {
        let dir = unique_tmp_dir("ok");
        let store = SnapshotStore::new(dir.join("registry.db"));
        assert!(store.load_if_valid().await.unwrap().is_none());

        let cp = sample();
        store.write_atomic(&cp).await.unwrap();
        assert_eq!(store.load_if_valid().await.unwrap(), Some(cp));
        assert!(!dir.join("registry.db.tmp").exists());
    }

    #[tokio::test]
    async fn corrupted_body_is_rejected() {
        let dir = unique_tmp_dir("corrupt");
        let store = SnapshotStore::new(dir.join("registry.db"));
        store.write_atomic(&sample()).await.unwrap();

        let mut bytes = std::fs::read(store.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(store.path(), &bytes).unwrap();

        assert!(store.load_if_valid().await.unwrap().is_none());
    }
}
