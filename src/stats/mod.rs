use serde::Serialize;
use std::fmt;

/// registry 运行状态
#[derive(Clone, Debug, Default, Serialize)]
pub struct RegistryReport {
    pub workspace_count: usize,
    pub published_count: usize,
    /// 所有 workspace 的 revision 总数
    pub revision_count: usize,
    pub default_workspace: u64,
    /// 至少有一条记录的 sequence stream 数
    pub sequence_streams: usize,
    pub sequence_records: usize,
    /// 本进程启动以来 WAL 追加条数
    pub wal_appended: u64,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

impl RegistryReport {
    /// 从 /proc/self/statm 读取进程 RSS；非 Linux 返回 0
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm 格式: size resident shared text lib data dt (单位: 页)
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for RegistryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           ws-seq Registry Report                 ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║   workspaces:   {:>10}  (published {:>6})    ║",
            self.workspace_count, self.published_count
        )?;
        writeln!(
            f,
            "║   revisions:    {:>10}                       ║",
            self.revision_count
        )?;
        writeln!(
            f,
            "║   default:      {:>10}                       ║",
            self.default_workspace
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║   seq streams:  {:>10}                       ║",
            self.sequence_streams
        )?;
        writeln!(
            f,
            "║   seq records:  {:>10}                       ║",
            self.sequence_records
        )?;
        writeln!(
            f,
            "║   wal appends:  {:>10}                       ║",
            self.wal_appended
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
