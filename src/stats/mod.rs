use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::KeySpace;

/// 单个键空间的构建统计
#[derive(Clone, Debug)]
pub struct SpaceReport {
    pub space: KeySpace,
    /// raw 流字节数
    pub raw_bytes: u64,
    /// 初始有序块数
    pub chunks: usize,
    /// 两两归并次数（= chunks - 1）
    pub merges: usize,
    /// 归并层数 ⌈log2 chunks⌉
    pub merge_levels: u32,
    /// 最终索引记录数
    pub records: u64,
    /// 最终索引字节数
    pub index_bytes: u64,
}

/// 一次完整构建的报告
#[derive(Clone, Debug)]
pub struct BuildReport {
    pub index_dir: PathBuf,
    /// 数据行数（不含 header / 空行）
    pub rows: u64,
    pub blank_rows: u64,
    pub catalog_bytes: u64,
    pub spaces: Vec<SpaceReport>,
    /// 已删除的中间文件数
    pub intermediates_removed: usize,
    pub elapsed: Duration,
}

impl BuildReport {
    pub fn space(&self, space: KeySpace) -> Option<&SpaceReport> {
        self.spaces.iter().find(|s| s.space == space)
    }
}

pub fn human_bytes(bytes: u64) -> String {
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

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           nsrl-index Build Report                ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Catalog rows:   {:>14}                   ║", self.rows)?;
        writeln!(f, "║ Blank rows:     {:>14}                   ║", self.blank_rows)?;
        writeln!(
            f,
            "║ Catalog size:   {:>14}                   ║",
            human_bytes(self.catalog_bytes)
        )?;
        for s in &self.spaces {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ {:<6}                                           ║", s.space.name())?;
            writeln!(
                f,
                "║   raw stream:   {:>14}                   ║",
                human_bytes(s.raw_bytes)
            )?;
            writeln!(f, "║   chunks:       {:>14}                   ║", s.chunks)?;
            writeln!(
                f,
                "║   merges:       {:>6} ({:>2} levels)              ║",
                s.merges, s.merge_levels
            )?;
            writeln!(f, "║   records:      {:>14}                   ║", s.records)?;
            writeln!(
                f,
                "║   index size:   {:>14}                   ║",
                human_bytes(s.index_bytes)
            )?;
        }
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║ Intermediates removed: {:>7}                   ║",
            self.intermediates_removed
        )?;
        writeln!(
            f,
            "║ Elapsed:        {:>12.2?}                     ║",
            self.elapsed
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        writeln!(f, "Index directory: {}", self.index_dir.display())?;
        Ok(())
    }
}
