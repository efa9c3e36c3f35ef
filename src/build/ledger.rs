use std::path::{Path, PathBuf};

/// 构建期中间文件台账。
///
/// - 每个中间文件（raw / chunk / merged / staged）创建时登记
/// - 消费完毕后经 `remove` 删除；只有删除成功才注销
/// - `promote` 把文件改名为最终产物并注销（不再由台账负责）
/// - Drop 时无条件清空剩余登记项：成功路径与失败路径都不会遗留中间文件
pub struct CleanupLedger {
    paths: Vec<PathBuf>,
    keep: bool,
    removed: usize,
}

impl CleanupLedger {
    pub fn new(keep: bool) -> Self {
        Self {
            paths: Vec::new(),
            keep,
            removed: 0,
        }
    }

    pub fn register(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn pending(&self) -> &[PathBuf] {
        &self.paths
    }

    /// 已成功删除的中间文件数
    pub fn removed(&self) -> usize {
        self.removed
    }

    pub fn remove(&mut self, path: &Path) -> std::io::Result<()> {
        if self.keep {
            tracing::debug!("Keeping intermediate {}", path.display());
            self.deregister(path);
            return Ok(());
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tracing::debug!("Deleted {}", path.display());
        self.removed += 1;
        self.deregister(path);
        Ok(())
    }

    /// 改名为最终产物；目标已存在时被原子替换
    pub fn promote(&mut self, from: &Path, to: &Path) -> std::io::Result<()> {
        std::fs::rename(from, to)?;
        self.deregister(from);
        Ok(())
    }

    /// 尽力删除全部剩余登记项，返回本次删除数
    pub fn drain(&mut self) -> usize {
        let pending = std::mem::take(&mut self.paths);
        let mut n = 0usize;
        for p in pending {
            if self.keep {
                tracing::info!("Keeping intermediate {}", p.display());
                continue;
            }
            match std::fs::remove_file(&p) {
                Ok(()) => {
                    tracing::debug!("Deleted {}", p.display());
                    n += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to delete intermediate {}: {}", p.display(), e);
                }
            }
        }
        self.removed += n;
        n
    }

    fn deregister(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }
}

impl Drop for CleanupLedger {
    fn drop(&mut self) {
        if !self.paths.is_empty() {
            let n = self.drain();
            tracing::debug!("Cleanup ledger drained on drop: {} files", n);
        }
    }
}
