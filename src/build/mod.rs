pub mod chunk;
pub mod extract;
pub mod ledger;
pub mod merge;

pub use chunk::{ChunkSet, ChunkSorter};
pub use extract::{extract_catalog, ExtractStats, ExtractSummary, RawStream};
pub use ledger::CleanupLedger;
pub use merge::{MergeOutcome, MergeTree};

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::BuildConfig;
use crate::core::KeySpace;
use crate::error::{BuildError, Scope, Stage};
use crate::stats::{BuildReport, SpaceReport};
use crate::storage::manifest::{BuildManifest, CatalogStamp, ManifestStore, SpaceManifest};

/// 离线构建：Extractor → ChunkSorter → MergeTree → 发布两个 IndexFile。
///
/// 任一阶段失败都整体中止；`CleanupLedger` 在成功与失败路径上都会清空中间文件，
/// 且两个键空间全部完成前不会覆盖已发布的 `*.index`。
pub struct IndexBuilder {
    dataset: PathBuf,
    config: BuildConfig,
}

impl IndexBuilder {
    pub fn new(dataset: impl Into<PathBuf>, config: BuildConfig) -> Self {
        Self {
            dataset: dataset.into(),
            config,
        }
    }

    pub fn index_dir(&self) -> PathBuf {
        self.config.index_dir(&self.dataset)
    }

    pub fn run(&self) -> Result<BuildReport, BuildError> {
        let started = Instant::now();
        let catalog = self.config.catalog_path(&self.dataset);
        let out_dir = self.index_dir();
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| BuildError::io(Stage::Extract, Scope::All, &out_dir, e))?;

        let stamp = CatalogStamp::of(&catalog)
            .map_err(|e| BuildError::io(Stage::Extract, Scope::All, &catalog, e))?;

        let mut ledger = CleanupLedger::new(self.config.keep_intermediates);

        tracing::info!("Extracting digests from {}", catalog.display());
        let extracted = extract_catalog(&catalog, &out_dir, self.config.skip_header, &mut ledger)?;

        tracing::info!("Performing sort...");
        let mut staged: Vec<(KeySpace, PathBuf)> = Vec::with_capacity(extracted.streams.len());
        let mut spaces = Vec::with_capacity(extracted.streams.len());
        for stream in &extracted.streams {
            let (report, staged_path) = self.build_space(stream, &out_dir, &mut ledger)?;
            staged.push((stream.space, staged_path));
            spaces.push(report);
        }

        publish(&staged, &out_dir, &mut ledger)?;

        let manifest = BuildManifest {
            catalog_len: stamp.len,
            catalog_mtime_ns: stamp.mtime_ns,
            rows: extracted.stats.rows,
            spaces: spaces
                .iter()
                .map(|s| SpaceManifest {
                    space: s.space,
                    records: s.records,
                    bytes: s.index_bytes,
                })
                .collect(),
            chunk_capacity: self.config.chunk_capacity as u64,
            record_order: self.config.record_order,
            built_at_secs: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        if let Err(e) = ManifestStore::in_dir(&out_dir).write_atomic(&manifest) {
            tracing::warn!("Failed to write build manifest (index still usable): {}", e);
        }

        ledger.drain();

        Ok(BuildReport {
            index_dir: out_dir,
            rows: extracted.stats.rows,
            blank_rows: extracted.stats.blank_rows,
            catalog_bytes: extracted.stats.bytes,
            spaces,
            intermediates_removed: ledger.removed(),
            elapsed: started.elapsed(),
        })
    }

    /// 排序 + 归并一个键空间，并把结果显式提升为 staged 文件（无论是否发生过归并）
    fn build_space(
        &self,
        stream: &RawStream,
        out_dir: &Path,
        ledger: &mut CleanupLedger,
    ) -> Result<(SpaceReport, PathBuf), BuildError> {
        let space = stream.space;
        let raw_bytes = stream.records * space.record_len() as u64;

        tracing::info!("Creating sorted chunks for {}...", space);
        let set = ChunkSorter::new(space, self.config.chunk_capacity, self.config.record_order)
            .sort(&stream.path, out_dir, ledger)?;
        ledger
            .remove(&stream.path)
            .map_err(|e| BuildError::io(Stage::Sort, space, &stream.path, e))?;

        tracing::info!("Merging sorted chunks for {}...", space);
        let chunks = set.chunks.len();
        let outcome =
            MergeTree::new(space, self.config.record_order).merge(set.chunks, out_dir, ledger)?;

        if outcome.records != stream.records {
            return Err(BuildError::malformed(
                Stage::Merge,
                space,
                format!(
                    "record count mismatch: extracted {}, merged {}",
                    stream.records, outcome.records
                ),
            ));
        }

        let staged = space.staged_path(out_dir);
        ledger
            .promote(&outcome.path, &staged)
            .map_err(|e| BuildError::io(Stage::Merge, space, &staged, e))?;
        ledger.register(&staged);

        Ok((
            SpaceReport {
                space,
                raw_bytes,
                chunks,
                merges: outcome.merges,
                merge_levels: outcome.levels,
                records: outcome.records,
                index_bytes: outcome.bytes,
            },
            staged,
        ))
    }
}

/// 发布一组 staged 索引：要么全部替换，要么恢复到发布前的状态。
///
/// 1) 预检：已存在的目标必须是普通文件
/// 2) 删除旧清单（它描述的是旧索引对）
/// 3) 逐个把旧索引移到 `.previous`，再把 staged 改名为目标
/// 4) 任一 rename 失败：倒序回滚已处理的键空间后返回错误
/// 5) 全部成功：删除 `.previous`
fn publish(
    staged: &[(KeySpace, PathBuf)],
    out_dir: &Path,
    ledger: &mut CleanupLedger,
) -> Result<(), BuildError> {
    for (space, _) in staged {
        let target = space.index_path(out_dir);
        if let Ok(md) = std::fs::symlink_metadata(&target) {
            if !md.is_file() {
                return Err(BuildError::io(
                    Stage::Publish,
                    *space,
                    &target,
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "existing index is not a regular file",
                    ),
                ));
            }
        }
    }

    let manifest = ManifestStore::in_dir(out_dir);
    match std::fs::remove_file(manifest.path()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(BuildError::io(Stage::Publish, Scope::All, manifest.path(), e)),
    }

    // (目标, 旧索引暂存位置)
    let mut done: Vec<(PathBuf, Option<PathBuf>)> = Vec::with_capacity(staged.len());
    for (space, path) in staged {
        let target = space.index_path(out_dir);
        let previous = if target.exists() {
            let previous = space.previous_path(out_dir);
            if let Err(e) = std::fs::rename(&target, &previous) {
                rollback(&done);
                return Err(BuildError::io(Stage::Publish, *space, &target, e));
            }
            Some(previous)
        } else {
            None
        };
        done.push((target.clone(), previous));

        if let Err(e) = ledger.promote(path, &target) {
            rollback(&done);
            return Err(BuildError::io(Stage::Publish, *space, &target, e));
        }
        tracing::info!("Published {}", target.display());
    }

    for (_, previous) in done {
        if let Some(p) = previous {
            if let Err(e) = std::fs::remove_file(&p) {
                tracing::warn!("Failed to delete previous index {}: {}", p.display(), e);
            }
        }
    }
    Ok(())
}

fn rollback(done: &[(PathBuf, Option<PathBuf>)]) {
    for (target, previous) in done.iter().rev() {
        let restored = match previous {
            Some(p) => std::fs::rename(p, target),
            None => match std::fs::remove_file(target) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        match restored {
            Ok(()) => tracing::warn!("Rolled back {}", target.display()),
            Err(e) => tracing::warn!("Failed to roll back {}: {}", target.display(), e),
        }
    }
}
