pub mod catalog;
pub mod resolver;

pub use catalog::{split_row, MetadataJoin, Product, ProductTable, SoftwareReference};
pub use resolver::{RecordResolver, Resolved};

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::core::{HashRecord, KeySpace};
use crate::error::{QueryError, ResolveError};
use crate::index::{IndexStore, SortCheck};
use crate::storage::manifest::{BuildManifest, CatalogStamp, ManifestStore};

/// 十六进制摘要 → (键空间, 原始字节)；族由解码后长度推断
pub fn parse_digest(input: &str) -> Result<(KeySpace, Vec<u8>), QueryError> {
    let hex_str = input.trim();
    let invalid = |reason: String| QueryError::InvalidDigest {
        input: hex_str.to_string(),
        reason,
    };
    let bytes = hex::decode(hex_str).map_err(|e| invalid(e.to_string()))?;
    let space = KeySpace::from_digest_len(bytes.len()).ok_or_else(|| {
        invalid(format!(
            "expected 40 (sha1) or 32 (md5) hex digits, got {}",
            hex_str.len()
        ))
    })?;
    Ok((space, bytes))
}

/// 单个摘要的查询结果
#[derive(Debug)]
pub enum Lookup {
    Miss,
    Hits(Vec<Result<SoftwareReference, ResolveError>>),
    Invalid(String),
    /// 读索引失败；只影响这一个摘要
    Failed(String),
}

#[derive(Debug)]
pub struct QueryOutcome {
    /// 用户输入（已去除首尾空白）
    pub digest: String,
    pub lookup: Lookup,
}

impl QueryOutcome {
    pub fn is_miss(&self) -> bool {
        matches!(self.lookup, Lookup::Miss)
    }

    pub fn hits(&self) -> &[Result<SoftwareReference, ResolveError>] {
        match &self.lookup {
            Lookup::Hits(h) => h,
            _ => &[],
        }
    }
}

/// 单个键空间的复验结果
#[derive(Clone, Copy, Debug)]
pub struct IndexCheck {
    pub space: KeySpace,
    pub sort: SortCheck,
    /// manifest 记录的条数（无 manifest 时为 None）
    pub expected_records: Option<u64>,
}

impl IndexCheck {
    pub fn is_ok(&self) -> bool {
        self.sort.is_sorted() && self.expected_records.map_or(true, |n| n == self.sort.records)
    }
}

/// 查询引擎：两个 IndexStore + 目录回查 + 产品表
pub struct HashQuery {
    sha1: IndexStore,
    md5: IndexStore,
    resolver: RecordResolver,
    products: ProductTable,
    manifest: Option<BuildManifest>,
    catalog_changed: bool,
}

impl HashQuery {
    pub fn open(dataset: &Path, config: &Config) -> Result<Self, QueryError> {
        let index_dir = config.build.index_dir(dataset);
        let use_mmap = config.query.use_mmap;
        let sha1 = IndexStore::open(KeySpace::Sha1, &KeySpace::Sha1.index_path(&index_dir), use_mmap)?;
        let md5 = IndexStore::open(KeySpace::Md5, &KeySpace::Md5.index_path(&index_dir), use_mmap)?;

        let catalog = config.build.catalog_path(dataset);
        let manifest = match ManifestStore::in_dir(&index_dir).load_if_valid() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Ignoring unreadable build manifest: {}", e);
                None
            }
        };
        let catalog_changed = match (&manifest, CatalogStamp::of(&catalog)) {
            (Some(m), Ok(now)) => m.stamp() != now,
            _ => false,
        };
        if catalog_changed {
            tracing::warn!(
                "{} changed since the index was built; results may be stale (re-run init)",
                catalog.display()
            );
        }

        let products = ProductTable::load_or_empty(&dataset.join(&config.query.product_file));

        Ok(Self {
            sha1,
            md5,
            resolver: RecordResolver::new(catalog),
            products,
            manifest,
            catalog_changed,
        })
    }

    pub fn store(&self, space: KeySpace) -> &IndexStore {
        match space {
            KeySpace::Sha1 => &self.sha1,
            KeySpace::Md5 => &self.md5,
        }
    }

    pub fn catalog(&self) -> PathBuf {
        self.resolver.catalog().to_path_buf()
    }

    pub fn manifest(&self) -> Option<&BuildManifest> {
        self.manifest.as_ref()
    }

    pub fn catalog_changed(&self) -> bool {
        self.catalog_changed
    }

    /// 单摘要模式：返回完整的重复运行
    pub fn lookup(&self, input: &str) -> Result<QueryOutcome, QueryError> {
        let digest = input.trim().to_string();
        let (space, key) = match parse_digest(&digest) {
            Ok(v) => v,
            Err(e) => {
                return Ok(QueryOutcome {
                    digest,
                    lookup: Lookup::Invalid(e.to_string()),
                })
            }
        };

        let run = self.store(space).range_match(&key)?;
        if run.is_empty() {
            return Ok(QueryOutcome {
                digest,
                lookup: Lookup::Miss,
            });
        }
        let hits = self
            .resolver
            .resolve(run, &self.products)
            .into_iter()
            .map(|r| r.result)
            .collect();
        Ok(QueryOutcome {
            digest,
            lookup: Lookup::Hits(hits),
        })
    }

    /// 批量模式：每行一个摘要，精确匹配；全部命中一次性按 offset 回查，结果保持输入顺序。
    ///
    /// 任何一行的失败（无效摘要、读索引出错、回查出错）都只记在该行的结果里。
    pub fn lookup_batch<I, S>(&self, lines: I) -> Vec<QueryOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outcomes = Vec::new();
        let mut pending: Vec<(usize, HashRecord)> = Vec::new();

        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('%') {
                continue;
            }
            let idx = outcomes.len();
            let lookup = match parse_digest(line) {
                Err(e) => Lookup::Invalid(e.to_string()),
                Ok((space, key)) => match self.store(space).exact_match(&key) {
                    Ok(Some(rec)) => {
                        pending.push((idx, rec));
                        Lookup::Hits(Vec::with_capacity(1))
                    }
                    Ok(None) => Lookup::Miss,
                    Err(e) => {
                        tracing::warn!("Failed to search {} index for {}: {}", space, line, e);
                        Lookup::Failed(e.to_string())
                    }
                },
            };
            outcomes.push(QueryOutcome {
                digest: line.to_string(),
                lookup,
            });
        }

        let (lines_of, records): (Vec<usize>, Vec<HashRecord>) = pending.into_iter().unzip();
        for r in self.resolver.resolve(records, &self.products) {
            if let Lookup::Hits(hits) = &mut outcomes[lines_of[r.slot]].lookup {
                hits.push(r.result);
            }
        }

        tracing::debug!("Batch resolved {} digests", outcomes.len());
        outcomes
    }

    /// 顺序复验两个索引的排序，并与 manifest 的记录数比对
    pub fn check(&self) -> std::io::Result<Vec<IndexCheck>> {
        [&self.sha1, &self.md5]
            .into_iter()
            .map(|store| {
                let space = store.key_space();
                let sort = store.verify_sorted()?;
                Ok(IndexCheck {
                    space,
                    sort,
                    expected_records: self.manifest.as_ref().and_then(|m| m.records_for(space)),
                })
            })
            .collect()
    }
}
