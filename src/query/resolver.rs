use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::core::HashRecord;
use crate::error::ResolveError;
use crate::query::catalog::MetadataJoin;

/// 一条命中及其回查结果
pub struct Resolved<T> {
    /// 该命中在 `resolve` 输入序列中的下标
    pub slot: usize,
    pub record: HashRecord,
    pub result: Result<T, ResolveError>,
}

/// 按 offset 回查目录原始行并交给 `MetadataJoin`。
///
/// 命中先按 offset 升序排序，使对目录的访问只向前推进。
/// 单条失败只影响该条；目录本身打不开时每条命中各自带上 `ResolveError::Io`。
pub struct RecordResolver {
    catalog: PathBuf,
}

impl RecordResolver {
    pub fn new(catalog: impl Into<PathBuf>) -> Self {
        Self {
            catalog: catalog.into(),
        }
    }

    pub fn catalog(&self) -> &Path {
        &self.catalog
    }

    /// 返回结果按 offset 升序排列，`slot` 指回输入位置
    pub fn resolve<J: MetadataJoin>(
        &self,
        matches: Vec<HashRecord>,
        join: &J,
    ) -> Vec<Resolved<J::Output>> {
        let mut pending: Vec<(usize, HashRecord)> = matches.into_iter().enumerate().collect();
        if pending.is_empty() {
            return Vec::new();
        }
        pending.sort_by_key(|(_, r)| r.offset);

        let opened = File::open(&self.catalog).and_then(|f| {
            let len = f.metadata()?.len();
            Ok((BufReader::new(f), len))
        });
        let (mut reader, len) = match opened {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Cannot open catalog {}: {}", self.catalog.display(), e);
                return pending
                    .into_iter()
                    .map(|(slot, record)| {
                        let offset = record.offset;
                        Resolved {
                            slot,
                            record,
                            result: Err(ResolveError::Io {
                                offset,
                                source: std::io::Error::new(e.kind(), e.to_string()),
                            }),
                        }
                    })
                    .collect();
            }
        };

        let mut row = Vec::new();
        let mut out = Vec::with_capacity(pending.len());
        for (slot, record) in pending {
            let result = read_row(&mut reader, len, record.offset, &mut row)
                .and_then(|()| join.join(record.space, &record.key, record.offset, &row));
            if let Err(e) = &result {
                tracing::debug!("Failed to resolve {}: {}", record.key_hex(), e);
            }
            out.push(Resolved {
                slot,
                record,
                result,
            });
        }
        out
    }
}

fn read_row<R: BufRead + Seek>(
    reader: &mut R,
    catalog_len: u64,
    offset: i64,
    row: &mut Vec<u8>,
) -> Result<(), ResolveError> {
    let pos = u64::try_from(offset)
        .map_err(|_| ResolveError::stale(offset, "negative offset"))?;
    if pos >= catalog_len {
        return Err(ResolveError::stale(
            offset,
            format!("offset past end of catalog ({} bytes)", catalog_len),
        ));
    }
    let io = |source| ResolveError::Io { offset, source };
    reader.seek(SeekFrom::Start(pos)).map_err(io)?;
    row.clear();
    reader.read_until(b'\n', row).map_err(io)?;
    if row.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ResolveError::stale(offset, "empty row"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KeySpace;
    use crate::query::catalog::ProductTable;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("nsrl-index-resolver-{}-{}", tag, nanos))
    }

    fn row(sha1: &str, md5: &str, name: &str) -> String {
        format!("\"{sha1}\",\"{md5}\",\"00000000\",\"{name}\",10,1,\"358\",\"\"\n")
    }

    #[test]
    fn resolves_in_offset_order_and_reports_stale() {
        let dir = unique_tmp_dir("order");
        std::fs::create_dir_all(&dir).unwrap();
        let a = row(&"aa".repeat(20), &"11".repeat(16), "a.exe");
        let b = row(&"bb".repeat(20), &"22".repeat(16), "b.exe");
        let catalog = dir.join("NSRLFile.txt");
        std::fs::write(&catalog, format!("{a}{b}")).unwrap();

        let key_a = hex::decode("aa".repeat(20)).unwrap();
        let key_b = hex::decode("bb".repeat(20)).unwrap();
        let matches = vec![
            HashRecord::new(KeySpace::Sha1, key_b.clone(), a.len() as i64),
            HashRecord::new(KeySpace::Sha1, key_a.clone(), 0),
            HashRecord::new(KeySpace::Sha1, key_a.clone(), 1),
            HashRecord::new(KeySpace::Sha1, key_a.clone(), 10_000),
            HashRecord::new(KeySpace::Sha1, key_a, -3),
        ];

        let resolved = RecordResolver::new(&catalog).resolve(matches, &ProductTable::default());
        let offsets: Vec<i64> = resolved.iter().map(|r| r.record.offset).collect();
        assert_eq!(offsets, vec![-3, 0, 1, a.len() as i64, 10_000]);
        let slots: Vec<usize> = resolved.iter().map(|r| r.slot).collect();
        assert_eq!(slots, vec![4, 1, 2, 0, 3]);

        assert!(resolved[0].result.as_ref().unwrap_err().is_stale());
        assert_eq!(resolved[1].result.as_ref().unwrap().filename, "a.exe");
        // 落在行中间：解析失败或摘要不符
        assert!(resolved[2].result.as_ref().unwrap_err().is_stale());
        assert_eq!(resolved[3].result.as_ref().unwrap().filename, "b.exe");
        assert!(resolved[4].result.as_ref().unwrap_err().is_stale());
    }

    #[test]
    fn no_matches_never_opens_catalog() {
        let resolved = RecordResolver::new("/nonexistent/NSRLFile.txt")
            .resolve(Vec::new(), &ProductTable::default());
        assert!(resolved.is_empty());
    }

    #[test]
    fn unreadable_catalog_fails_each_match_separately() {
        let matches = vec![
            HashRecord::new(KeySpace::Md5, vec![2u8; 16], 90),
            HashRecord::new(KeySpace::Md5, vec![1u8; 16], 10),
        ];
        let resolved = RecordResolver::new("/nonexistent/NSRLFile.txt")
            .resolve(matches, &ProductTable::default());
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].slot, 1);
        assert_eq!(resolved[1].slot, 0);
        for r in &resolved {
            match &r.result {
                Err(ResolveError::Io { offset, source }) => {
                    assert_eq!(*offset, r.record.offset);
                    assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
                }
                other => panic!("expected io error, got {:?}", other.as_ref().err()),
            }
        }
    }
}
