use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use crate::core::{HashRecord, KeySpace};
use crate::error::QueryError;
use crate::index::source::{FileSource, RecordSource};
use crate::storage::mmap::MmapSource;

/// 线性扫描时每次读取的记录数
const SCAN_BLOCK_RECORDS: usize = 256;

/// 顺序校验结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortCheck {
    pub records: u64,
    /// 第一个 key 小于前一条的位置
    pub first_violation: Option<u64>,
}

impl SortCheck {
    pub fn is_sorted(&self) -> bool {
        self.first_violation.is_none()
    }
}

/// 只读 IndexFile 视图：把文件当作 `U = len / record_len` 个定长记录的随机访问数组。
///
/// 信任（不复验）文件已按 key 升序排列；需要复验时调用 `verify_sorted`。
pub struct IndexStore {
    space: KeySpace,
    path: PathBuf,
    count: u64,
    source: Box<dyn RecordSource>,
}

impl IndexStore {
    pub fn open(space: KeySpace, path: &Path, use_mmap: bool) -> Result<Self, QueryError> {
        if !path.exists() {
            return Err(QueryError::IndexMissing(path.to_path_buf()));
        }
        let len = std::fs::metadata(path)?.len();
        // 空文件无法 mmap；统一走 pread
        let source: Box<dyn RecordSource> = if use_mmap && len > 0 {
            Box::new(MmapSource::open(path)?)
        } else {
            Box::new(FileSource::open(path)?)
        };
        Self::from_source(space, path, source)
    }

    pub fn from_source(
        space: KeySpace,
        path: &Path,
        source: Box<dyn RecordSource>,
    ) -> Result<Self, QueryError> {
        let len = source.len();
        let record_len = space.record_len();
        if len % record_len as u64 != 0 {
            return Err(QueryError::Misaligned {
                path: path.to_path_buf(),
                len,
                record_len,
            });
        }
        tracing::debug!(
            "Opened {} index {} ({} records)",
            space,
            path.display(),
            len / record_len as u64
        );
        Ok(Self {
            space,
            path: path.to_path_buf(),
            count: len / record_len as u64,
            source,
        })
    }

    pub fn key_space(&self) -> KeySpace {
        self.space
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn record_at(&self, i: u64) -> std::io::Result<HashRecord> {
        let mut buf = vec![0u8; self.space.record_len()];
        self.read_record(i, &mut buf)?;
        HashRecord::from_bytes(self.space, &buf)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidData))
    }

    fn read_record(&self, i: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.source
            .read_exact_at(buf, i * self.space.record_len() as u64)
    }

    fn check_key(&self, key: &[u8]) -> std::io::Result<()> {
        if key.len() != self.space.key_len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "{} index expects {}-byte keys, got {}",
                    self.space,
                    self.space.key_len(),
                    key.len()
                ),
            ));
        }
        Ok(())
    }

    /// 首次命中式二分：返回重复运行中任意一条的下标
    fn probe(&self, key: &[u8], buf: &mut [u8]) -> std::io::Result<Option<u64>> {
        let key_len = self.space.key_len();
        let mut lo = 0u64;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.read_record(mid, buf)?;
            match buf[..key_len].cmp(key) {
                Ordering::Equal => return Ok(Some(mid)),
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// 精确匹配：命中即返回，不保证是重复运行中的第一条
    pub fn exact_match(&self, key: &[u8]) -> std::io::Result<Option<HashRecord>> {
        self.check_key(key)?;
        let mut buf = vec![0u8; self.space.record_len()];
        match self.probe(key, &mut buf)? {
            Some(_) => Ok(HashRecord::from_bytes(self.space, &buf)),
            None => Ok(None),
        }
    }

    /// 重复感知匹配：返回与 `key` 相等的完整连续运行。
    ///
    /// 1) 二分落到运行内任意位置
    /// 2) 以 1, 2, 4, 8… 的步长向前回退，直到到达 0 或探到不相等的记录（下限钳制为 0）
    /// 3) 从回退点顺序前扫，跳过回退过头的部分，收集全部相等记录直到不等或 EOF
    pub fn range_match(&self, key: &[u8]) -> std::io::Result<Vec<HashRecord>> {
        self.check_key(key)?;
        let key_len = self.space.key_len();
        let mut buf = vec![0u8; self.space.record_len()];
        let Some(hit) = self.probe(key, &mut buf)? else {
            return Ok(Vec::new());
        };

        let mut start = hit;
        let mut stride = 1u64;
        while start > 0 {
            start = start.saturating_sub(stride);
            self.read_record(start, &mut buf)?;
            if &buf[..key_len] != key {
                break;
            }
            stride = stride.saturating_mul(2);
        }

        self.collect_run(key, start)
    }

    fn collect_run(&self, key: &[u8], from: u64) -> std::io::Result<Vec<HashRecord>> {
        let rl = self.space.record_len();
        let key_len = self.space.key_len();
        let mut block = vec![0u8; SCAN_BLOCK_RECORDS * rl];
        let mut out = Vec::new();
        let mut in_run = false;
        let mut pos = from;

        while pos < self.count {
            let n = (self.count - pos).min(SCAN_BLOCK_RECORDS as u64) as usize;
            let bytes = &mut block[..n * rl];
            self.source.read_exact_at(bytes, pos * rl as u64)?;
            for rec in bytes.chunks_exact(rl) {
                if &rec[..key_len] == key {
                    in_run = true;
                    if let Some(r) = HashRecord::from_bytes(self.space, rec) {
                        out.push(r);
                    }
                } else if in_run {
                    return Ok(out);
                }
            }
            pos += n as u64;
        }
        Ok(out)
    }

    /// 顺序扫描复验 key 非递减
    pub fn verify_sorted(&self) -> std::io::Result<SortCheck> {
        let rl = self.space.record_len();
        let key_len = self.space.key_len();
        let mut block = vec![0u8; SCAN_BLOCK_RECORDS * rl];
        let mut prev: Option<Vec<u8>> = None;
        let mut pos = 0u64;

        while pos < self.count {
            let n = (self.count - pos).min(SCAN_BLOCK_RECORDS as u64) as usize;
            let bytes = &mut block[..n * rl];
            self.source.read_exact_at(bytes, pos * rl as u64)?;
            for (i, rec) in bytes.chunks_exact(rl).enumerate() {
                let key = &rec[..key_len];
                if let Some(p) = prev.as_deref() {
                    if key < p {
                        return Ok(SortCheck {
                            records: self.count,
                            first_violation: Some(pos + i as u64),
                        });
                    }
                }
                match prev.as_mut() {
                    Some(p) => p.copy_from_slice(key),
                    None => prev = Some(key.to_vec()),
                }
            }
            pos += n as u64;
        }

        Ok(SortCheck {
            records: self.count,
            first_violation: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::write_record;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("nsrl-index-store-{}-{}", tag, nanos))
    }

    /// 按给定顺序写 md5 索引；key 为 16 个相同字节
    fn write_index(path: &Path, keys: &[u8]) {
        let mut out = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            write_record(&mut out, &[*k; 16], i as i64 * 100).unwrap();
        }
        std::fs::write(path, out).unwrap();
    }

    fn open_both(path: &Path) -> Vec<IndexStore> {
        vec![
            IndexStore::open(KeySpace::Md5, path, false).unwrap(),
            IndexStore::open(KeySpace::Md5, path, true).unwrap(),
        ]
    }

    #[test]
    fn exact_match_hits_and_misses() {
        let dir = unique_tmp_dir("exact");
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join("md5.index");
        let keys: Vec<u8> = (0..50u8).map(|k| k * 2).collect();
        write_index(&p, &keys);

        for store in open_both(&p) {
            assert_eq!(store.len(), 50);
            for (i, k) in keys.iter().enumerate() {
                let r = store.exact_match(&[*k; 16]).unwrap().unwrap();
                assert_eq!(r.key, vec![*k; 16]);
                assert_eq!(r.offset, i as i64 * 100);
            }
            for k in [1u8, 51, 99, 200, 255] {
                assert!(store.exact_match(&[k; 16]).unwrap().is_none());
            }
        }
    }

    #[test]
    fn range_match_returns_whole_run() {
        let dir = unique_tmp_dir("range");
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join("md5.index");
        // 运行分别位于开头、中间（长）、结尾
        let mut keys = vec![1u8; 3];
        keys.extend([2, 3]);
        keys.extend(std::iter::repeat(5u8).take(1000));
        keys.extend([6, 7]);
        keys.extend(std::iter::repeat(9u8).take(4));
        write_index(&p, &keys);

        for store in open_both(&p) {
            for (k, expected) in [(1u8, 3usize), (2, 1), (5, 1000), (7, 1), (9, 4), (4, 0), (10, 0)] {
                let run = store.range_match(&[k; 16]).unwrap();
                assert_eq!(run.len(), expected, "key {k}");
                assert!(run.iter().all(|r| r.key == vec![k; 16]));
                // 连续且无遗漏：offset 恰好是一段连续下标
                let first = keys.iter().position(|x| *x == k);
                if let Some(first) = first {
                    assert_eq!(run[0].offset, first as i64 * 100);
                    assert_eq!(run[run.len() - 1].offset, (first + expected - 1) as i64 * 100);
                }
            }
        }
    }

    #[test]
    fn range_match_clamps_at_file_start() {
        let dir = unique_tmp_dir("clamp");
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join("md5.index");
        write_index(&p, &[3u8; 37]);

        let store = IndexStore::open(KeySpace::Md5, &p, false).unwrap();
        let run = store.range_match(&[3u8; 16]).unwrap();
        assert_eq!(run.len(), 37);
        assert_eq!(run[0].offset, 0);
    }

    #[test]
    fn empty_index_never_errors() {
        let dir = unique_tmp_dir("empty");
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join("md5.index");
        std::fs::write(&p, b"").unwrap();

        for store in open_both(&p) {
            assert!(store.is_empty());
            assert!(store.exact_match(&[0u8; 16]).unwrap().is_none());
            assert!(store.range_match(&[0u8; 16]).unwrap().is_empty());
            assert!(store.verify_sorted().unwrap().is_sorted());
        }
    }

    #[test]
    fn open_rejects_misaligned_and_missing() {
        let dir = unique_tmp_dir("misaligned");
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join("md5.index");
        std::fs::write(&p, vec![0u8; 25]).unwrap();
        assert!(matches!(
            IndexStore::open(KeySpace::Md5, &p, false),
            Err(QueryError::Misaligned { len: 25, .. })
        ));
        assert!(matches!(
            IndexStore::open(KeySpace::Md5, &dir.join("nope.index"), false),
            Err(QueryError::IndexMissing(_))
        ));
    }

    #[test]
    fn wrong_key_width_is_invalid_input() {
        let dir = unique_tmp_dir("width");
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join("md5.index");
        write_index(&p, &[1, 2]);
        let store = IndexStore::open(KeySpace::Md5, &p, false).unwrap();
        let err = store.exact_match(&[1u8; 20]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn verify_sorted_reports_first_violation() {
        let dir = unique_tmp_dir("verify");
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join("md5.index");
        let mut keys: Vec<u8> = (0..=255u8).collect();
        keys.extend(0..=255u8);
        keys.push(255);
        write_index(&p, &keys);

        let store = IndexStore::open(KeySpace::Md5, &p, false).unwrap();
        let check = store.verify_sorted().unwrap();
        assert_eq!(check.records, 513);
        assert_eq!(check.first_violation, Some(256));
    }
}
