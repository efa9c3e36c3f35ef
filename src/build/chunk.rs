use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::build::ledger::CleanupLedger;
use crate::core::{KeySpace, RecordOrder};
use crate::error::{BuildError, Stage};

/// 一个键空间的全部有序分块（按创建顺序）
#[derive(Clone, Debug)]
pub struct ChunkSet {
    pub space: KeySpace,
    pub chunks: Vec<PathBuf>,
    pub records: u64,
}

/// 有界内存分块排序：每次最多读入 `capacity` 条记录，原地排序后写成一个不可变 chunk。
///
/// 峰值内存 ≈ capacity × (record_len + 16)：记录缓冲 + 每条一个切片引用。
pub struct ChunkSorter {
    space: KeySpace,
    capacity: usize,
    order: RecordOrder,
}

impl ChunkSorter {
    pub fn new(space: KeySpace, capacity: usize, order: RecordOrder) -> Self {
        Self {
            space,
            capacity: capacity.max(1),
            order,
        }
    }

    /// 输入为空时仍产出一个空 chunk，保证归并树总有一个文件可提升为最终索引
    pub fn sort(
        &self,
        raw: &Path,
        out_dir: &Path,
        ledger: &mut CleanupLedger,
    ) -> Result<ChunkSet, BuildError> {
        let space = self.space;
        let rl = space.record_len();
        let io_err = |path: &Path, e: std::io::Error| BuildError::io(Stage::Sort, space, path, e);

        let mut input = File::open(raw).map_err(|e| io_err(raw, e))?;
        let len = input.metadata().map_err(|e| io_err(raw, e))?.len();
        if len % rl as u64 != 0 {
            return Err(BuildError::malformed(
                Stage::Sort,
                space,
                format!(
                    "{}: {} bytes is not a multiple of record size {} (partial trailing record)",
                    raw.display(),
                    len,
                    rl
                ),
            ));
        }

        let window = (self.capacity as u64)
            .saturating_mul(rl as u64)
            .min(len)
            .max(rl as u64) as usize;
        let mut buf = vec![0u8; window];
        let mut set = ChunkSet {
            space,
            chunks: Vec::new(),
            records: 0,
        };

        loop {
            let filled = read_full(&mut input, &mut buf).map_err(|e| io_err(raw, e))?;
            if filled == 0 {
                break;
            }
            if filled % rl != 0 {
                return Err(BuildError::malformed(
                    Stage::Sort,
                    space,
                    format!("{}: truncated record at end of stream", raw.display()),
                ));
            }

            let mut records: Vec<&[u8]> = buf[..filled].chunks_exact(rl).collect();
            let key_len = space.key_len();
            let order = self.order;
            records.sort_unstable_by(|a, b| order.compare(key_len, a, b));

            let path = space.chunk_path(out_dir, set.chunks.len());
            tracing::info!("Writing sorted chunk to {}", path.display());
            write_chunk(&path, &records, ledger).map_err(|e| io_err(&path, e))?;
            set.records += records.len() as u64;
            set.chunks.push(path);
        }

        if set.chunks.is_empty() {
            let path = space.chunk_path(out_dir, 0);
            tracing::info!("Writing empty chunk to {}", path.display());
            write_chunk(&path, &[], ledger).map_err(|e| io_err(&path, e))?;
            set.chunks.push(path);
        }

        tracing::debug!(
            "{}: {} records sorted into {} chunks",
            space,
            set.records,
            set.chunks.len()
        );
        Ok(set)
    }
}

fn write_chunk(path: &Path, records: &[&[u8]], ledger: &mut CleanupLedger) -> std::io::Result<()> {
    let f = File::create(path)?;
    ledger.register(path);
    let mut w = BufWriter::with_capacity(1 << 20, f);
    for r in records {
        w.write_all(r)?;
    }
    w.flush()
}

/// 尽量读满 `buf`；仅在 EOF 时返回不足长度
pub(crate) fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0usize;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{write_record, HashRecord};

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("nsrl-index-chunk-{}-{}", tag, nanos))
    }

    fn write_raw(path: &Path, recs: &[(u8, i64)]) {
        let mut out = Vec::new();
        for (k, off) in recs {
            write_record(&mut out, &[*k; 16], *off).unwrap();
        }
        std::fs::write(path, out).unwrap();
    }

    fn read_chunk(path: &Path) -> Vec<HashRecord> {
        std::fs::read(path)
            .unwrap()
            .chunks(KeySpace::Md5.record_len())
            .map(|r| HashRecord::from_bytes(KeySpace::Md5, r).unwrap())
            .collect()
    }

    #[test]
    fn splits_into_sorted_windows() {
        let dir = unique_tmp_dir("windows");
        std::fs::create_dir_all(&dir).unwrap();
        let raw = dir.join("md5raw.index");
        write_raw(&raw, &[(9, 0), (3, 1), (7, 2), (1, 3), (5, 4)]);

        let mut ledger = CleanupLedger::new(false);
        let set = ChunkSorter::new(KeySpace::Md5, 2, RecordOrder::KeyThenOffset)
            .sort(&raw, &dir, &mut ledger)
            .unwrap();

        assert_eq!(set.records, 5);
        assert_eq!(set.chunks.len(), 3);
        let first: Vec<u8> = read_chunk(&set.chunks[0]).iter().map(|r| r.key[0]).collect();
        assert_eq!(first, vec![3, 9]);
        let second: Vec<u8> = read_chunk(&set.chunks[1]).iter().map(|r| r.key[0]).collect();
        assert_eq!(second, vec![1, 7]);
        assert_eq!(read_chunk(&set.chunks[2])[0].offset, 4);
        for c in &set.chunks {
            assert!(ledger.is_registered(c));
        }
    }

    #[test]
    fn equal_keys_sort_by_offset() {
        let dir = unique_tmp_dir("ties");
        std::fs::create_dir_all(&dir).unwrap();
        let raw = dir.join("md5raw.index");
        write_raw(&raw, &[(4, 300), (4, 2), (4, 256)]);

        let mut ledger = CleanupLedger::new(false);
        let set = ChunkSorter::new(KeySpace::Md5, 10, RecordOrder::KeyThenOffset)
            .sort(&raw, &dir, &mut ledger)
            .unwrap();
        let offsets: Vec<i64> = read_chunk(&set.chunks[0]).iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 256, 300]);
    }

    #[test]
    fn empty_raw_yields_one_empty_chunk() {
        let dir = unique_tmp_dir("empty");
        std::fs::create_dir_all(&dir).unwrap();
        let raw = dir.join("md5raw.index");
        std::fs::write(&raw, b"").unwrap();

        let mut ledger = CleanupLedger::new(false);
        let set = ChunkSorter::new(KeySpace::Md5, 10, RecordOrder::KeyOnly)
            .sort(&raw, &dir, &mut ledger)
            .unwrap();
        assert_eq!(set.chunks.len(), 1);
        assert_eq!(std::fs::metadata(&set.chunks[0]).unwrap().len(), 0);
    }

    #[test]
    fn partial_trailing_record_is_rejected() {
        let dir = unique_tmp_dir("partial");
        std::fs::create_dir_all(&dir).unwrap();
        let raw = dir.join("md5raw.index");
        std::fs::write(&raw, vec![0u8; KeySpace::Md5.record_len() + 3]).unwrap();

        let mut ledger = CleanupLedger::new(false);
        let err = ChunkSorter::new(KeySpace::Md5, 10, RecordOrder::KeyOnly)
            .sort(&raw, &dir, &mut ledger)
            .unwrap_err();
        assert_eq!(err.stage(), Stage::Sort);
        assert!(matches!(err, BuildError::Malformed { .. }));
    }
}
