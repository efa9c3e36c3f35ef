use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::build::chunk::read_full;
use crate::build::ledger::CleanupLedger;
use crate::core::{KeySpace, RecordOrder};
use crate::error::{BuildError, Stage};

#[derive(Clone, Debug)]
pub struct MergeOutcome {
    /// 唯一剩下的有序文件；由调用方显式提升为最终索引
    pub path: PathBuf,
    pub merges: usize,
    pub levels: u32,
    pub records: u64,
    pub bytes: u64,
}

/// 二路归并树：队首取两个文件流式归并，结果追加到队尾，直到只剩一个。
///
/// N 个初始 chunk 需要 N-1 次两两归并、⌈log2 N⌉ 层；总 I/O 为 O(n · log2 N)。
pub struct MergeTree {
    space: KeySpace,
    order: RecordOrder,
}

impl MergeTree {
    pub fn new(space: KeySpace, order: RecordOrder) -> Self {
        Self { space, order }
    }

    pub fn levels_for(chunks: usize) -> u32 {
        if chunks <= 1 {
            0
        } else {
            usize::BITS - (chunks - 1).leading_zeros()
        }
    }

    pub fn merge(
        &self,
        chunks: Vec<PathBuf>,
        out_dir: &Path,
        ledger: &mut CleanupLedger,
    ) -> Result<MergeOutcome, BuildError> {
        let space = self.space;
        let levels = Self::levels_for(chunks.len());
        let mut queue: VecDeque<PathBuf> = chunks.into();
        let mut merges = 0usize;

        while queue.len() > 1 {
            let (Some(a), Some(b)) = (queue.pop_front(), queue.pop_front()) else {
                break;
            };
            let out = space.merged_path(out_dir, merges);
            tracing::info!(
                "Merging {} + {} -> {}",
                a.display(),
                b.display(),
                out.display()
            );
            ledger.register(&out);
            self.merge_pair(&a, &b, &out)?;

            for consumed in [&a, &b] {
                ledger
                    .remove(consumed)
                    .map_err(|e| BuildError::io(Stage::Merge, space, consumed, e))?;
            }
            queue.push_back(out);
            merges += 1;
        }

        let path = queue.pop_front().ok_or_else(|| {
            BuildError::malformed(Stage::Merge, space, "no sorted chunks to merge")
        })?;
        let bytes = std::fs::metadata(&path)
            .map_err(|e| BuildError::io(Stage::Merge, space, &path, e))?
            .len();

        Ok(MergeOutcome {
            path,
            merges,
            levels,
            records: bytes / space.record_len() as u64,
            bytes,
        })
    }

    /// 流式二路归并：较小者先写；相等时第一个输入先写；一侧耗尽后另一侧余量原样拷贝
    pub fn merge_pair(&self, a: &Path, b: &Path, out: &Path) -> Result<(), BuildError> {
        let space = self.space;
        let key_len = space.key_len();
        let write_err = |e| BuildError::io(Stage::Merge, space, out, e);

        let mut left = RecordReader::open(space, a)?;
        let mut right = RecordReader::open(space, b)?;
        let f = File::create(out).map_err(write_err)?;
        let mut w = BufWriter::with_capacity(1 << 20, f);

        let mut has_left = left.advance()?;
        let mut has_right = right.advance()?;
        while has_left && has_right {
            if self.order.compare(key_len, left.current(), right.current()).is_gt() {
                w.write_all(right.current()).map_err(write_err)?;
                has_right = right.advance()?;
            } else {
                w.write_all(left.current()).map_err(write_err)?;
                has_left = left.advance()?;
            }
        }

        if has_left {
            left.drain_into(&mut w, out)?;
        } else if has_right {
            right.drain_into(&mut w, out)?;
        }

        w.flush().map_err(write_err)?;
        Ok(())
    }
}

/// 顺序读取定长记录
struct RecordReader {
    space: KeySpace,
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
}

impl RecordReader {
    fn open(space: KeySpace, path: &Path) -> Result<Self, BuildError> {
        let f = File::open(path).map_err(|e| BuildError::io(Stage::Merge, space, path, e))?;
        Ok(Self {
            space,
            path: path.to_path_buf(),
            reader: BufReader::with_capacity(1 << 20, f),
            buf: vec![0u8; space.record_len()],
        })
    }

    fn current(&self) -> &[u8] {
        &self.buf
    }

    fn advance(&mut self) -> Result<bool, BuildError> {
        let n = read_full(&mut self.reader, &mut self.buf)
            .map_err(|e| BuildError::io(Stage::Merge, self.space, &self.path, e))?;
        if n == 0 {
            return Ok(false);
        }
        if n < self.buf.len() {
            return Err(BuildError::malformed(
                Stage::Merge,
                self.space,
                format!("{}: partial trailing record", self.path.display()),
            ));
        }
        Ok(true)
    }

    /// 写出当前记录并原样拷贝剩余字节
    fn drain_into<W: Write>(&mut self, w: &mut W, out: &Path) -> Result<(), BuildError> {
        w.write_all(&self.buf)
            .map_err(|e| BuildError::io(Stage::Merge, self.space, out, e))?;
        std::io::copy(&mut self.reader, w)
            .map_err(|e| BuildError::io(Stage::Merge, self.space, &self.path, e))?;
        Ok(())
    }
}
