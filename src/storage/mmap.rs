use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

use crate::index::source::RecordSource;

/// 只读 mmap 后端：热查询时省去 pread 系统调用
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::open(path)?;
        // IndexFile 构建后不可变；映射期间不会被截断
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }
}

impl RecordSource for MmapSource {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_exact_at(&self, buf: &mut [u8], pos: u64) -> std::io::Result<()> {
        let start = usize::try_from(pos)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.mmap.get(start..end))
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_file_keeps_error_kind() {
        let err = MmapSource::open("/nonexistent/nsrl-index/md5.index")
            .err()
            .unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn out_of_range_read_is_unexpected_eof() {
        let path = std::env::temp_dir().join(format!(
            "nsrl-index-mmap-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::write(&path, [1u8, 2, 3, 4]).unwrap();
        let src = MmapSource::open(&path).unwrap();
        let mut buf = [0u8; 2];
        src.read_exact_at(&mut buf, 2).unwrap();
        assert_eq!(buf, [3, 4]);
        let err = src.read_exact_at(&mut buf, 3).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
