use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// IndexStore 的随机读后端。
///
/// ## 契约
/// - `read_exact_at` 是定位读，不依赖也不修改任何共享游标
/// - 因此同一个 source 可被多个查询并发使用（`&self`）
pub trait RecordSource: Send + Sync {
    fn len(&self) -> u64;
    fn read_exact_at(&self, buf: &mut [u8], pos: u64) -> std::io::Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 文件句柄 + pread
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl RecordSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, buf: &mut [u8], pos: u64) -> std::io::Result<()> {
        FileExt::read_exact_at(&self.file, buf, pos)
    }
}
