use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// 偏移量字段宽度（i64，小端）
pub const OFFSET_LEN: usize = 8;

pub const SHA1_LEN: usize = 20;
pub const MD5_LEN: usize = 16;

/// 键空间：每种摘要族一个独立的索引域（独立记录宽度 + 独立 IndexFile）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySpace {
    Sha1,
    Md5,
}

impl KeySpace {
    /// 构建顺序即目录行中的字段顺序
    pub const ALL: [KeySpace; 2] = [KeySpace::Sha1, KeySpace::Md5];

    pub fn name(self) -> &'static str {
        match self {
            KeySpace::Sha1 => "sha1",
            KeySpace::Md5 => "md5",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            KeySpace::Sha1 => SHA1_LEN,
            KeySpace::Md5 => MD5_LEN,
        }
    }

    pub fn record_len(self) -> usize {
        self.key_len() + OFFSET_LEN
    }

    /// 目录行中该摘要所在的字段下标（0 起）
    pub fn field_index(self) -> usize {
        match self {
            KeySpace::Sha1 => 0,
            KeySpace::Md5 => 1,
        }
    }

    /// 按解码后的字节长度推断族
    pub fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            SHA1_LEN => Some(KeySpace::Sha1),
            MD5_LEN => Some(KeySpace::Md5),
            _ => None,
        }
    }

    pub fn raw_path(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}raw.index", self.name()))
    }

    pub fn chunk_path(self, dir: &Path, n: usize) -> PathBuf {
        dir.join(format!("{}{}.chunk", self.name(), n))
    }

    pub fn merged_path(self, dir: &Path, n: usize) -> PathBuf {
        dir.join(format!("{}{}.merged", self.name(), n))
    }

    /// 合并完成但尚未发布（两个键空间都成功后才 rename 到 index_path）
    pub fn staged_path(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.index.staged", self.name()))
    }

    pub fn index_path(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.index", self.name()))
    }

    /// 发布期间暂存上一次构建的索引，失败时据此回滚
    pub fn previous_path(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.index.previous", self.name()))
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
