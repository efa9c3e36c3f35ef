use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::KeySpace;

/// 构建阶段（用于错误定位：哪个阶段、哪个键空间失败）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Sort,
    Merge,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Extract => "extraction",
            Stage::Sort => "sort",
            Stage::Merge => "merge",
            Stage::Publish => "publish",
        })
    }
}

/// 错误作用域：抽取阶段读目录时尚未区分键空间
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    All,
    Space(KeySpace),
}

impl From<KeySpace> for Scope {
    fn from(space: KeySpace) -> Self {
        Scope::Space(space)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("all key spaces"),
            Scope::Space(s) => write!(f, "{}", s),
        }
    }
}

/// 构建期错误：全部致命，不发布任何不完整索引
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{stage} failed for {scope}: {}: {source}", .path.display())]
    Io {
        stage: Stage,
        scope: Scope,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{stage} failed for {scope}: malformed input: {detail}")]
    Malformed {
        stage: Stage,
        scope: Scope,
        detail: String,
    },
}

impl BuildError {
    pub fn io(
        stage: Stage,
        scope: impl Into<Scope>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        BuildError::Io {
            stage,
            scope: scope.into(),
            path: path.into(),
            source,
        }
    }

    pub fn malformed(stage: Stage, scope: impl Into<Scope>, detail: impl Into<String>) -> Self {
        BuildError::Malformed {
            stage,
            scope: scope.into(),
            detail: detail.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            BuildError::Io { stage, .. } | BuildError::Malformed { stage, .. } => *stage,
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            BuildError::Io { scope, .. } | BuildError::Malformed { scope, .. } => *scope,
        }
    }
}

/// 查询期错误：作用域限于单个摘要，批量查询不因此中断
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid digest {input:?}: {reason}")]
    InvalidDigest { input: String, reason: String },
    #[error("index file missing: {} (run `init` first)", .0.display())]
    IndexMissing(PathBuf),
    #[error("{}: length {len} is not a multiple of record size {record_len}", .path.display())]
    Misaligned {
        path: PathBuf,
        len: u64,
        record_len: usize,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 单条命中回查目录失败
#[derive(Debug, Error)]
pub enum ResolveError {
    /// 索引与目录不一致（目录在建索引后被修改）
    #[error("stale reference at offset {offset}: {reason}")]
    Stale { offset: i64, reason: String },
    #[error("io error at offset {offset}: {source}")]
    Io {
        offset: i64,
        #[source]
        source: std::io::Error,
    },
}

impl ResolveError {
    pub fn stale(offset: i64, reason: impl Into<String>) -> Self {
        ResolveError::Stale {
            offset,
            reason: reason.into(),
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ResolveError::Stale { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_names_stage_and_space() {
        let e = BuildError::malformed(Stage::Extract, KeySpace::Md5, "line 3: bad hex");
        assert_eq!(
            e.to_string(),
            "extraction failed for md5: malformed input: line 3: bad hex"
        );
        assert_eq!(e.stage(), Stage::Extract);
        assert_eq!(e.scope(), Scope::Space(KeySpace::Md5));

        let e = BuildError::io(
            Stage::Merge,
            Scope::Space(KeySpace::Sha1),
            "/x/sha10.merged",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(e.to_string().starts_with("merge failed for sha1: /x/sha10.merged"));
    }
}
