use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::RecordOrder;
use crate::error::ConfigError;

/// 默认分块容量：10^7 条记录（sha1 约 280MB / 块）
pub const DEFAULT_CHUNK_CAPACITY: usize = 10_000_000;

/// 数据集目录内的配置文件名
pub const DATASET_CONFIG_NAME: &str = "nsrl-index.toml";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub build: BuildConfig,
    pub query: QueryConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// 每块最多读入的记录数；唯一约束峰值常驻内存的参数
    pub chunk_capacity: usize,
    pub catalog_file: String,
    pub skip_header: bool,
    pub record_order: RecordOrder,
    /// 调试用：保留 raw/chunk/merged 中间文件
    pub keep_intermediates: bool,
    /// 索引输出目录；None 表示写在数据集根目录
    pub index_dir: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            catalog_file: "NSRLFile.txt".to_string(),
            skip_header: true,
            record_order: RecordOrder::default(),
            keep_intermediates: false,
            index_dir: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub product_file: String,
    pub use_mmap: bool,
    pub json: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            product_file: "NSRLProd.txt".to_string(),
            use_mmap: false,
            json: false,
        }
    }
}

impl BuildConfig {
    pub fn catalog_path(&self, dataset: &Path) -> PathBuf {
        dataset.join(&self.catalog_file)
    }

    pub fn index_dir(&self, dataset: &Path) -> PathBuf {
        match &self.index_dir {
            Some(d) if d.is_absolute() => d.clone(),
            Some(d) => dataset.join(d),
            None => dataset.to_path_buf(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str, origin: &Path) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s, path)
    }

    /// 查找顺序：显式路径 → `<dataset>/nsrl-index.toml` → `<config_dir>/nsrl-index/config.toml` → 默认
    pub fn discover(explicit: Option<&Path>, dataset: &Path) -> Result<Self, ConfigError> {
        if let Some(p) = explicit {
            tracing::debug!("Loading config from {}", p.display());
            return Self::load_file(p);
        }

        let candidates = std::iter::once(dataset.join(DATASET_CONFIG_NAME)).chain(
            dirs::config_dir().map(|d| d.join("nsrl-index").join("config.toml")),
        );
        for p in candidates {
            if p.is_file() {
                tracing::debug!("Loading config from {}", p.display());
                return Self::load_file(&p);
            }
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.chunk_capacity == 0 {
            return Err(ConfigError::Invalid(
                "build.chunk_capacity must be greater than zero".to_string(),
            ));
        }
        if self.build.catalog_file.is_empty() {
            return Err(ConfigError::Invalid(
                "build.catalog_file must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("nsrl-index-config-{}-{}", tag, nanos))
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = Config::from_toml_str(
            "[build]\nchunk_capacity = 4\nrecord_order = \"key-only\"\n",
            Path::new("inline"),
        )
        .unwrap();
        assert_eq!(cfg.build.chunk_capacity, 4);
        assert_eq!(cfg.build.record_order, RecordOrder::KeyOnly);
        assert_eq!(cfg.build.catalog_file, "NSRLFile.txt");
        assert!(cfg.build.skip_header);
        assert_eq!(cfg.query, QueryConfig::default());
    }

    #[test]
    fn zero_chunk_capacity_is_rejected() {
        let err = Config::from_toml_str("[build]\nchunk_capacity = 0\n", Path::new("inline"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn dataset_config_is_discovered() {
        let dir = unique_tmp_dir("discover");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(DATASET_CONFIG_NAME),
            "[query]\nuse_mmap = true\n",
        )
        .unwrap();

        let cfg = Config::discover(None, &dir).unwrap();
        assert!(cfg.query.use_mmap);
        assert_eq!(cfg.build.chunk_capacity, DEFAULT_CHUNK_CAPACITY);
    }

    #[test]
    fn relative_index_dir_resolves_under_dataset() {
        let mut b = BuildConfig::default();
        let ds = Path::new("/data/nsrl");
        assert_eq!(b.index_dir(ds), ds.to_path_buf());
        b.index_dir = Some(PathBuf::from("idx"));
        assert_eq!(b.index_dir(ds), ds.join("idx"));
    }
}
