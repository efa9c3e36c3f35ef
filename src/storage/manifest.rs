use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::core::{KeySpace, RecordOrder};

/// 清单文件名（与两个 IndexFile 同目录）
pub const MANIFEST_NAME: &str = "nsrl.manifest";

const MAGIC: u32 = 0x4E53_524C; // "NSRL"
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8; // magic + version + state + data_len + xxh3

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceManifest {
    pub space: KeySpace,
    pub records: u64,
    pub bytes: u64,
}

/// 一次构建的描述：用于查询时发现"目录已变、索引过期"
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub catalog_len: u64,
    pub catalog_mtime_ns: Option<u64>,
    pub rows: u64,
    pub spaces: Vec<SpaceManifest>,
    pub chunk_capacity: u64,
    pub record_order: RecordOrder,
    pub built_at_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CatalogStamp {
    pub len: u64,
    pub mtime_ns: Option<u64>,
}

impl CatalogStamp {
    pub fn of(catalog: &Path) -> std::io::Result<Self> {
        let md = std::fs::metadata(catalog)?;
        let mtime_ns = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64);
        Ok(Self {
            len: md.len(),
            mtime_ns,
        })
    }
}

impl BuildManifest {
    pub fn stamp(&self) -> CatalogStamp {
        CatalogStamp {
            len: self.catalog_len,
            mtime_ns: self.catalog_mtime_ns,
        }
    }

    pub fn records_for(&self, space: KeySpace) -> Option<u64> {
        self.spaces.iter().find(|s| s.space == space).map(|s| s.records)
    }
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// 原子清单存储。
///
/// 落盘流程：
/// 1) 写 tmp 文件的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into` 流式写 body，边写边算 xxh3
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)
/// 6) fsync(dir)
///
/// 加载时 magic / version / state / data_len / checksum 任一不符都视为无清单。
pub struct ManifestStore {
    path: PathBuf,
}

fn encode_header(state: u32, data_len: u32, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    header[8..12].copy_from_slice(&state.to_le_bytes());
    header[12..16].copy_from_slice(&data_len.to_le_bytes());
    header[16..24].copy_from_slice(&checksum.to_le_bytes());
    header
}

impl ManifestStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(MANIFEST_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_if_valid(&self) -> anyhow::Result<Option<BuildManifest>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = std::fs::read(&self.path)?;
        if data.len() < HEADER_SIZE {
            tracing::warn!("Manifest too small, ignoring");
            return Ok(None);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into()?);
        let version = u32::from_le_bytes(data[4..8].try_into()?);
        let state = u32::from_le_bytes(data[8..12].try_into()?);
        let data_len = u32::from_le_bytes(data[12..16].try_into()?) as usize;
        let stored_checksum = u64::from_le_bytes(data[16..24].try_into()?);

        if magic != MAGIC {
            tracing::warn!("Manifest magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return Ok(None);
        }
        if version != VERSION_CURRENT {
            tracing::warn!("Manifest version mismatch: {} != {}", version, VERSION_CURRENT);
            return Ok(None);
        }
        if state != STATE_COMMITTED {
            tracing::warn!("Manifest state INCOMPLETE, ignoring");
            return Ok(None);
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            tracing::warn!("Manifest data length mismatch");
            return Ok(None);
        }

        let computed = xxhash_rust::xxh3::xxh3_64(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Manifest checksum mismatch: {:#x} != {:#x}",
                computed,
                stored_checksum
            );
            return Ok(None);
        }

        match bincode::deserialize::<BuildManifest>(body) {
            Ok(m) => Ok(Some(m)),
            Err(e) => {
                tracing::warn!("Manifest deserialize failed: {}", e);
                Ok(None)
            }
        }
    }

    pub fn write_atomic(&self, manifest: &BuildManifest) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("manifest.tmp");

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&encode_header(STATE_INCOMPLETE, 0, 0))?;

        let (data_len_u64, checksum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, manifest)?;
            cw.finish()
        };

        let data_len: u32 = data_len_u64
            .try_into()
            .map_err(|_| anyhow::anyhow!("Manifest too large (>{} bytes)", u32::MAX))?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(STATE_COMMITTED, data_len, checksum))?;

        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::info!(
            "Manifest written: {} rows, {} bytes",
            manifest.rows,
            HEADER_SIZE + data_len as usize
        );
        Ok(())
    }
}
