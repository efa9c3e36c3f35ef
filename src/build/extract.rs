use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::build::ledger::CleanupLedger;
use crate::core::{write_record, KeySpace, SHA1_LEN};
use crate::error::{BuildError, Scope, Stage};

/// 一个键空间的 raw 输出流（无序、仅追加）
pub struct RawSink<W: Write> {
    pub space: KeySpace,
    pub path: PathBuf,
    pub records: u64,
    writer: W,
}

impl<W: Write> RawSink<W> {
    pub fn new(space: KeySpace, path: PathBuf, writer: W) -> Self {
        Self {
            space,
            path,
            records: 0,
            writer,
        }
    }

    fn push(&mut self, key: &[u8], offset: i64) -> Result<(), BuildError> {
        write_record(&mut self.writer, key, offset)
            .map_err(|e| BuildError::io(Stage::Extract, self.space, &self.path, e))?;
        self.records += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<(W, u64), BuildError> {
        self.writer
            .flush()
            .map_err(|e| BuildError::io(Stage::Extract, self.space, &self.path, e))?;
        Ok((self.writer, self.records))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// 处理的数据行数（不含 header / 空行）
    pub rows: u64,
    pub blank_rows: u64,
    /// 扫描过的目录总字节数（含 header）
    pub bytes: u64,
}

#[derive(Clone, Debug)]
pub struct RawStream {
    pub space: KeySpace,
    pub path: PathBuf,
    pub records: u64,
}

#[derive(Clone, Debug)]
pub struct ExtractSummary {
    pub stats: ExtractStats,
    pub streams: Vec<RawStream>,
}

/// 单遍扫描目录：每行记录"消费前"的起始偏移，与前两个字段的摘要配对写入两个 raw 流。
pub fn extract_catalog(
    catalog: &Path,
    out_dir: &Path,
    skip_header: bool,
    ledger: &mut CleanupLedger,
) -> Result<ExtractSummary, BuildError> {
    let file = File::open(catalog).map_err(|e| BuildError::io(Stage::Extract, Scope::All, catalog, e))?;
    let reader = BufReader::with_capacity(1 << 20, file);

    let mut sinks = Vec::with_capacity(KeySpace::ALL.len());
    for space in KeySpace::ALL {
        let path = space.raw_path(out_dir);
        let f = File::create(&path).map_err(|e| BuildError::io(Stage::Extract, space, &path, e))?;
        ledger.register(&path);
        sinks.push(RawSink::new(space, path, BufWriter::with_capacity(1 << 20, f)));
    }

    let stats = extract_rows(reader, catalog, skip_header, &mut sinks)?;

    let mut streams = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let space = sink.space;
        let path = sink.path.clone();
        let (writer, records) = sink.finish()?;
        writer
            .into_inner()
            .map_err(|e| BuildError::io(Stage::Extract, space, &path, e.into_error()))?
            .sync_all()
            .map_err(|e| BuildError::io(Stage::Extract, space, &path, e))?;
        streams.push(RawStream {
            space,
            path,
            records,
        });
    }

    tracing::info!("Processed {} records", stats.rows);
    Ok(ExtractSummary { stats, streams })
}

/// 解析核心（与文件系统解耦，便于测试）。`sinks` 必须按 `KeySpace::ALL` 顺序排列。
pub fn extract_rows<R: BufRead, W: Write>(
    mut reader: R,
    source: &Path,
    skip_header: bool,
    sinks: &mut [RawSink<W>],
) -> Result<ExtractStats, BuildError> {
    let mut stats = ExtractStats::default();
    let mut line = Vec::with_capacity(512);
    let mut line_no = 0u64;
    let mut key_buf = [0u8; SHA1_LEN];

    loop {
        line.clear();
        // 偏移在读取本行之前确定
        let pos = stats.bytes;
        let n = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| BuildError::io(Stage::Extract, Scope::All, source, e))?;
        if n == 0 {
            break;
        }
        stats.bytes += n as u64;
        line_no += 1;

        if skip_header && line_no == 1 {
            continue;
        }
        if trim_ascii(&line).is_empty() {
            stats.blank_rows += 1;
            continue;
        }

        let offset = i64::try_from(pos).map_err(|_| {
            BuildError::malformed(Stage::Extract, Scope::All, format!("line {line_no}: offset overflow"))
        })?;

        for sink in sinks.iter_mut() {
            let space = sink.space;
            let key = &mut key_buf[..space.key_len()];
            decode_digest_field(&line, space, key).map_err(|detail| {
                BuildError::malformed(Stage::Extract, space, format!("line {line_no}: {detail}"))
            })?;
            sink.push(key, offset)?;
        }
        stats.rows += 1;
    }

    Ok(stats)
}

/// 取第 `space.field_index()` 个逗号分隔字段，去空白与引号后按十六进制解码到 `out`
pub fn decode_digest_field(row: &[u8], space: KeySpace, out: &mut [u8]) -> Result<(), String> {
    let field = row
        .split(|&b| b == b',')
        .nth(space.field_index())
        .ok_or_else(|| format!("missing {} field", space))?;
    let field = strip_quotes(trim_ascii(field));
    hex::decode_to_slice(field, out).map_err(|e| {
        format!(
            "bad {} digest {:?}: {}",
            space,
            String::from_utf8_lossy(field),
            e
        )
    })
}

pub(crate) fn trim_ascii(mut b: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = b {
        if first.is_ascii_whitespace() {
            b = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = b {
        if last.is_ascii_whitespace() {
            b = rest;
        } else {
            break;
        }
    }
    b
}

fn strip_quotes(b: &[u8]) -> &[u8] {
    match b {
        [b'"', inner @ .., b'"'] => inner,
        _ => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HashRecord;

    const HEADER: &str = "\"SHA-1\",\"MD5\",\"CRC32\",\"FileName\",\"FileSize\",\"ProductCode\",\"OpSystemCode\",\"SpecialCode\"\n";

    fn sinks() -> Vec<RawSink<Vec<u8>>> {
        KeySpace::ALL
            .iter()
            .map(|s| RawSink::new(*s, PathBuf::from(s.name()), Vec::new()))
            .collect()
    }

    fn decode_all(space: KeySpace, bytes: &[u8]) -> Vec<HashRecord> {
        bytes
            .chunks(space.record_len())
            .map(|r| HashRecord::from_bytes(space, r).unwrap())
            .collect()
    }

    #[test]
    fn offsets_point_at_row_starts() {
        let row1 = format!("\"{}\",\"{}\",\"0000\",\"a.dll\",1,1,\"358\",\"\"\n", "AA".repeat(20), "BB".repeat(16));
        let row2 = format!("\"{}\",\"{}\",\"0000\",\"b.dll\",2,1,\"358\",\"\"\r\n", "cc".repeat(20), "dd".repeat(16));
        let data = format!("{HEADER}{row1}{row2}");

        let mut s = sinks();
        let stats = extract_rows(data.as_bytes(), Path::new("t"), true, &mut s).unwrap();
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.bytes, data.len() as u64);

        let sha1 = decode_all(KeySpace::Sha1, &s[0].writer);
        assert_eq!(sha1.len(), 2);
        assert_eq!(sha1[0].offset, HEADER.len() as i64);
        assert_eq!(sha1[0].key, vec![0xAA; 20]);
        assert_eq!(sha1[1].offset, (HEADER.len() + row1.len()) as i64);
        assert_eq!(sha1[1].key, vec![0xCC; 20]);

        let md5 = decode_all(KeySpace::Md5, &s[1].writer);
        assert_eq!(md5[1].key, vec![0xDD; 16]);
        assert_eq!(md5[1].offset, sha1[1].offset);
    }

    #[test]
    fn blank_rows_are_skipped_but_counted_in_offsets() {
        let row = format!("{},{},x\n", "01".repeat(20), "02".repeat(16));
        let data = format!("\n{row}");
        let mut s = sinks();
        let stats = extract_rows(data.as_bytes(), Path::new("t"), false, &mut s).unwrap();
        assert_eq!(stats.rows, 1);
        assert_eq!(stats.blank_rows, 1);
        assert_eq!(decode_all(KeySpace::Md5, &s[1].writer)[0].offset, 1);
    }

    #[test]
    fn malformed_hex_is_fatal_and_names_space() {
        let data = format!("{HEADER}{},\"zz\",x\n", "01".repeat(20));
        let mut s = sinks();
        let err = extract_rows(data.as_bytes(), Path::new("t"), true, &mut s).unwrap_err();
        match err {
            BuildError::Malformed { stage, scope, detail } => {
                assert_eq!(stage, Stage::Extract);
                assert_eq!(scope, Scope::Space(KeySpace::Md5));
                assert!(detail.starts_with("line 2:"), "{detail}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_digest_is_malformed() {
        let data = format!("{},{}\n", "01".repeat(19), "02".repeat(16));
        let mut s = sinks();
        let err = extract_rows(data.as_bytes(), Path::new("t"), false, &mut s).unwrap_err();
        assert_eq!(err.scope(), Scope::Space(KeySpace::Sha1));
    }

    #[test]
    fn single_field_row_is_malformed() {
        let data = format!("{}\n", "01".repeat(20));
        let mut s = sinks();
        let err = extract_rows(data.as_bytes(), Path::new("t"), false, &mut s).unwrap_err();
        assert!(err.to_string().contains("missing md5 field"), "{err}");
    }
}
