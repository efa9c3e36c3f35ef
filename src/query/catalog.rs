use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;
use std::path::Path;

use serde::Serialize;

use crate::core::KeySpace;
use crate::error::ResolveError;

/// 把一行逗号分隔文本拆成字段（`"..."` 包裹，内部 `""` 转义为 `"`）
pub fn split_row(line: &str) -> Vec<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    cur.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if cur.is_empty() => quoted = true,
            ',' if !quoted => fields.push(std::mem::take(&mut cur)),
            c => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}

/// NSRLProd.txt 中的一行
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Product {
    pub code: u64,
    pub name: String,
    pub version: String,
    pub op_system_code: String,
    pub mfg_code: String,
    pub language: String,
    pub application_type: String,
}

impl Product {
    fn parse(line: &str) -> Option<Self> {
        let f = split_row(line);
        if f.len() < 7 {
            return None;
        }
        Some(Self {
            code: f[0].trim().parse().ok()?,
            name: f[1].clone(),
            version: f[2].clone(),
            op_system_code: f[3].clone(),
            mfg_code: f[4].clone(),
            language: f[5].clone(),
            application_type: f[6].clone(),
        })
    }
}

/// 目录中的一条软件记录，附带可选的产品信息
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SoftwareReference {
    pub sha1: String,
    pub md5: String,
    pub crc32: String,
    pub filename: String,
    pub filesize: u64,
    pub product_code: u64,
    pub op_system_code: String,
    pub special_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<Product>,
}

impl SoftwareReference {
    pub fn parse(line: &str) -> Result<Self, String> {
        let f = split_row(line);
        if f.len() < 8 {
            return Err(format!("expected 8 fields, found {}", f.len()));
        }
        let number = |i: usize, what: &str| {
            f[i].trim()
                .parse::<u64>()
                .map_err(|_| format!("bad {} {:?}", what, f[i]))
        };
        Ok(Self {
            sha1: f[0].clone(),
            md5: f[1].clone(),
            crc32: f[2].clone(),
            filename: f[3].clone(),
            filesize: number(4, "file size")?,
            product_code: number(5, "product code")?,
            op_system_code: f[6].clone(),
            special_code: f[7].clone(),
            product: None,
        })
    }

    pub fn digest(&self, space: KeySpace) -> &str {
        match space {
            KeySpace::Sha1 => &self.sha1,
            KeySpace::Md5 => &self.md5,
        }
    }
}

impl fmt::Display for SoftwareReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.product.as_ref();
        let or_none = |v: Option<&String>| v.map(String::as_str).unwrap_or("None").to_string();

        writeln!(f, "SoftwareReference [")?;
        writeln!(f, "\t                SHA-1 = {}", self.sha1)?;
        writeln!(f, "\t                  MD5 = {}", self.md5)?;
        writeln!(f, "\t                CRC32 = {}", self.crc32)?;
        writeln!(f, "\t             Filename = {}", self.filename)?;
        writeln!(f, "\t            File Size = {}", self.filesize)?;
        writeln!(f, "\t         Product Code = {}", self.product_code)?;
        writeln!(f, "\tOperating System Code = {}", self.op_system_code)?;
        writeln!(f, "\t         Special Code = {}", self.special_code)?;
        writeln!(f, "\tPRODUCT INFO:")?;
        writeln!(f, "\t         Product Name = {}", or_none(p.map(|p| &p.name)))?;
        writeln!(f, "\t      Product Version = {}", or_none(p.map(|p| &p.version)))?;
        writeln!(f, "\t             Mfg Code = {}", or_none(p.map(|p| &p.mfg_code)))?;
        writeln!(f, "\t             Language = {}", or_none(p.map(|p| &p.language)))?;
        writeln!(f, "\t     Application Type = {}", or_none(p.map(|p| &p.application_type)))?;
        write!(f, "]")
    }
}

/// 回查到的目录行交给它做解析与补全
pub trait MetadataJoin {
    type Output;

    fn join(
        &self,
        space: KeySpace,
        key: &[u8],
        offset: i64,
        row: &[u8],
    ) -> Result<Self::Output, ResolveError>;
}

/// 产品码 → 产品信息；同一产品码只保留第一行
#[derive(Clone, Debug, Default)]
pub struct ProductTable {
    by_code: HashMap<u64, Product>,
}

impl ProductTable {
    /// 按原始字节逐行读取；非 UTF-8 字节（如 Latin-1 产品名）以替换字符解码，不影响其余行
    pub fn from_reader<R: BufRead>(mut reader: R) -> std::io::Result<Self> {
        let mut by_code = HashMap::new();
        let mut skipped = 0usize;
        let mut raw = Vec::with_capacity(256);
        let mut line_no = 0u64;
        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            line_no += 1;
            // 首行是 header
            if line_no == 1 {
                continue;
            }
            let line = String::from_utf8_lossy(&raw);
            if line.trim().is_empty() {
                continue;
            }
            match Product::parse(&line) {
                Some(p) => {
                    by_code.entry(p.code).or_insert(p);
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::debug!("Skipped {} unparsable product rows", skipped);
        }
        Ok(Self { by_code })
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(std::io::BufReader::new(file))?;
        tracing::info!("Loaded {} products from {}", table.len(), path.display());
        Ok(table)
    }

    /// 缺少产品表不影响查询，仅降级为无产品信息
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(
                    "Product table {} unavailable, results will lack product info: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn get(&self, code: u64) -> Option<&Product> {
        self.by_code.get(&code)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl MetadataJoin for ProductTable {
    type Output = SoftwareReference;

    fn join(
        &self,
        space: KeySpace,
        key: &[u8],
        offset: i64,
        row: &[u8],
    ) -> Result<SoftwareReference, ResolveError> {
        let line = String::from_utf8_lossy(row);
        let mut sr = SoftwareReference::parse(&line)
            .map_err(|e| ResolveError::stale(offset, format!("unparsable row: {}", e)))?;

        let field = sr.digest(space);
        let matches = hex::decode(field.trim())
            .map(|d| d.as_slice() == key)
            .unwrap_or(false);
        if !matches {
            return Err(ResolveError::stale(
                offset,
                format!("row {} digest {} does not match {}", space, field, hex::encode(key)),
            ));
        }

        sr.product = self.get(sr.product_code).cloned();
        Ok(sr)
    }
}
