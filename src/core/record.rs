use std::cmp::Ordering;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::core::keyspace::{KeySpace, OFFSET_LEN};

/// 原子单元：`key ‖ offset`
///
/// 磁盘布局（raw / chunk / index 三处完全一致，无 header、无分隔符）：
/// - key：定长原始摘要字节（sha1 20B / md5 16B）
/// - offset：i64 小端，指向目录文件中该行的起始字节
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HashRecord {
    pub space: KeySpace,
    pub key: Vec<u8>,
    pub offset: i64,
}

impl HashRecord {
    pub fn new(space: KeySpace, key: Vec<u8>, offset: i64) -> Self {
        debug_assert_eq!(key.len(), space.key_len());
        Self { space, key, offset }
    }

    /// 从一条完整的定长记录解码；长度不符返回 None
    pub fn from_bytes(space: KeySpace, rec: &[u8]) -> Option<Self> {
        if rec.len() != space.record_len() {
            return None;
        }
        let key_len = space.key_len();
        Some(Self {
            space,
            key: rec[..key_len].to_vec(),
            offset: decode_offset(rec, key_len),
        })
    }

    pub fn key_hex(&self) -> String {
        hex::encode(&self.key)
    }
}

pub fn write_record<W: Write>(w: &mut W, key: &[u8], offset: i64) -> std::io::Result<()> {
    w.write_all(key)?;
    w.write_all(&offset.to_le_bytes())
}

pub fn decode_offset(rec: &[u8], key_len: usize) -> i64 {
    let mut b = [0u8; OFFSET_LEN];
    b.copy_from_slice(&rec[key_len..key_len + OFFSET_LEN]);
    i64::from_le_bytes(b)
}

/// 排序/归并使用的比较策略。
///
/// - `KeyOnly`：仅比较 key；相同 key 的相对顺序由分块排序与"第一个输入优先"决定
/// - `KeyThenOffset`：key 相同再按 offset 升序，重复运行在整个构建中确定
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordOrder {
    KeyOnly,
    #[default]
    KeyThenOffset,
}

impl RecordOrder {
    pub fn compare(self, key_len: usize, a: &[u8], b: &[u8]) -> Ordering {
        let by_key = a[..key_len].cmp(&b[..key_len]);
        match self {
            RecordOrder::KeyOnly => by_key,
            RecordOrder::KeyThenOffset => by_key
                .then_with(|| decode_offset(a, key_len).cmp(&decode_offset(b, key_len))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(key_byte: u8, offset: i64) -> Vec<u8> {
        let mut out = Vec::new();
        write_record(&mut out, &[key_byte; 16], offset).unwrap();
        out
    }

    #[test]
    fn offset_is_little_endian() {
        let r = rec(0xAB, 0x0102);
        assert_eq!(r.len(), KeySpace::Md5.record_len());
        assert_eq!(&r[16..], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        let decoded = HashRecord::from_bytes(KeySpace::Md5, &r).unwrap();
        assert_eq!(decoded.offset, 0x0102);
        assert_eq!(decoded.key, vec![0xAB; 16]);
    }

    #[test]
    fn from_bytes_rejects_wrong_width() {
        assert!(HashRecord::from_bytes(KeySpace::Sha1, &rec(1, 1)).is_none());
    }

    #[test]
    fn key_then_offset_orders_numerically() {
        // 256 的小端首字节为 0，字节序比较会排错；必须按数值比较
        let a = rec(7, 1);
        let b = rec(7, 256);
        assert_eq!(RecordOrder::KeyThenOffset.compare(16, &a, &b), Ordering::Less);
        assert_eq!(RecordOrder::KeyOnly.compare(16, &a, &b), Ordering::Equal);
        assert_eq!(
            RecordOrder::KeyOnly.compare(16, &rec(1, 99), &rec(2, 0)),
            Ordering::Less
        );
    }
}
