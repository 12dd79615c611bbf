//! 读缓存窗口：每个 reader 同一时刻只持有一段连续字节。

use bytes::Bytes;

/// `[start, start+buf.len())` 的连续窗口；miss 时整体替换（收缩式，
/// 前向线性扫描的峰值驻留量与 block 大小同阶，而不随输出增长）。
#[derive(Default)]
pub struct BlockCache {
    start: u64,
    buf: Bytes,
    peak_len: usize,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 历史最大窗口字节数，用于观测收缩性质。
    pub fn peak_len(&self) -> usize {
        self.peak_len
    }

    /// `[offset, offset+len)` 是否完全落在窗口内。
    pub fn covers(&self, offset: u64, len: usize) -> bool {
        offset >= self.start && offset + len as u64 <= self.end()
    }

    /// 从窗口复制一段；调用方保证 covers 为真。
    pub fn slice(&self, offset: u64, len: usize) -> Bytes {
        let begin = (offset - self.start) as usize;
        self.buf.slice(begin..begin + len)
    }

    /// 窗口内从 offset 起的剩余字节。
    pub fn tail(&self, offset: u64) -> Bytes {
        let begin = (offset - self.start) as usize;
        self.buf.slice(begin..)
    }

    /// 以新窗口整体替换旧窗口。
    pub fn replace(&mut self, start: u64, buf: Bytes) {
        self.start = start;
        self.buf = buf;
        self.peak_len = self.peak_len.max(self.buf.len());
    }

    /// 在窗口尾部拼接后续字节（readline 增量取数用，不重复拉取已缓存部分）。
    pub fn extend(&mut self, more: &[u8]) {
        let mut merged = Vec::with_capacity(self.buf.len() + more.len());
        merged.extend_from_slice(&self.buf);
        merged.extend_from_slice(more);
        self.buf = Bytes::from(merged);
        self.peak_len = self.peak_len.max(self.buf.len());
    }

    /// 在 `[offset, end)` 范围内查找字节 b，返回其绝对偏移。
    pub fn find_byte(&self, offset: u64, b: u8) -> Option<u64> {
        let begin = (offset.max(self.start) - self.start) as usize;
        self.buf[begin..]
            .iter()
            .position(|&x| x == b)
            .map(|pos| offset + pos as u64)
    }

    /// 丢弃 offset 之前已消费的前缀，窗口收缩为 `[offset, end)`。
    pub fn shrink_to(&mut self, offset: u64) {
        if offset > self.start && offset <= self.end() {
            self.buf = self.tail(offset);
            self.start = offset;
        }
    }

    pub fn clear(&mut self) {
        self.buf = Bytes::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_and_slice() {
        let mut c = BlockCache::new();
        c.replace(10, Bytes::from_static(b"abcdef"));
        assert!(c.covers(10, 6));
        assert!(c.covers(12, 2));
        assert!(!c.covers(9, 2));
        assert!(!c.covers(14, 3));
        assert_eq!(&c.slice(12, 3)[..], b"cde");
        assert_eq!(&c.tail(13)[..], b"def");
    }

    #[test]
    fn test_extend_and_peak() {
        let mut c = BlockCache::new();
        c.replace(0, Bytes::from_static(b"ab"));
        c.extend(b"cd");
        assert_eq!(&c.slice(0, 4)[..], b"abcd");
        assert_eq!(c.peak_len(), 4);
        c.replace(100, Bytes::from_static(b"z"));
        assert_eq!(c.len(), 1);
        assert_eq!(c.peak_len(), 4);
    }

    #[test]
    fn test_find_byte() {
        let mut c = BlockCache::new();
        c.replace(4, Bytes::from_static(b"a,b\nc"));
        assert_eq!(c.find_byte(4, b'\n'), Some(7));
        assert_eq!(c.find_byte(8, b'\n'), None);
    }
}
