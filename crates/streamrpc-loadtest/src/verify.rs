//! 検証用のデータ生成・照合・低速読み出し

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

/// パターンの周期（素数なので 2 のべき乗のチャンク境界とずれる）
const PATTERN_MODULUS: u64 = 251;

/// オフセット `offset` のバイト
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % PATTERN_MODULUS) as u8
}

/// `buf` をオフセット `offset` からのパターンで埋める
pub fn fill_pattern(offset: u64, buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = pattern_byte(offset + i as u64);
    }
}

/// 受け取ったバイト列をパターンと照合する `io::Write`
#[derive(Debug, Default)]
pub struct Verifier {
    /// 受け取り終えるべきオフセット
    end: u64,
    /// 次に受け取るオフセット
    received: u64,
    mismatches: u64,
    first_mismatch: Option<u64>,
}

impl Verifier {
    /// オフセット `start` から `end` の手前までを受け取る前提の照合器
    pub fn new(start: u64, end: u64) -> Self {
        Verifier {
            end,
            received: start,
            ..Default::default()
        }
    }

    /// 次に受け取るオフセット（`start` + 受け取ったバイト数）
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }

    pub fn first_mismatch(&self) -> Option<u64> {
        self.first_mismatch
    }

    /// 予定どおりの長さを、不一致なしで受け取ったか
    pub fn is_complete(&self) -> bool {
        self.mismatches == 0 && self.received == self.end
    }
}

impl Write for Verifier {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            if b != pattern_byte(self.received) {
                self.mismatches += 1;
                self.first_mismatch.get_or_insert(self.received);
            }
            self.received += 1;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 読み出し速度を毎秒 `bytes_per_sec` 程度に抑える `io::Read`
///
/// 受信側が詰まったときに、送信側がウィンドウで止まることを確かめる。
pub struct SlowReader<R> {
    inner: R,
    chunk: usize,
    pause: Duration,
}

/// 1 秒をこの回数に分けて読む
const SLOW_READER_TICKS: u32 = 10;

impl<R: Read> SlowReader<R> {
    pub fn new(inner: R, bytes_per_sec: usize) -> Self {
        SlowReader {
            inner,
            chunk: (bytes_per_sec / SLOW_READER_TICKS as usize).max(1),
            pause: Duration::from_secs(1) / SLOW_READER_TICKS,
        }
    }
}

impl<R: Read> Read for SlowReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(self.pause);
        let limit = buf.len().min(self.chunk);
        let n = self.inner.read(&mut buf[..limit])?;
        tracing::trace!(bytes = n, "slow reader tick");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_wraps() {
        assert_eq!(pattern_byte(0), 0);
        assert_eq!(pattern_byte(250), 250);
        assert_eq!(pattern_byte(251), 0);

        let mut buf = [0u8; 4];
        fill_pattern(249, &mut buf);
        assert_eq!(buf, [249, 250, 0, 1]);
    }

    #[test]
    fn test_verifier_detects_corruption() {
        let mut v = Verifier::new(0, 8);
        let mut data = [0u8; 8];
        fill_pattern(0, &mut data);
        data[5] ^= 0xFF;
        v.write_all(&data).unwrap();

        assert_eq!(v.received(), 8);
        assert_eq!(v.mismatches(), 1);
        assert_eq!(v.first_mismatch(), Some(5));
        assert!(!v.is_complete());
    }

    #[test]
    fn test_verifier_from_offset() {
        let mut v = Verifier::new(1000, 1010);
        let mut data = [0u8; 10];
        fill_pattern(1000, &mut data);
        v.write_all(&data).unwrap();
        assert!(v.is_complete(), "開始オフセットからの照合");
    }

    #[test]
    fn test_slow_reader_limits_chunk() {
        let source: &[u8] = &[1u8; 100];
        let mut slow = SlowReader::new(source, 200);
        let mut buf = [0u8; 64];
        assert_eq!(slow.read(&mut buf).unwrap(), 20, "1 回の読み出しは 200/10 バイトまで");
    }
}
