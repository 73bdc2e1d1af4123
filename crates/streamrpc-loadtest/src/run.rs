//! 負荷試験の本体
//!
//! ```text
//!  writer スレッド                                    呼び出しスレッド
//!  Writer.write ─→ writer Broker ─→ DeliveryPipe ─→ reader Broker ─→ Reader.read ─→ Verifier
//!                        ↑                │
//!                        └──── ACK ───────┘
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Args;
use streamrpc_client::{Broker, StreamError};
use streamrpc_transport::{DeliveryConfig, DeliveryPipe, DeliveryStats, PipeRpc};

use crate::verify::{fill_pattern, SlowReader, Verifier};

/// writer スレッドが 1 回の `write` に渡す最大バイト数
const WRITE_CHUNK: usize = 32 * 1024;

/// 試験パラメータ
#[derive(Debug, Clone, Args)]
pub struct LoadConfig {
    /// 転送するバイト数
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub size: u64,

    /// パケットの基本配送遅延（ミリ秒）
    #[arg(long = "delay-ms", default_value_t = 0)]
    pub delay_ms: u64,

    /// 配送遅延のゆらぎ ±（ミリ秒）。0 より大きいと順序が入れ替わる
    #[arg(long = "skew-ms", default_value_t = 0)]
    pub skew_ms: u64,

    /// 受信ウィンドウ（バイト）
    #[arg(long = "window-size", default_value_t = 64 * 1024)]
    pub window_size: i64,

    /// 低速読み出し（バイト/秒、0 で無効）
    #[arg(long = "slow-reader", default_value_t = 0)]
    pub slow_reader: usize,

    /// このオフセットから再開する（`create_stream_reader_with_seq` の検証用）
    #[arg(long = "start-seq", default_value_t = 0)]
    pub start_seq: i64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        LoadConfig {
            size: 10 * 1024 * 1024,
            delay_ms: 0,
            skew_ms: 0,
            window_size: 64 * 1024,
            slow_reader: 0,
            start_seq: 0,
        }
    }
}

/// 試験の失敗
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("stream setup failed: {0}")]
    Setup(#[from] StreamError),
    #[error("failed to start delivery pipe: {0}")]
    Pipe(io::Error),
    #[error("failed to start writer thread: {0}")]
    Spawn(io::Error),
    #[error("transfer error: {0}")]
    Transfer(io::Error),
    #[error("writer failed: {0}")]
    Writer(StreamError),
    #[error("writer thread panicked")]
    WriterPanicked,
    #[error("data corruption: {mismatches} mismatches, first at byte {first}")]
    Corruption { mismatches: u64, first: u64 },
    #[error("short transfer: received {received} of {expected} bytes")]
    Short { received: u64, expected: u64 },
}

/// 試験結果
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub bytes: u64,
    pub elapsed: Duration,
    pub pipe: DeliveryStats,
}

impl LoadReport {
    /// スループット（MiB/秒）
    pub fn throughput_mib(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Transferred: {} bytes in {:.3?}", self.bytes, self.elapsed)?;
        writeln!(f, "Throughput:  {:.2} MiB/s", self.throughput_mib())?;
        writeln!(
            f,
            "Pipe:        data={} ack={} out-of-order={} high-water={} bytes",
            self.pipe.data_packets, self.pipe.ack_packets, self.pipe.ooo_packets, self.pipe.high_water_bytes
        )
    }
}

/// 2 つの Broker を遅延パイプでつなぎ、`config.size` バイトを流して検証する
pub fn run(config: &LoadConfig) -> Result<LoadReport, LoadError> {
    let pipe = DeliveryPipe::new(DeliveryConfig {
        delay_ms: config.delay_ms,
        skew_ms: config.skew_ms,
    });
    let writer_broker = Arc::new(Broker::new(PipeRpc::new(Arc::clone(&pipe)))?);
    let reader_broker = Arc::new(Broker::new(PipeRpc::new(Arc::clone(&pipe)))?);

    // パイプ → Broker は弱参照（Broker → PipeRpc → パイプと循環させない）
    let target = Arc::downgrade(&reader_broker);
    pipe.set_data_target(move |pkt| {
        if let Some(broker) = target.upgrade() {
            broker.recv_data(pkt);
        }
    });
    let target = Arc::downgrade(&writer_broker);
    pipe.set_ack_target(move |ack| {
        if let Some(broker) = target.upgrade() {
            broker.recv_ack(ack);
        }
    });
    pipe.start().map_err(LoadError::Pipe)?;

    let result = transfer(config, &reader_broker, &writer_broker);

    pipe.close();
    writer_broker.close();
    reader_broker.close();

    let (bytes, elapsed) = result?;
    Ok(LoadReport {
        bytes,
        elapsed,
        pipe: pipe.stats(),
    })
}

fn transfer(config: &LoadConfig, reader_broker: &Broker, writer_broker: &Broker) -> Result<(u64, Duration), LoadError> {
    let start = config.start_seq.max(0);
    let (reader, meta) =
        reader_broker.create_stream_reader_with_seq("reader-route", "writer-route", config.window_size, start)?;
    let writer = writer_broker.create_stream_writer_with_seq(&meta, start)?;
    tracing::info!(stream_id = %meta.id, size = config.size, window = config.window_size, start_seq = start, "stream connected");

    let begin = Instant::now();
    let size = config.size;
    let writer_thread = {
        let writer = Arc::clone(&writer);
        thread::Builder::new()
            .name("loadtest-writer".to_string())
            .spawn(move || -> Result<(), StreamError> {
                let mut buf = vec![0u8; WRITE_CHUNK];
                let mut offset = start as u64;
                let end = start as u64 + size;
                while offset < end {
                    let n = (end - offset).min(WRITE_CHUNK as u64) as usize;
                    fill_pattern(offset, &mut buf[..n]);
                    writer.write(&buf[..n])?;
                    offset += n as u64;
                }
                writer.close();
                Ok(())
            })
            .map_err(LoadError::Spawn)?
    };

    let mut verifier = Verifier::new(start as u64, start as u64 + size);
    let copied = if config.slow_reader > 0 {
        io::copy(&mut SlowReader::new(&*reader, config.slow_reader), &mut verifier)
    } else {
        io::copy(&mut &*reader, &mut verifier)
    };
    let elapsed = begin.elapsed();

    if let Err(e) = copied {
        // 書き込み側を止める（中断 ACK が届いて write がエラーで戻る）
        reader.close();
        let _ = writer_thread.join();
        return Err(LoadError::Transfer(e));
    }

    writer_thread
        .join()
        .map_err(|_| LoadError::WriterPanicked)?
        .map_err(LoadError::Writer)?;

    tracing::info!(received = verifier.received() - start as u64, mismatches = verifier.mismatches(), "transfer finished");
    if let Some(first) = verifier.first_mismatch() {
        return Err(LoadError::Corruption {
            mismatches: verifier.mismatches(),
            first,
        });
    }
    if !verifier.is_complete() {
        return Err(LoadError::Short {
            received: verifier.received() - start as u64,
            expected: size,
        });
    }
    Ok((size, elapsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_transfer() {
        let config = LoadConfig {
            size: 200_000,
            window_size: 8 * 1024,
            ..Default::default()
        };
        let report = run(&config).expect("転送は成功すべき");
        assert_eq!(report.bytes, 200_000);
        assert!(report.pipe.data_packets >= 200_000 / (8 * 1024), "ウィンドウ以下のパケットに分かれる");
    }

    #[test]
    fn test_report_display() {
        let report = LoadReport {
            bytes: 1024 * 1024,
            elapsed: Duration::from_secs(2),
            pipe: DeliveryStats::default(),
        };
        assert!((report.throughput_mib() - 0.5).abs() < 1e-9);
        assert!(report.to_string().contains("0.50 MiB/s"));
    }
}
