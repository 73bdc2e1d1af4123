//! プロセス内の遅延配送パイプ
//!
//! 実ネットワークの代わりに 2 つの Broker をつなぐ。
//! 各パケットに「到着予定時刻 = now + delay ± skew」を割り当て、
//! 予定時刻順に配送する。skew があるとパケットの順序が入れ替わるので、
//! Reader の並べ替えと Writer のウィンドウ制御をまとめて検証できる。
//!
//! ```text
//! enqueue_data ─┐                       ┌─→ data target (Broker::recv_data)
//!               ├─ pending（予定時刻順）─┤
//! enqueue_ack  ─┘                       └─→ ack target  (Broker::recv_ack)
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;
use streamrpc_proto::{AckPacket, DataPacket};

use crate::error::TransportError;
use crate::rpc::{RouteOpts, StreamRpc};

/// 配送ループのポーリング間隔（ミリ秒）
const POLL_INTERVAL_MS: u64 = 1;

/// 配送遅延の設定
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// 基本遅延（ミリ秒）
    pub delay_ms: u64,
    /// 遅延のゆらぎ幅 ±（ミリ秒）。0 なら順序は保たれる
    pub skew_ms: u64,
}

/// 配送統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// 受け付けたデータパケット数
    pub data_packets: u64,
    /// 受け付けた ACK パケット数
    pub ack_packets: u64,
    /// 直前に配送したものより小さい seq で配送されたパケット数
    pub ooo_packets: u64,
    /// パイプ内に滞留したペイロードバイト数の最大値
    pub high_water_bytes: i64,
}

#[derive(Default)]
struct Counters {
    data_packets: AtomicU64,
    ack_packets: AtomicU64,
    ooo_packets: AtomicU64,
    high_water_bytes: AtomicI64,
}

struct Tagged<P> {
    /// 同一時刻の配送順を決める受付番号
    order: u64,
    deliver_at: Instant,
    size: usize,
    packet: P,
}

#[derive(Default)]
struct PipeState {
    data_pending: Vec<Tagged<DataPacket>>,
    ack_pending: Vec<Tagged<AckPacket>>,
    data_order: u64,
    ack_order: u64,
    in_flight_bytes: i64,
    closed: bool,
}

type Target<P> = Arc<dyn Fn(P) + Send + Sync>;

/// 遅延・ゆらぎ付きのプロセス内トランスポート
pub struct DeliveryPipe {
    config: DeliveryConfig,
    state: Mutex<PipeState>,
    data_target: Mutex<Option<Target<DataPacket>>>,
    ack_target: Mutex<Option<Target<AckPacket>>>,
    counters: Counters,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 予定時刻順（同時刻なら受付順）を保って挿入する
fn insert_sorted<P>(pending: &mut Vec<Tagged<P>>, tagged: Tagged<P>) {
    let idx = pending.partition_point(|p| (p.deliver_at, p.order) <= (tagged.deliver_at, tagged.order));
    pending.insert(idx, tagged);
}

/// 予定時刻を過ぎたパケットを先頭から取り出す
fn take_ready<P>(pending: &mut Vec<Tagged<P>>, now: Instant) -> Vec<Tagged<P>> {
    let ready = pending.partition_point(|p| p.deliver_at <= now);
    pending.drain(..ready).collect()
}

impl DeliveryPipe {
    /// パイプを生成する（配送スレッドは `start` で起動）
    pub fn new(config: DeliveryConfig) -> Arc<Self> {
        Arc::new(DeliveryPipe {
            config,
            state: Mutex::new(PipeState::default()),
            data_target: Mutex::new(None),
            ack_target: Mutex::new(None),
            counters: Counters::default(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// データパケットの配送先を設定する
    pub fn set_data_target<F>(&self, target: F)
    where
        F: Fn(DataPacket) + Send + Sync + 'static,
    {
        *lock(&self.data_target) = Some(Arc::new(target));
    }

    /// ACK パケットの配送先を設定する
    pub fn set_ack_target<F>(&self, target: F)
    where
        F: Fn(AckPacket) + Send + Sync + 'static,
    {
        *lock(&self.ack_target) = Some(Arc::new(target));
    }

    fn delivery_instant(&self) -> Instant {
        let base = Instant::now() + Duration::from_millis(self.config.delay_ms);
        if self.config.skew_ms == 0 {
            return base;
        }
        let skew = self.config.skew_ms as i64;
        let offset = rand::thread_rng().gen_range(-skew..=skew);
        if offset >= 0 {
            base + Duration::from_millis(offset as u64)
        } else {
            base.checked_sub(Duration::from_millis(offset.unsigned_abs()))
                .unwrap_or(base)
        }
    }

    /// データパケットを積む
    ///
    /// # 戻り値
    /// `false` ならパイプは閉じている
    pub fn enqueue_data(&self, packet: DataPacket) -> bool {
        let deliver_at = self.delivery_instant();
        let size = packet.estimated_len();
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        state.data_order += 1;
        let order = state.data_order;
        insert_sorted(&mut state.data_pending, Tagged { order, deliver_at, size, packet });
        state.in_flight_bytes += size as i64;
        self.counters.data_packets.fetch_add(1, Ordering::Relaxed);
        self.counters
            .high_water_bytes
            .fetch_max(state.in_flight_bytes, Ordering::Relaxed);
        true
    }

    /// ACK パケットを積む
    pub fn enqueue_ack(&self, packet: AckPacket) -> bool {
        let deliver_at = self.delivery_instant();
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        state.ack_order += 1;
        let order = state.ack_order;
        insert_sorted(&mut state.ack_pending, Tagged { order, deliver_at, size: 0, packet });
        self.counters.ack_packets.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// 配送スレッド（データ用・ACK 用）を起動する
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let data_pipe = Arc::clone(self);
        let data_worker = thread::Builder::new()
            .name("pipe-data".into())
            .spawn(move || data_pipe.data_loop())?;
        let ack_pipe = Arc::clone(self);
        let ack_worker = thread::Builder::new()
            .name("pipe-ack".into())
            .spawn(move || ack_pipe.ack_loop())?;
        lock(&self.workers).extend([data_worker, ack_worker]);
        Ok(())
    }

    fn data_loop(&self) {
        let mut last_seq: Option<i64> = None;
        loop {
            let ready = {
                let mut state = lock(&self.state);
                if state.closed {
                    return;
                }
                take_ready(&mut state.data_pending, Instant::now())
            };
            let target = lock(&self.data_target).clone();
            for tagged in ready {
                if last_seq.is_some_and(|last| tagged.packet.seq < last) {
                    self.counters.ooo_packets.fetch_add(1, Ordering::Relaxed);
                }
                last_seq = Some(tagged.packet.seq);
                if let Some(target) = &target {
                    target(tagged.packet);
                }
                lock(&self.state).in_flight_bytes -= tagged.size as i64;
            }
            thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
    }

    fn ack_loop(&self) {
        let mut last_seq: Option<i64> = None;
        loop {
            let ready = {
                let mut state = lock(&self.state);
                if state.closed {
                    return;
                }
                take_ready(&mut state.ack_pending, Instant::now())
            };
            let target = lock(&self.ack_target).clone();
            for tagged in ready {
                if last_seq.is_some_and(|last| tagged.packet.seq < last) {
                    self.counters.ooo_packets.fetch_add(1, Ordering::Relaxed);
                }
                last_seq = Some(tagged.packet.seq);
                if let Some(target) = &target {
                    target(tagged.packet);
                }
            }
            thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
    }

    /// 配送待ちのパケット数（データ, ACK）
    pub fn pending(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.data_pending.len(), state.ack_pending.len())
    }

    /// 統計のスナップショット
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            data_packets: self.counters.data_packets.load(Ordering::Relaxed),
            ack_packets: self.counters.ack_packets.load(Ordering::Relaxed),
            ooo_packets: self.counters.ooo_packets.load(Ordering::Relaxed),
            high_water_bytes: self.counters.high_water_bytes.load(Ordering::Relaxed),
        }
    }

    /// 配送を止め、スレッドを join する。未配送のパケットは捨てる。冪等。
    pub fn close(&self) {
        lock(&self.state).closed = true;
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("delivery pipe worker panicked");
            }
        }
    }
}

/// `DeliveryPipe` に積む `StreamRpc` 実装
///
/// ルートは無視する（パイプの向こうには相手の Broker が 1 つだけいる）。
#[derive(Clone)]
pub struct PipeRpc {
    pipe: Arc<DeliveryPipe>,
}

impl PipeRpc {
    pub fn new(pipe: Arc<DeliveryPipe>) -> Self {
        PipeRpc { pipe }
    }
}

impl StreamRpc for PipeRpc {
    fn stream_data_command(&self, data: DataPacket, _opts: &RouteOpts) -> Result<(), TransportError> {
        if self.pipe.enqueue_data(data) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn stream_data_ack_command(&self, ack: AckPacket, _opts: &RouteOpts) -> Result<(), TransportError> {
        if self.pipe.enqueue_ack(ack) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}
