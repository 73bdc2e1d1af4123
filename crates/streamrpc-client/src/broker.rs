//! プロセスごとのストリーム多重化
//!
//! Broker はストリーム ID → Reader / Writer / ルートの対応表と、
//! 2 本の作業キューを持つ。
//!
//! ```text
//!   send_data / send_ack ──→ send キュー ──→ [send ワーカー] ──→ StreamRpc
//!   recv_data / recv_ack ──→ recv キュー ──→ [recv ワーカー] ──→ Reader / Writer
//! ```
//!
//! 4 つの入口はキューに積むだけでブロックしない。RPC の受信ループから
//! 直接呼ばれるので、ここで止まると全ストリームが止まる。
//!
//! ## ストリームの状態
//!
//! ```text
//! Registered ──(最初のパケット)──→ Active ──┬─(Fin)──────────→ FinClosed
//!                                           ├─(Cancel)───────→ Canceled
//!                                           └─(Cancel+error)─→ ErrorClosed
//! ```
//!
//! 終端した ID は対応表から外れ、`retired_ttl` の間だけルートを覚えておく
//! （遅れて届くパケットへの中断 ACK を相手に届けるため）。

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use streamrpc_proto::{AckPacket, DataPacket, StreamMeta};
use streamrpc_transport::{RouteOpts, StreamRpc, WorkQueue};

use crate::config::BrokerConfig;
use crate::error::StreamError;
use crate::id::new_stream_id;
use crate::reader::{AckSender, Reader};
use crate::writer::{DataSender, Writer};

/// 未知ストリームへのデータに返す中断理由
pub const READER_NOT_FOUND: &str = "stream reader not found";
/// アイドル破棄の中断理由
pub const IDLE_TIMEOUT_REASON: &str = "stream idle timeout";

/// Broker に登録できる送信端
///
/// `Writer` 以外の型（テスト用の記録器など）も ACK を受け取れる。
pub trait StreamWriter: Send + Sync {
    fn recv_ack(&self, ack: &AckPacket);
}

impl StreamWriter for Writer {
    fn recv_ack(&self, ack: &AckPacket) {
        Writer::recv_ack(self, ack);
    }
}

/// Broker から見たストリームの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// 登録直後、まだパケットが流れていない
    Registered,
    /// どちらかの向きにパケットが流れた
    Active,
    /// Fin で正常終了
    FinClosed,
    /// Cancel で中断
    Canceled,
    /// エラー付きの Cancel、またはエラーパケットの後に終了
    ErrorClosed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::FinClosed | StreamState::Canceled | StreamState::ErrorClosed)
    }
}

/// ストリームを終わらせる ACK なら、その終端状態
fn terminal_state(ack: &AckPacket) -> Option<StreamState> {
    if ack.cancel {
        if ack.error.is_empty() {
            Some(StreamState::Canceled)
        } else {
            Some(StreamState::ErrorClosed)
        }
    } else if ack.fin {
        Some(StreamState::FinClosed)
    } else {
        None
    }
}

enum SendWork {
    Data(DataPacket),
    Ack(AckPacket),
}

enum RecvWork {
    Data(DataPacket),
    Ack(AckPacket),
}

/// send キューへ積むだけの送り口
///
/// Broker 本体ではなくキューだけを持つので、Reader / Writer から
/// Broker への参照循環ができない。
struct QueueSender(Arc<WorkQueue<SendWork>>);

impl AckSender for QueueSender {
    fn send_ack(&self, ack: AckPacket) {
        if !self.0.enqueue(SendWork::Ack(ack)) {
            tracing::debug!("broker closed, ack dropped");
        }
    }
}

impl DataSender for QueueSender {
    fn send_data(&self, pkt: DataPacket) {
        if !self.0.enqueue(SendWork::Data(pkt)) {
            tracing::debug!("broker closed, data packet dropped");
        }
    }
}

struct StreamEntry {
    reader: Option<Arc<Reader>>,
    writer: Option<Arc<dyn StreamWriter>>,
    reader_route: String,
    writer_route: String,
    state: StreamState,
    last_activity: Instant,
    /// エラーパケットがどちらかの向きに流れた
    errored: bool,
}

impl StreamEntry {
    fn new(meta: &StreamMeta) -> Self {
        StreamEntry {
            reader: None,
            writer: None,
            reader_route: meta.reader_route_id.clone(),
            writer_route: meta.writer_route_id.clone(),
            state: StreamState::Registered,
            last_activity: Instant::now(),
            errored: false,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        if self.state == StreamState::Registered {
            self.state = StreamState::Active;
        }
    }

    fn finish(&mut self, state: StreamState) {
        if self.state.is_terminal() {
            return;
        }
        // エラーパケットへの Fin はエラー終了として記録する
        self.state = match state {
            StreamState::FinClosed if self.errored => StreamState::ErrorClosed,
            other => other,
        };
    }
}

/// 終了したストリームの墓標
struct Retired {
    reader_route: String,
    writer_route: String,
    state: StreamState,
    retired_at: Instant,
}

#[derive(Default)]
struct Registry {
    streams: HashMap<String, StreamEntry>,
    retired: HashMap<String, Retired>,
    /// ID ごとの "stream reader not found" 最終送信時刻
    not_found_sent: HashMap<String, Instant>,
}

impl Registry {
    /// Reader も Writer もいなくなったエントリを墓標に移す
    fn retire_if_empty(&mut self, id: &str, now: Instant) {
        let empty = self
            .streams
            .get(id)
            .is_some_and(|e| e.reader.is_none() && e.writer.is_none());
        if !empty {
            return;
        }
        if let Some(entry) = self.streams.remove(id) {
            tracing::debug!(stream_id = %id, state = ?entry.state, "stream retired");
            self.retired.insert(
                id.to_string(),
                Retired {
                    reader_route: entry.reader_route,
                    writer_route: entry.writer_route,
                    state: entry.state,
                    retired_at: now,
                },
            );
        }
    }

    fn purge_expired(&mut self, now: Instant, config: &BrokerConfig) {
        let ttl = config.retired_ttl();
        let interval = config.not_found_ack_interval();
        self.retired.retain(|_, r| now.duration_since(r.retired_at) < ttl);
        self.not_found_sent.retain(|_, sent| now.duration_since(*sent) < interval);
    }
}

/// Broker とワーカースレッドで共有する状態
struct Shared {
    rpc: Arc<dyn StreamRpc>,
    config: BrokerConfig,
    registry: Mutex<Registry>,
    send_queue: Arc<WorkQueue<SendWork>>,
    recv_queue: Arc<WorkQueue<RecvWork>>,
    shutdown: Mutex<bool>,
    shutdown_cond: Condvar,
}

#[derive(Default)]
struct Workers {
    send: Option<JoinHandle<()>>,
    recv: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

/// ストリームの多重化器
///
/// # 使い方
///
/// ```ignore
/// // 読む側
/// let (reader, meta) = broker_a.create_stream_reader("route-a", "route-b", 64 * 1024)?;
/// // meta を RPC で相手に渡す
/// let writer = broker_b.create_stream_writer(&meta)?;
/// writer.write(b"hello")?;
/// writer.close();
/// ```
pub struct Broker {
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
}

impl Broker {
    /// デフォルト設定で Broker を生成し、ワーカーを起動する
    pub fn new<R: StreamRpc + 'static>(rpc: R) -> Result<Self, StreamError> {
        Self::with_config(rpc, BrokerConfig::default())
    }

    /// 設定を指定して Broker を生成し、ワーカーを起動する
    pub fn with_config<R: StreamRpc + 'static>(rpc: R, config: BrokerConfig) -> Result<Self, StreamError> {
        let shared = Arc::new(Shared {
            rpc: Arc::new(rpc),
            config,
            registry: Mutex::new(Registry::default()),
            send_queue: Arc::new(WorkQueue::new()),
            recv_queue: Arc::new(WorkQueue::new()),
            shutdown: Mutex::new(false),
            shutdown_cond: Condvar::new(),
        });
        let broker = Broker {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Workers::default()),
        };

        let spawn_err = |e: std::io::Error| StreamError::Spawn(e.to_string());
        {
            let mut workers = broker.lock_workers();

            let s = Arc::clone(&shared);
            workers.send = Some(
                shared
                    .send_queue
                    .spawn_worker("stream-broker-send", move |work| s.process_send(work))
                    .map_err(spawn_err)?,
            );

            let s = Arc::clone(&shared);
            workers.recv = Some(
                shared
                    .recv_queue
                    .spawn_worker("stream-broker-recv", move |work| s.process_recv(work))
                    .map_err(spawn_err)?,
            );

            if let Some(timeout) = shared.config.idle_timeout() {
                let s = Arc::clone(&shared);
                let interval = (timeout / 4).max(Duration::from_millis(1));
                workers.reaper = Some(
                    thread::Builder::new()
                        .name("stream-broker-reaper".to_string())
                        .spawn(move || s.run_reaper(interval))
                        .map_err(spawn_err)?,
                );
            }
        }
        // 起動途中で失敗した場合は Drop がワーカーを止める
        Ok(broker)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// 新しいストリームの Reader を登録する（オフセット 0 から）
    ///
    /// 返した `StreamMeta` は上位プロトコルで相手側に渡し、
    /// 相手はそれで `create_stream_writer` する。
    pub fn create_stream_reader(
        &self,
        reader_route: &str,
        writer_route: &str,
        rwnd: i64,
    ) -> Result<(Arc<Reader>, StreamMeta), StreamError> {
        self.create_stream_reader_with_seq(reader_route, writer_route, rwnd, 0)
    }

    /// `start_seq` から読む Reader を登録する（再接続後の再開用）
    pub fn create_stream_reader_with_seq(
        &self,
        reader_route: &str,
        writer_route: &str,
        rwnd: i64,
        start_seq: i64,
    ) -> Result<(Arc<Reader>, StreamMeta), StreamError> {
        if self.is_closed() {
            return Err(StreamError::BrokerClosed);
        }
        let id = new_stream_id();
        let meta = StreamMeta {
            id: id.clone(),
            rwnd,
            reader_route_id: reader_route.to_string(),
            writer_route_id: writer_route.to_string(),
        };

        let reader = Arc::new(
            Reader::with_seq(&id, rwnd, start_seq, self.queue_sender())
                .with_ooo_limit(self.shared.config.ooo_limit(rwnd)),
        );

        let mut entry = StreamEntry::new(&meta);
        entry.reader = Some(Arc::clone(&reader));
        self.shared.lock_registry().streams.insert(id.clone(), entry);
        tracing::debug!(stream_id = %id, rwnd, start_seq, "stream reader registered");

        Ok((reader, meta))
    }

    /// 任意の送信端を `meta.id` に登録する
    ///
    /// # エラー
    /// - `StreamError::WriterAlreadyRegistered`: 同じ ID に既に Writer がいる
    pub fn attach_stream_writer(&self, meta: &StreamMeta, writer: Arc<dyn StreamWriter>) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::BrokerClosed);
        }
        let mut reg = self.shared.lock_registry();
        let entry = reg
            .streams
            .entry(meta.id.clone())
            .or_insert_with(|| StreamEntry::new(meta));
        if entry.writer.is_some() {
            return Err(StreamError::WriterAlreadyRegistered(meta.id.clone()));
        }
        entry.writer = Some(writer);
        entry.reader_route = meta.reader_route_id.clone();
        entry.writer_route = meta.writer_route_id.clone();
        reg.retired.remove(&meta.id);
        tracing::debug!(stream_id = %meta.id, "stream writer attached");
        Ok(())
    }

    /// `meta` に対応する Writer を生成して登録する
    pub fn create_stream_writer(&self, meta: &StreamMeta) -> Result<Arc<Writer>, StreamError> {
        self.create_stream_writer_with_seq(meta, 0)
    }

    /// `start_seq` から送る Writer を生成して登録する
    pub fn create_stream_writer_with_seq(&self, meta: &StreamMeta, start_seq: i64) -> Result<Arc<Writer>, StreamError> {
        let writer = Arc::new(Writer::with_start_seq(&meta.id, meta.rwnd, start_seq, self.data_sender()));
        self.attach_stream_writer(meta, writer.clone())?;
        Ok(writer)
    }

    /// 終端 ACK を待たずに Writer の登録を外す
    pub fn detach_stream_writer(&self, id: &str) {
        let mut reg = self.shared.lock_registry();
        let empty = match reg.streams.get_mut(id) {
            Some(entry) => {
                entry.writer = None;
                entry.reader.is_none()
            }
            None => return,
        };
        if empty {
            reg.streams.remove(id);
        }
        tracing::debug!(stream_id = %id, "stream writer detached");
    }

    fn queue_sender(&self) -> Arc<QueueSender> {
        Arc::new(QueueSender(Arc::clone(&self.shared.send_queue)))
    }

    /// この Broker の send キューに積む `DataSender`
    ///
    /// 独自に組み立てた Writer を `attach_stream_writer` する場合に使う。
    pub fn data_sender(&self) -> Arc<dyn DataSender> {
        self.queue_sender()
    }

    /// データパケットを送信キューに積む（ブロックしない）
    pub fn send_data(&self, pkt: DataPacket) {
        if !self.shared.send_queue.enqueue(SendWork::Data(pkt)) {
            tracing::debug!("broker closed, send_data dropped");
        }
    }

    /// ACK を送信キューに積む（ブロックしない）
    pub fn send_ack(&self, ack: AckPacket) {
        if !self.shared.send_queue.enqueue(SendWork::Ack(ack)) {
            tracing::debug!("broker closed, send_ack dropped");
        }
    }

    /// 相手から届いたデータパケットを受信キューに積む（ブロックしない）
    pub fn recv_data(&self, pkt: DataPacket) {
        if !self.shared.recv_queue.enqueue(RecvWork::Data(pkt)) {
            tracing::debug!("broker closed, recv_data dropped");
        }
    }

    /// 相手から届いた ACK を受信キューに積む（ブロックしない）
    pub fn recv_ack(&self, ack: AckPacket) {
        if !self.shared.recv_queue.enqueue(RecvWork::Ack(ack)) {
            tracing::debug!("broker closed, recv_ack dropped");
        }
    }

    /// アイドル状態のストリームを破棄する
    ///
    /// `idle_timeout_ms` 未設定なら何もしない。
    ///
    /// # 戻り値
    /// 破棄したストリーム数
    pub fn reap_idle(&self) -> usize {
        self.shared.reap_idle()
    }

    /// ストリームの状態（終了後も墓標が残っている間は終端状態を返す）
    pub fn stream_state(&self, id: &str) -> Option<StreamState> {
        let reg = self.shared.lock_registry();
        reg.streams
            .get(id)
            .map(|e| e.state)
            .or_else(|| reg.retired.get(id).map(|r| r.state))
    }

    /// 登録中のストリーム数
    pub fn stream_count(&self) -> usize {
        self.shared.lock_registry().streams.len()
    }

    pub fn has_reader(&self, id: &str) -> bool {
        self.shared
            .lock_registry()
            .streams
            .get(id)
            .is_some_and(|e| e.reader.is_some())
    }

    pub fn has_writer(&self, id: &str) -> bool {
        self.shared
            .lock_registry()
            .streams
            .get(id)
            .is_some_and(|e| e.writer.is_some())
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.lock_shutdown()
    }

    /// 停止する（冪等）
    ///
    /// 積まれていた作業はすべて処理してからワーカーを終了させる。
    /// recv 側の処理は ACK を send キューに積むことがあるので、recv を先に止める。
    pub fn close(&self) {
        {
            let mut shutdown = self.shared.lock_shutdown();
            *shutdown = true;
            self.shared.shutdown_cond.notify_all();
        }

        let mut workers = self.lock_workers();
        if let Some(reaper) = workers.reaper.take() {
            join_worker(reaper, "reaper");
        }
        self.shared.recv_queue.close();
        if let Some(recv) = workers.recv.take() {
            join_worker(recv, "recv");
        }
        self.shared.send_queue.close();
        if let Some(send) = workers.send.take() {
            join_worker(send, "send");
        }
    }
}

fn join_worker(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        tracing::warn!(worker = name, "broker worker panicked");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.close();
    }
}

impl AckSender for Broker {
    fn send_ack(&self, ack: AckPacket) {
        Broker::send_ack(self, ack);
    }
}

impl DataSender for Broker {
    fn send_data(&self, pkt: DataPacket) {
        Broker::send_data(self, pkt);
    }
}

impl Shared {
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_shutdown(&self) -> MutexGuard<'_, bool> {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 宛先ルートを引き、ついでに活動時刻を更新する
    fn resolve_route(&self, id: &str, to_reader: bool) -> Option<String> {
        let now = Instant::now();
        let mut reg = self.lock_registry();
        if let Some(entry) = reg.streams.get_mut(id) {
            entry.touch(now);
            let route = if to_reader { &entry.reader_route } else { &entry.writer_route };
            return Some(route.clone());
        }
        reg.retired.get(id).map(|r| {
            if to_reader {
                r.reader_route.clone()
            } else {
                r.writer_route.clone()
            }
        })
    }

    fn process_send(&self, work: SendWork) {
        match work {
            SendWork::Data(pkt) => {
                if pkt.is_error() {
                    if let Some(entry) = self.lock_registry().streams.get_mut(&pkt.id) {
                        entry.errored = true;
                    }
                }
                let Some(route) = self.resolve_route(&pkt.id, true) else {
                    tracing::debug!(stream_id = %pkt.id, seq = pkt.seq, "no reader route, data packet dropped");
                    return;
                };
                let (id, seq) = (pkt.id.clone(), pkt.seq);
                if let Err(e) = self.rpc.stream_data_command(pkt, &RouteOpts::fire_and_forget(&route)) {
                    tracing::warn!(stream_id = %id, seq, route = %route, error = %e, "stream data send failed");
                }
            }
            SendWork::Ack(ack) => {
                let terminal = terminal_state(&ack);
                let id = ack.id.clone();
                match self.resolve_route(&id, false) {
                    Some(route) => {
                        let seq = ack.seq;
                        if let Err(e) = self.rpc.stream_data_ack_command(ack, &RouteOpts::fire_and_forget(&route)) {
                            tracing::warn!(stream_id = %id, seq, route = %route, error = %e, "stream ack send failed");
                        }
                    }
                    None => {
                        tracing::debug!(stream_id = %id, "no writer route, ack dropped");
                    }
                }
                // この側からはストリームが閉じた
                if let Some(state) = terminal {
                    self.cleanup_reader(&id, state);
                }
            }
        }
    }

    fn process_recv(&self, work: RecvWork) {
        match work {
            RecvWork::Data(pkt) => self.recv_data(pkt),
            RecvWork::Ack(ack) => {
                let writer = {
                    let now = Instant::now();
                    let mut reg = self.lock_registry();
                    reg.streams.get_mut(&ack.id).and_then(|entry| {
                        entry.touch(now);
                        entry.writer.clone()
                    })
                };
                let Some(writer) = writer else {
                    tracing::debug!(stream_id = %ack.id, "ack for unknown writer ignored");
                    return;
                };
                writer.recv_ack(&ack);
                if let Some(state) = terminal_state(&ack) {
                    self.cleanup_writer(&ack.id, state);
                }
            }
        }
    }

    fn recv_data(&self, pkt: DataPacket) {
        let reader = {
            let now = Instant::now();
            let mut reg = self.lock_registry();
            let reader = reg.streams.get_mut(&pkt.id).and_then(|entry| {
                entry.touch(now);
                entry.errored |= pkt.is_error();
                entry.reader.clone()
            });
            if reader.is_none() {
                // 同じ ID への中断 ACK は一定間隔に 1 回まで
                let interval = self.config.not_found_ack_interval();
                if let Some(sent) = reg.not_found_sent.get(&pkt.id) {
                    if now.duration_since(*sent) < interval {
                        return;
                    }
                }
                reg.not_found_sent.insert(pkt.id.clone(), now);
                reg.purge_expired(now, &self.config);
            }
            reader
        };

        match reader {
            Some(reader) => reader.recv_data(pkt),
            None => {
                tracing::debug!(stream_id = %pkt.id, seq = pkt.seq, "data for unknown stream, sending cancel");
                let ack = AckPacket::cancel(&pkt.id, pkt.seq, READER_NOT_FOUND);
                if !self.send_queue.enqueue(SendWork::Ack(ack)) {
                    tracing::debug!(stream_id = %pkt.id, "broker closed, cancel ack dropped");
                }
            }
        }
    }

    fn cleanup_reader(&self, id: &str, state: StreamState) {
        let now = Instant::now();
        let mut reg = self.lock_registry();
        let Some(entry) = reg.streams.get_mut(id) else {
            return;
        };
        if entry.reader.take().is_none() {
            return;
        }
        entry.finish(state);
        reg.retire_if_empty(id, now);
        reg.purge_expired(now, &self.config);
    }

    fn cleanup_writer(&self, id: &str, state: StreamState) {
        let now = Instant::now();
        let mut reg = self.lock_registry();
        let Some(entry) = reg.streams.get_mut(id) else {
            return;
        };
        if entry.writer.take().is_none() {
            return;
        }
        entry.finish(state);
        reg.retire_if_empty(id, now);
        reg.purge_expired(now, &self.config);
    }

    fn reap_idle(&self) -> usize {
        let Some(timeout) = self.config.idle_timeout() else {
            return 0;
        };
        let now = Instant::now();
        let idle: Vec<(String, Option<Arc<Reader>>, Option<Arc<dyn StreamWriter>>)> = {
            let mut reg = self.lock_registry();
            reg.purge_expired(now, &self.config);
            reg.streams
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_activity) >= timeout)
                .map(|(id, e)| (id.clone(), e.reader.clone(), e.writer.clone()))
                .collect()
        };

        for (id, reader, writer) in &idle {
            tracing::warn!(stream_id = %id, timeout_ms = timeout.as_millis() as u64, "idle stream reaped");
            if let Some(reader) = reader {
                // 相手への中断 ACK は send キュー経由で出る
                reader.abort(StreamError::IdleTimeout, IDLE_TIMEOUT_REASON);
                self.cleanup_reader(id, StreamState::ErrorClosed);
            }
            if let Some(writer) = writer {
                writer.recv_ack(&AckPacket::cancel(id, 0, IDLE_TIMEOUT_REASON));
                self.cleanup_writer(id, StreamState::ErrorClosed);
            }
        }
        idle.len()
    }

    fn run_reaper(&self, interval: Duration) {
        loop {
            {
                let shutdown = self.lock_shutdown();
                let (shutdown, _) = self
                    .shutdown_cond
                    .wait_timeout_while(shutdown, interval, |stop| !*stop)
                    .unwrap_or_else(PoisonError::into_inner);
                if *shutdown {
                    return;
                }
            }
            self.reap_idle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{OnceLock, Weak};
    use streamrpc_transport::TransportError;

    /// 相手の Broker に直接渡すトランスポート
    #[derive(Default)]
    struct Wire {
        peer: OnceLock<Weak<Broker>>,
    }

    impl Wire {
        fn peer(&self) -> Result<Arc<Broker>, TransportError> {
            self.peer
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| TransportError::NoRoute("peer".into()))
        }
    }

    impl StreamRpc for Wire {
        fn stream_data_command(&self, data: DataPacket, _opts: &RouteOpts) -> Result<(), TransportError> {
            self.peer()?.recv_data(data);
            Ok(())
        }

        fn stream_data_ack_command(&self, ack: AckPacket, _opts: &RouteOpts) -> Result<(), TransportError> {
            self.peer()?.recv_ack(ack);
            Ok(())
        }
    }

    /// 背中合わせにつないだ Broker の組
    fn broker_pair() -> (Arc<Broker>, Arc<Broker>) {
        let wire_a = Arc::new(Wire::default());
        let wire_b = Arc::new(Wire::default());
        let a = Arc::new(Broker::new(Arc::clone(&wire_a)).unwrap());
        let b = Arc::new(Broker::new(Arc::clone(&wire_b)).unwrap());
        wire_a.peer.set(Arc::downgrade(&b)).unwrap();
        wire_b.peer.set(Arc::downgrade(&a)).unwrap();
        (a, b)
    }

    /// 送信パケットをチャネルに流すトランスポート
    struct Recorder {
        data: Mutex<mpsc::Sender<(DataPacket, RouteOpts)>>,
        acks: Mutex<mpsc::Sender<(AckPacket, RouteOpts)>>,
    }

    fn recorder() -> (
        Recorder,
        mpsc::Receiver<(DataPacket, RouteOpts)>,
        mpsc::Receiver<(AckPacket, RouteOpts)>,
    ) {
        let (data_tx, data_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        (
            Recorder {
                data: Mutex::new(data_tx),
                acks: Mutex::new(ack_tx),
            },
            data_rx,
            ack_rx,
        )
    }

    impl StreamRpc for Recorder {
        fn stream_data_command(&self, data: DataPacket, opts: &RouteOpts) -> Result<(), TransportError> {
            let _ = self.data.lock().unwrap().send((data, opts.clone()));
            Ok(())
        }

        fn stream_data_ack_command(&self, ack: AckPacket, opts: &RouteOpts) -> Result<(), TransportError> {
            let _ = self.acks.lock().unwrap().send((ack, opts.clone()));
            Ok(())
        }
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "タイムアウト: {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_round_trip_and_cleanup() {
        let (a, b) = broker_pair();
        let (reader, meta) = a.create_stream_reader("route-a", "route-b", 1024).unwrap();
        assert_eq!(a.stream_state(&meta.id), Some(StreamState::Registered));
        let writer = b.create_stream_writer(&meta).unwrap();

        writer.write(b"hello broker").unwrap();
        writer.close();

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello broker");

        wait_until("両側の登録解除", || a.stream_count() == 0 && b.stream_count() == 0);
        assert_eq!(a.stream_state(&meta.id), Some(StreamState::FinClosed));
        assert_eq!(b.stream_state(&meta.id), Some(StreamState::FinClosed));
        assert!(writer.ack_state().fin_acked);

        a.close();
        b.close();
    }

    #[test]
    fn test_error_close_recorded_on_both_sides() {
        let (a, b) = broker_pair();
        let (reader, meta) = a.create_stream_reader("route-a", "route-b", 1024).unwrap();
        let writer = b.create_stream_writer(&meta).unwrap();

        writer.write(b"part").unwrap();
        writer.close_with_error("boom");

        let mut buf = [0u8; 16];
        let err = loop {
            match reader.read(&mut buf) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err, StreamError::Remote("boom".into()));

        wait_until("両側の登録解除", || a.stream_count() == 0 && b.stream_count() == 0);
        assert_eq!(a.stream_state(&meta.id), Some(StreamState::ErrorClosed), "読む側はエラー終了");
        assert_eq!(b.stream_state(&meta.id), Some(StreamState::ErrorClosed), "書く側もエラー終了");

        a.close();
        b.close();
    }

    #[test]
    fn test_duplicate_writer_rejected() {
        let (rec, _data, _acks) = recorder();
        let broker = Broker::new(rec).unwrap();
        let meta = StreamMeta {
            id: "dup".into(),
            rwnd: 100,
            reader_route_id: "r".into(),
            writer_route_id: "w".into(),
        };
        broker.create_stream_writer(&meta).unwrap();
        let err = broker.create_stream_writer(&meta).unwrap_err();
        assert_eq!(err, StreamError::WriterAlreadyRegistered("dup".into()));
        assert!(broker.has_writer("dup"), "最初の Writer は残る");

        broker.detach_stream_writer("dup");
        assert!(!broker.has_writer("dup"));
        assert_eq!(broker.stream_count(), 0);
        broker.create_stream_writer(&meta).unwrap();
    }

    #[test]
    fn test_reader_close_cancels_writer() {
        let (a, b) = broker_pair();
        let (reader, meta) = a.create_stream_reader("route-a", "route-b", 64).unwrap();
        let writer = b.create_stream_writer(&meta).unwrap();

        reader.close();

        assert!(
            writer.cancel_token().wait_timeout(Duration::from_secs(2)),
            "Reader の close が Writer に伝わるべき"
        );
        assert!(writer.ack_state().canceled);
        assert_eq!(writer.write(b"late"), Err(StreamError::Cancelled));
        wait_until("Writer 側の登録解除", || !b.has_writer(&meta.id));
        assert_eq!(b.stream_state(&meta.id), Some(StreamState::Canceled));

        a.close();
        b.close();
    }

    #[test]
    fn test_unknown_stream_cancel_is_rate_limited() {
        let (rec, _data, acks) = recorder();
        let broker = Broker::new(rec).unwrap();
        let (reader, meta) = broker.create_stream_reader("route-r", "route-w", 64).unwrap();

        reader.close();
        let (close_ack, opts) = acks.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(close_ack.cancel);
        assert_eq!(opts, RouteOpts::fire_and_forget("route-w"));
        wait_until("Reader の登録解除", || !broker.has_reader(&meta.id));

        // 終了後に届くデータには墓標のルートで中断 ACK を返す
        broker.recv_data(DataPacket::with_data(&meta.id, 7, b"late"));
        broker.recv_data(DataPacket::with_data(&meta.id, 11, b"late"));

        let (ack, opts) = acks.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(ack.cancel);
        assert_eq!(ack.seq, 7);
        assert_eq!(ack.error, READER_NOT_FOUND);
        assert_eq!(opts.route, "route-w");
        assert!(
            acks.recv_timeout(Duration::from_millis(100)).is_err(),
            "1 秒以内の 2 回目は送らない"
        );
    }

    #[test]
    fn test_ooo_limit_from_config() {
        let (rec, _data, acks) = recorder();
        let broker = Broker::new(rec).unwrap();
        let (reader, meta) = broker.create_stream_reader("r", "w", 4).unwrap();

        // 上限は 4 * 4 = 16 バイト
        for seq in [10, 20, 30, 40, 50] {
            broker.recv_data(DataPacket::with_data(&meta.id, seq, b"12345"));
        }

        let mut buf = [0u8; 8];
        assert_eq!(
            reader.read(&mut buf),
            Err(StreamError::ReorderOverflow { buffered: 20, limit: 16 })
        );
        let (ack, _) = acks.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(ack.error, "out-of-order buffer overflow");
        wait_until("登録解除", || broker.stream_count() == 0);
        assert_eq!(broker.stream_state(&meta.id), Some(StreamState::ErrorClosed));
    }

    #[test]
    fn test_idle_reaper() {
        let (rec, _data, acks) = recorder();
        let config = BrokerConfig {
            idle_timeout_ms: Some(40),
            ..Default::default()
        };
        let broker = Broker::with_config(rec, config).unwrap();
        let (reader, meta) = broker.create_stream_reader("r", "w", 64).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), Err(StreamError::IdleTimeout));
        let (ack, _) = acks.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(ack.cancel);
        assert_eq!(ack.error, IDLE_TIMEOUT_REASON);
        wait_until("登録解除", || broker.stream_count() == 0);
        assert_eq!(broker.stream_state(&meta.id), Some(StreamState::ErrorClosed));
    }

    #[test]
    fn test_reap_idle_disabled_by_default() {
        let (rec, _data, _acks) = recorder();
        let broker = Broker::new(rec).unwrap();
        broker.create_stream_reader("r", "w", 64).unwrap();
        assert_eq!(broker.reap_idle(), 0);
        assert_eq!(broker.stream_count(), 1);
    }

    #[test]
    fn test_close_drains_and_rejects() {
        let (rec, data, _acks) = recorder();
        let broker = Broker::new(rec).unwrap();
        let meta = StreamMeta {
            id: "drain".into(),
            rwnd: 1 << 20,
            reader_route_id: "r".into(),
            writer_route_id: "w".into(),
        };
        let writer = broker.create_stream_writer(&meta).unwrap();
        for _ in 0..100 {
            writer.write(b"x").unwrap();
        }
        // Broker 自身も DataSender として使える
        DataSender::send_data(&broker, DataPacket::eof("drain", 100));
        broker.close();
        broker.close();

        assert_eq!(data.try_iter().count(), 101, "close 前に積んだ作業はすべて処理される");
        assert!(broker.is_closed());
        assert!(matches!(
            broker.create_stream_reader("r", "w", 1),
            Err(StreamError::BrokerClosed)
        ));
        // 閉じた後の入口はパニックしない
        broker.recv_data(DataPacket::eof("drain", 0));
        broker.send_ack(AckPacket::default());
    }

    #[test]
    fn test_terminal_state() {
        assert_eq!(terminal_state(&AckPacket::default()), None);
        assert_eq!(terminal_state(&AckPacket::cancel("s", 0, "")), Some(StreamState::Canceled));
        assert_eq!(terminal_state(&AckPacket::cancel("s", 0, "boom")), Some(StreamState::ErrorClosed));
        let fin = AckPacket {
            fin: true,
            ..Default::default()
        };
        assert_eq!(terminal_state(&fin), Some(StreamState::FinClosed));
    }
}
