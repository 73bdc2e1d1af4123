//! 受信側: 順不同のデータパケットを順序どおりのバイト列に組み立てる
//!
//! ## 受信処理
//!
//! ```text
//! recv_data(pkt)
//!   ├─ 終端済み（closed / eof / err） → 破棄
//!   ├─ error パケット                  → err を設定、Fin ACK
//!   ├─ seq <  next_seq                 → 重複・古いので破棄
//!   ├─ seq >  next_seq                 → 順不同バッファへ（同じ seq は先着優先）
//!   └─ seq == next_seq                 → バッファに追加、順不同バッファを流し込み、ACK
//! ```
//!
//! ACK は毎回 `seq = next_seq` と `rwnd = read_window - バッファ長` を運ぶ。

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::sync::Arc;

use streamrpc_proto::{AckPacket, DataPacket};

use crate::error::StreamError;
use crate::ACK_HYSTERESIS_DIVISOR;

/// ACK の送り先
///
/// Broker の send キューが実装する。呼び出しはブロックしてはならない
/// （Reader は自身のロックを握ったまま呼ぶ）。
pub trait AckSender: Send + Sync {
    fn send_ack(&self, ack: AckPacket);
}

/// 順不同バッファの 1 エントリ（デコード済み）
struct Segment {
    data: Vec<u8>,
    eof: bool,
}

struct ReaderState {
    /// 受信バッファの容量（広告ウィンドウの基準）
    read_window: i64,
    /// 次に期待するバイトオフセット
    next_seq: i64,
    /// 読み出し待ちのバイト列
    buffer: VecDeque<u8>,
    eof: bool,
    err: Option<StreamError>,
    closed: bool,
    /// 最後に広告した rwnd
    last_rwnd_sent: i64,
    /// 先の seq のパケット（seq → ペイロード）
    ooo: BTreeMap<i64, Segment>,
    /// 順不同バッファ内のペイロード合計
    ooo_bytes: usize,
}

impl ReaderState {
    fn is_terminal(&self) -> bool {
        self.closed || self.eof || self.err.is_some()
    }

    fn current_rwnd(&self) -> i64 {
        (self.read_window - self.buffer.len() as i64).max(0)
    }

    /// seq == next_seq のペイロードを取り込む
    fn ingest(&mut self, data: Vec<u8>, eof: bool) {
        self.next_seq += data.len() as i64;
        self.buffer.extend(data);
        if eof {
            self.eof = true;
        }
    }

    /// 隙間が埋まった順不同エントリを順に取り込む
    fn drain_ooo(&mut self) {
        loop {
            if self.eof || self.err.is_some() {
                // ストリームは終わったので残りは不要
                self.ooo.clear();
                self.ooo_bytes = 0;
                return;
            }
            match self.ooo.first_key_value() {
                Some((&seq, _)) if seq <= self.next_seq => {}
                _ => return,
            }
            let Some((seq, segment)) = self.ooo.pop_first() else {
                return;
            };
            self.ooo_bytes -= segment.data.len();
            if seq == self.next_seq {
                self.ingest(segment.data, segment.eof);
            }
        }
    }
}

/// ストリームの受信端
///
/// `recv_data` は Broker の受信ワーカーから呼ばれ、ブロックしない。
/// `read` はデータ・EOF・エラー・`close` のいずれかまで呼び出し元をブロックする。
pub struct Reader {
    id: String,
    ack_sender: Arc<dyn AckSender>,
    max_ooo_bytes: Option<usize>,
    state: Mutex<ReaderState>,
    readable: Condvar,
}

impl Reader {
    /// オフセット 0 から読む Reader を生成する
    pub fn new(id: &str, read_window: i64, ack_sender: Arc<dyn AckSender>) -> Self {
        Self::with_seq(id, read_window, 0, ack_sender)
    }

    /// `start_seq` から読む Reader を生成する（再接続後の再開用）
    pub fn with_seq(id: &str, read_window: i64, start_seq: i64, ack_sender: Arc<dyn AckSender>) -> Self {
        Reader {
            id: id.to_string(),
            ack_sender,
            max_ooo_bytes: None,
            state: Mutex::new(ReaderState {
                read_window,
                next_seq: start_seq,
                buffer: VecDeque::new(),
                eof: false,
                err: None,
                closed: false,
                last_rwnd_sent: read_window,
                ooo: BTreeMap::new(),
                ooo_bytes: 0,
            }),
            readable: Condvar::new(),
        }
    }

    /// 順不同バッファの上限を設定する。超えたらストリームを異常終了させる。
    pub fn with_ooo_limit(mut self, limit: Option<usize>) -> Self {
        self.max_ooo_bytes = limit;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// データパケットを受け取る
    pub fn recv_data(&self, pkt: DataPacket) {
        let mut guard = self.lock();
        let st = &mut *guard;

        // 終端後のパケットは黙って捨てる
        if st.is_terminal() || pkt.id != self.id {
            return;
        }

        // error パケットは seq が有効とは限らないので先に見る
        if pkt.is_error() {
            tracing::debug!(stream_id = %self.id, error = %pkt.error, "stream error packet received");
            st.err = Some(StreamError::Remote(pkt.error));
            self.readable.notify_all();
            self.send_ack_locked(st, true, false, "");
            return;
        }

        if pkt.seq < st.next_seq {
            tracing::debug!(stream_id = %self.id, seq = pkt.seq, next_seq = st.next_seq, "stale data packet dropped");
            return;
        }

        // 順不同バッファにある seq の再送は中身を見ずに捨てる（先着優先）
        if pkt.seq > st.next_seq && st.ooo.contains_key(&pkt.seq) {
            tracing::debug!(stream_id = %self.id, seq = pkt.seq, "duplicate out-of-order packet dropped");
            return;
        }

        let data = match pkt.decode_data() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(stream_id = %self.id, seq = pkt.seq, "undecodable payload, cancelling stream");
                self.fail_locked(st, StreamError::Decode(e), "base64 decode error");
                return;
            }
        };

        if pkt.seq > st.next_seq {
            self.buffer_ooo_locked(st, pkt.seq, data, pkt.eof);
            return;
        }

        st.ingest(data, pkt.eof);
        st.drain_ooo();
        self.readable.notify_all();
        let fin = st.eof;
        self.send_ack_locked(st, fin, false, "");
    }

    fn buffer_ooo_locked(&self, st: &mut ReaderState, seq: i64, data: Vec<u8>, eof: bool) {
        if let Some(limit) = self.max_ooo_bytes {
            let buffered = st.ooo_bytes + data.len();
            if buffered > limit {
                tracing::warn!(stream_id = %self.id, buffered, limit, "out-of-order buffer overflow");
                self.fail_locked(
                    st,
                    StreamError::ReorderOverflow { buffered, limit },
                    "out-of-order buffer overflow",
                );
                return;
            }
        }
        tracing::debug!(stream_id = %self.id, seq, next_seq = st.next_seq, "out-of-order packet buffered");
        st.ooo_bytes += data.len();
        st.ooo.insert(seq, Segment { data, eof });
    }

    /// ストリームを異常終了させ、中断 ACK を送る
    fn fail_locked(&self, st: &mut ReaderState, err: StreamError, reason: &str) {
        st.err = Some(err);
        st.ooo.clear();
        st.ooo_bytes = 0;
        self.readable.notify_all();
        self.send_ack_locked(st, false, true, reason);
    }

    fn send_ack_locked(&self, st: &mut ReaderState, fin: bool, cancel: bool, error: &str) {
        let rwnd = st.current_rwnd();
        self.ack_sender.send_ack(AckPacket {
            id: self.id.clone(),
            seq: st.next_seq,
            fin,
            cancel,
            rwnd,
            error: error.to_string(),
        });
        st.last_rwnd_sent = rwnd;
    }

    /// 読み出す
    ///
    /// データがあれば最大 `buf.len()` バイトをコピーして返す。
    ///
    /// # 戻り値
    /// - `Ok(n)`（n > 0）: 読んだバイト数
    /// - `Ok(0)`: EOF（または `buf` が空）
    /// - `Err(StreamError::ClosedPipe)`: `close` 済み
    /// - `Err(_)`: 相手側のエラー・中断など
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut guard = self.lock();
        while guard.buffer.is_empty() && !guard.is_terminal() {
            guard = self.readable.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
        let st = &mut *guard;

        if st.closed {
            return Err(StreamError::ClosedPipe);
        }
        if let Some(err) = &st.err {
            return Err(err.clone());
        }
        if st.buffer.is_empty() && st.eof {
            return Ok(0);
        }

        let n = buf.len().min(st.buffer.len());
        for (dst, src) in buf.iter_mut().zip(st.buffer.drain(..n)) {
            *dst = src;
        }

        // 空いたウィンドウがしきい値を超えたら（または空になったら）ACK で知らせる。
        // EOF 後は Fin ACK 済みなので送らない。
        if !st.eof {
            let threshold = st.read_window / ACK_HYSTERESIS_DIVISOR;
            let rwnd_diff = st.current_rwnd() - st.last_rwnd_sent;
            if st.buffer.is_empty() || rwnd_diff >= threshold {
                self.send_ack_locked(st, false, false, "");
            }
        }

        Ok(n)
    }

    /// 期待オフセットを外部から付け替える
    ///
    /// 以前にどこまで消費したかを知っている再接続側が、
    /// 新しいセッションでその手前を再送させないために使う。
    pub fn update_next_seq(&self, seq: i64) {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.next_seq = seq;
        // 新しい位置より手前の順不同エントリはもう届かない位置にある
        let kept = st.ooo.split_off(&seq);
        st.ooo = kept;
        st.ooo_bytes = st.ooo.values().map(|s| s.data.len()).sum();
    }

    /// 閉じる（冪等）
    ///
    /// 待機中の `read` を起こし、Writer に中断 ACK を送る。
    pub fn close(&self) {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.closed {
            return;
        }
        st.closed = true;
        if st.err.is_none() {
            st.err = Some(StreamError::ClosedPipe);
        }
        self.readable.notify_all();
        self.send_ack_locked(st, false, true, "");
    }

    /// 外部要因（アイドル破棄など）でストリームを異常終了させる
    ///
    /// 既に終端していれば何もしない。
    pub(crate) fn abort(&self, err: StreamError, reason: &str) {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.is_terminal() {
            return;
        }
        self.fail_locked(st, err, reason);
    }

    /// 次に期待するバイトオフセット
    pub fn next_seq(&self) -> i64 {
        self.lock().next_seq
    }

    /// 読み出し待ちのバイト数
    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    /// 順不同バッファのエントリ数
    pub fn ooo_len(&self) -> usize {
        self.lock().ooo.len()
    }
}

impl io::Read for &Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Reader::read(*self, buf).map_err(io::Error::from)
    }
}

impl io::Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Reader::read(self, buf).map_err(io::Error::from)
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("Reader")
            .field("id", &self.id)
            .field("next_seq", &st.next_seq)
            .field("buffered", &st.buffer.len())
            .field("eof", &st.eof)
            .field("closed", &st.closed)
            .finish()
    }
}
