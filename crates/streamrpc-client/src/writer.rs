//! 送信側: ブロッキング書き込みをウィンドウ内のデータパケットに切り分ける
//!
//! ```text
//! available = read_window - sent_not_acked
//!
//!   last_acked_seq        next_seq - sent_not_acked        next_seq
//!        |                          |<---- in flight ---->|
//! ```
//!
//! `sent_not_acked` は常に `read_window` 以下に保たれる。

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use streamrpc_proto::{AckPacket, DataPacket};

use crate::cancel::CancelToken;
use crate::error::StreamError;

/// データパケットの送り先
///
/// Writer は自身のロックを握ったまま呼ぶので、実装はブロックしてはならない。
pub trait DataSender: Send + Sync {
    fn send_data(&self, pkt: DataPacket);
}

/// ACK の進捗（`Writer::ack_state`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckState {
    /// 受信側が取り込み済みと報告した最大オフセット
    pub last_acked_seq: i64,
    pub fin_acked: bool,
    pub canceled: bool,
}

/// 送信ウィンドウの状態（`Writer::window_state`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub next_seq: i64,
    pub sent_not_acked: i64,
    pub read_window: i64,
}

struct WriterState {
    read_window: i64,
    next_seq: i64,
    /// まだ送っていないバイト
    buffer: VecDeque<u8>,
    sent_not_acked: i64,
    last_acked_seq: i64,
    fin_acked: bool,
    canceled: bool,
    err: Option<StreamError>,
    closed: bool,
}

impl WriterState {
    fn terminal_error(&self) -> Option<StreamError> {
        if self.closed {
            return Some(StreamError::ClosedPipe);
        }
        self.err.clone()
    }
}

/// ストリームの送信端
pub struct Writer {
    id: String,
    data_sender: Arc<dyn DataSender>,
    cancel: CancelToken,
    state: Mutex<WriterState>,
    writable: Condvar,
}

impl Writer {
    /// オフセット 0 から送る Writer を生成する
    ///
    /// `read_window` は相手 Reader の初期ウィンドウ（`StreamMeta::rwnd`）。
    pub fn new(id: &str, read_window: i64, data_sender: Arc<dyn DataSender>) -> Self {
        Self::with_start_seq(id, read_window, 0, data_sender)
    }

    /// `start_seq` から送る Writer を生成する
    ///
    /// `Broker::create_stream_reader_with_seq` で再開した Reader と対にする。
    pub fn with_start_seq(id: &str, read_window: i64, start_seq: i64, data_sender: Arc<dyn DataSender>) -> Self {
        Writer {
            id: id.to_string(),
            data_sender,
            cancel: CancelToken::new(),
            state: Mutex::new(WriterState {
                read_window,
                next_seq: start_seq,
                buffer: VecDeque::new(),
                sent_not_acked: 0,
                last_acked_seq: start_seq,
                fin_acked: false,
                canceled: false,
                err: None,
                closed: false,
            }),
            writable: Condvar::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 書き込む
    ///
    /// `p` 全体を送り終えるか、ストリームが終端するまでブロックする。
    /// 終端した場合、送れなかった残りは破棄される。
    ///
    /// # 戻り値
    /// - `Ok(p.len())`: すべて送信した
    /// - `Err(StreamError::ClosedPipe)`: `close` 済み
    /// - `Err(StreamError::Cancelled)`: 相手 Reader が中断した
    pub fn write(&self, p: &[u8]) -> Result<usize, StreamError> {
        let mut st = self.lock();
        if let Some(err) = st.terminal_error() {
            return Err(err);
        }

        st.buffer.extend(p);
        loop {
            // close はバッファを捨てるので、空かどうかより先に終端を見る
            if let Some(err) = st.terminal_error() {
                return Err(err);
            }
            if st.buffer.is_empty() {
                return Ok(p.len());
            }
            if !self.try_send_locked(&mut st) {
                st = self.writable.wait(st).unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    /// 空きウィンドウ分だけ 1 パケットで送る。何も送れなければ `false`。
    fn try_send_locked(&self, st: &mut WriterState) -> bool {
        let available = st.read_window - st.sent_not_acked;
        if available <= 0 || st.buffer.is_empty() {
            return false;
        }

        let n = st.buffer.len().min(available as usize);
        let chunk: Vec<u8> = st.buffer.drain(..n).collect();
        self.data_sender
            .send_data(DataPacket::with_data(&self.id, st.next_seq, &chunk));
        st.next_seq += n as i64;
        st.sent_not_acked += n as i64;
        true
    }

    /// ACK を受け取る（ブロックしない）
    pub fn recv_ack(&self, ack: &AckPacket) {
        let mut st = self.lock();
        if ack.id != self.id {
            return;
        }

        // 古い ACK の rwnd で新しい広告を上書きしない
        let stale = ack.seq < st.last_acked_seq;
        // 同じ seq の間、受信側の rwnd は読み出しで増えるだけ
        let same_seq = ack.seq == st.last_acked_seq;
        st.last_acked_seq = st.last_acked_seq.max(ack.seq);

        if ack.fin {
            st.fin_acked = true;
        }

        if ack.cancel {
            if !st.canceled {
                tracing::debug!(stream_id = %self.id, reason = %ack.error, "stream cancelled by reader");
                st.canceled = true;
                self.cancel.cancel();
                if !st.closed {
                    st.err = Some(StreamError::Cancelled);
                    self.writable.notify_all();
                }
            }
            return;
        }

        if st.closed || stale {
            return;
        }

        let base = st.next_seq - st.sent_not_acked;
        if ack.seq > base {
            st.sent_not_acked = (st.sent_not_acked - (ack.seq - base)).max(0);
        }
        st.read_window = if same_seq {
            st.read_window.max(ack.rwnd)
        } else {
            ack.rwnd
        };
        self.writable.notify_all();
    }

    /// 正常終了する（Eof パケットを送る）。冪等。
    ///
    /// 書き込み中の `write` は即座にエラーで戻り、未送信のバイトは破棄される。
    pub fn close(&self) {
        self.finish(None);
    }

    /// エラーで終了する（エラーパケットを送る）。冪等。
    pub fn close_with_error(&self, err: impl fmt::Display) {
        self.finish(Some(err.to_string()));
    }

    fn finish(&self, error: Option<String>) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        if st.err.is_none() {
            st.err = Some(StreamError::ClosedPipe);
        }
        if !st.buffer.is_empty() {
            tracing::debug!(stream_id = %self.id, discarded = st.buffer.len(), "unsent bytes discarded on close");
            st.buffer.clear();
        }
        self.writable.notify_all();

        let pkt = match error {
            None => DataPacket::eof(&self.id, st.next_seq),
            Some(msg) => DataPacket::error(&self.id, st.next_seq, &msg),
        };
        self.data_sender.send_data(pkt);
    }

    /// ACK の進捗
    pub fn ack_state(&self) -> AckState {
        let st = self.lock();
        AckState {
            last_acked_seq: st.last_acked_seq,
            fin_acked: st.fin_acked,
            canceled: st.canceled,
        }
    }

    /// 送信ウィンドウの状態
    pub fn window_state(&self) -> WindowState {
        let st = self.lock();
        WindowState {
            next_seq: st.next_seq,
            sent_not_acked: st.sent_not_acked,
            read_window: st.read_window,
        }
    }

    /// 中断されたときに立つトークン
    ///
    /// Writer のロックを取らずに中断を待てる。
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl io::Write for &Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write(*self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("Writer")
            .field("id", &self.id)
            .field("next_seq", &st.next_seq)
            .field("sent_not_acked", &st.sent_not_acked)
            .field("read_window", &st.read_window)
            .field("closed", &st.closed)
            .finish()
    }
}
