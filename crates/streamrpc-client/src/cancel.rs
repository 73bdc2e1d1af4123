//! Writer の中断通知

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

/// 一度だけ立つ中断フラグ
///
/// 何も送られないチャネルで表し、中断時に送信側を落として受信側を切断状態にする。
/// クローンはすべて同じチャネルを共有する。Writer のロックを取らずに
/// 中断をポーリング・待機でき、`crossbeam::select!` にも `receiver()` を渡せる。
#[derive(Clone)]
pub struct CancelToken {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    done: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        CancelToken {
            trigger: Arc::new(Mutex::new(Some(tx))),
            done: rx,
        }
    }

    /// 送信側を落とし、待機中のスレッドをすべて起こす。冪等。
    pub(crate) fn cancel(&self) {
        self.trigger.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// 中断済みか
    pub fn is_cancelled(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// 中断されるまで待つ
    pub fn wait(&self) {
        // 値は決して送られないので、戻るのは切断時だけ
        let _ = self.done.recv();
    }

    /// 最大 `timeout` だけ中断を待つ
    ///
    /// # 戻り値
    /// 中断されていれば `true`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Disconnected))
    }

    /// 中断で切断される受信側（`select!` 用）
    pub fn receiver(&self) -> &Receiver<()> {
        &self.done
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_timeout_without_cancel() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_wakes_clones() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(2)));
        token.cancel();
        assert!(handle.join().unwrap(), "クローン側も中断を観測すべき");
        token.wait(); // 既に中断済みなので即座に戻る
        token.cancel();
        assert!(token.is_cancelled(), "二度目の cancel でも中断のまま");
    }

    #[test]
    fn test_select_on_receiver() {
        let token = CancelToken::new();
        let (tx, work) = crossbeam::channel::unbounded::<u32>();
        tx.send(7).unwrap();

        crossbeam::select! {
            recv(work) -> msg => assert_eq!(msg.unwrap(), 7),
            recv(token.receiver()) -> _ => panic!("まだ中断されていない"),
        }

        token.cancel();
        crossbeam::select! {
            recv(token.receiver()) -> msg => assert!(msg.is_err(), "中断は切断として届く"),
            default(Duration::from_secs(1)) => panic!("中断が select に届かない"),
        }
    }
}
