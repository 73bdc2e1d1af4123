//! 非ブロッキング投入・単一コンシューマの作業キュー
//!
//! Broker の 4 つの入口（send_data / send_ack / recv_data / recv_ack）は
//! RPC の受信ループから直接呼ばれる。ここでブロックすると全ストリームの
//! RPC 処理が止まるため、入口はキューに積むだけにして、実処理は
//! キューごとの専用ワーカースレッドが順番に行う。

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};

/// チャネルに流れる 1 要素。`Stop` は close 時に 1 度だけ積まれる番兵
enum Slot<T> {
    Item(T),
    Stop,
}

/// FIFO 作業キュー
///
/// `enqueue` は O(1) でブロックしない。`next` はワーカーが 1 本だけ呼ぶ前提。
/// チャネルは FIFO なので、`Stop` より前に積まれた作業はすべて取り出される。
pub struct WorkQueue<T> {
    tx: Sender<Slot<T>>,
    rx: Receiver<Slot<T>>,
    /// 閉じたか。投入側は読みロック、close は書きロックを取り、
    /// `Stop` の後ろに作業が積まれないようにする
    closed: RwLock<bool>,
    /// コンシューマが `Stop` を取り出したか
    drained: AtomicBool,
}

impl<T> WorkQueue<T> {
    /// 空のキューを生成する
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        WorkQueue {
            tx,
            rx,
            closed: RwLock::new(false),
            drained: AtomicBool::new(false),
        }
    }

    /// 作業を積む
    ///
    /// # 戻り値
    /// - `true`: 積んだ
    /// - `false`: キューは閉じている（作業は捨てられた）
    pub fn enqueue(&self, item: T) -> bool {
        let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return false;
        }
        // 受信側は self が持っているので送信は失敗しない
        self.tx.send(Slot::Item(item)).is_ok()
    }

    /// 次の作業を取り出す（なければ待つ）
    ///
    /// 閉じられた後も積まれていた作業は最後まで返し、空になったら `None`。
    pub fn next(&self) -> Option<T> {
        if self.drained.load(Ordering::Acquire) {
            return None;
        }
        match self.rx.recv() {
            Ok(Slot::Item(item)) => Some(item),
            Ok(Slot::Stop) | Err(_) => {
                self.drained.store(true, Ordering::Release);
                None
            }
        }
    }

    /// キューを閉じる。以降の `enqueue` は捨てられる。冪等。
    pub fn close(&self) {
        let mut closed = self.closed.write().unwrap_or_else(PoisonError::into_inner);
        if !*closed {
            *closed = true;
            let _ = self.tx.send(Slot::Stop);
        }
    }

    /// 未処理の作業数
    pub fn len(&self) -> usize {
        let stop_pending = self.is_closed() && !self.drained.load(Ordering::Acquire);
        self.rx.len().saturating_sub(usize::from(stop_pending))
    }

    /// 未処理の作業がないか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 閉じられているか
    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// このキューを消費するワーカースレッドを起動する
    ///
    /// ワーカーはキューが閉じられ、残りを処理し終えたところで終了する。
    pub fn spawn_worker<F>(self: &Arc<Self>, name: &str, mut handler: F) -> io::Result<JoinHandle<()>>
    where
        F: FnMut(T) + Send + 'static,
    {
        let queue = Arc::clone(self);
        thread::Builder::new().name(name.to_string()).spawn(move || {
            while let Some(item) = queue.next() {
                handler(item);
            }
            tracing::trace!("work queue drained, worker exiting");
        })
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let q = WorkQueue::new();
        for i in 0..5 {
            assert!(q.enqueue(i));
        }
        assert_eq!(q.len(), 5);
        let got: Vec<i32> = (0..5).filter_map(|_| q.next()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_enqueue_after_close_rejected() {
        let q = WorkQueue::new();
        q.enqueue(1);
        q.close();
        assert!(!q.enqueue(2), "閉じた後の投入は拒否されるべき");
        // 閉じる前に積まれた作業は取り出せる
        assert_eq!(q.next(), Some(1));
        assert_eq!(q.next(), None);
        assert_eq!(q.next(), None, "取り出し終えた後も None を返し続ける");
        assert!(q.is_closed());
        assert!(q.is_empty());
    }

    #[test]
    fn test_close_with_concurrent_producers() {
        let q = Arc::new(WorkQueue::new());
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || (0..500u32).filter(|i| q.enqueue(p * 1000 + i)).count())
            })
            .collect();
        thread::sleep(Duration::from_millis(1));
        q.close();

        let accepted: usize = producers.into_iter().map(|h| h.join().unwrap()).sum();
        let mut drained = 0;
        while q.next().is_some() {
            drained += 1;
        }
        assert_eq!(drained, accepted, "受け付けた作業は close 後もすべて取り出せるべき");
    }

    #[test]
    fn test_worker_drains_before_exit() {
        let q = Arc::new(WorkQueue::new());
        let (tx, rx) = unbounded();
        let handle = q
            .spawn_worker("test-worker", move |item: u32| {
                tx.send(item).unwrap();
            })
            .unwrap();

        for i in 0..100u32 {
            q.enqueue(i);
        }
        q.close();
        handle.join().unwrap();

        let got: Vec<u32> = rx.try_iter().collect();
        assert_eq!(got, (0..100).collect::<Vec<_>>(), "閉じる前の作業はすべて処理されるべき");
    }

    #[test]
    fn test_next_blocks_until_enqueue() {
        let q = Arc::new(WorkQueue::new());
        let (tx, rx) = unbounded();
        let worker = Arc::clone(&q);
        let handle = thread::spawn(move || {
            tx.send(worker.next()).unwrap();
        });

        // まだ何も積んでいないので取り出せない
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        q.enqueue("wake");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some("wake"));
        handle.join().unwrap();
    }
}
