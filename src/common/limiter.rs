//! 并发限制器
//!
//! 计数器 + FIFO 等待队列：
//! 1. 有空闲槽位且无人排队时直接获得
//! 2. 否则进入队尾，等待释放者把槽位直接交给队首
//! 3. 交接时持有数不变，只有队列为空时才递减
//!
//! 所有状态变更都在一次短暂的加锁内完成，锁不会跨越 await

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug)]
struct LimiterState {
    /// 当前持有槽位的数量
    holders: usize,
    /// 槽位上限
    max: usize,
    /// 等待队列（队首最先获得）
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// 并发限制器
///
/// 发布器与健康探测共用一个实例，限制同时进行的网络操作数
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    state: Arc<Mutex<LimiterState>>,
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                holders: 0,
                max: max.max(1),
                waiters: VecDeque::new(),
            })),
        }
    }

    /// 获取一个槽位，没有空闲槽位时挂起直到轮到自己
    pub async fn acquire(&self) -> LimiterPermit {
        loop {
            let rx = match self.enqueue() {
                Ok(permit) => return permit,
                Err(rx) => rx,
            };

            let mut waiter = PendingWaiter {
                rx,
                limiter: self,
                granted: false,
            };

            if (&mut waiter.rx).await.is_ok() {
                waiter.granted = true;
                return LimiterPermit::new(self.clone());
            }
            // 发送端被丢弃但未交接槽位，重新排队
        }
    }

    /// 非阻塞获取
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        let mut state = self.state.lock();
        state.waiters.retain(|tx| !tx.is_closed());
        if state.holders < state.max && state.waiters.is_empty() {
            state.holders += 1;
            drop(state);
            Some(LimiterPermit::new(self.clone()))
        } else {
            None
        }
    }

    fn enqueue(&self) -> Result<LimiterPermit, oneshot::Receiver<()>> {
        let mut state = self.state.lock();
        state.waiters.retain(|tx| !tx.is_closed());

        if state.holders < state.max && state.waiters.is_empty() {
            state.holders += 1;
            drop(state);
            return Ok(LimiterPermit::new(self.clone()));
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        debug!(
            "并发槽位已满，进入等待队列: holders={}, max={}, waiting={}",
            state.holders,
            state.max,
            state.waiters.len()
        );
        Err(rx)
    }

    /// 归还一个槽位：优先交给队首等待者
    fn release_slot(&self) {
        let mut state = self.state.lock();

        // 上限被调小后，多出的持有者直接退出
        if state.holders > state.max {
            state.holders -= 1;
            return;
        }

        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }

        state.holders = state.holders.saturating_sub(1);
    }

    /// 调整上限，调大时立即唤醒等待者
    pub fn set_max(&self, max: usize) {
        let mut state = self.state.lock();
        state.max = max.max(1);

        while state.holders < state.max {
            match state.waiters.pop_front() {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        state.holders += 1;
                    }
                }
                None => break,
            }
        }
    }

    pub fn max(&self) -> usize {
        self.state.lock().max
    }

    pub fn holders(&self) -> usize {
        self.state.lock().holders
    }

    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.max.saturating_sub(state.holders)
    }

    pub fn waiting(&self) -> usize {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

/// 排队中的等待者
///
/// 在等待期间被取消（future 被丢弃）时，如果槽位恰好已经交接过来，
/// 需要立刻归还，否则槽位会泄漏
struct PendingWaiter<'a> {
    rx: oneshot::Receiver<()>,
    limiter: &'a ConcurrencyLimiter,
    granted: bool,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.limiter.release_slot();
        }
    }
}

/// 槽位许可（RAII，drop 时自动归还）
#[derive(Debug)]
pub struct LimiterPermit {
    limiter: ConcurrencyLimiter,
    released: bool,
}

impl LimiterPermit {
    fn new(limiter: ConcurrencyLimiter) -> Self {
        Self {
            limiter,
            released: false,
        }
    }

    /// 显式归还
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.released = true;
            self.limiter.release_slot();
        }
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.do_release();
    }
}
