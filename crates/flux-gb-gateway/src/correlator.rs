//! 异步应答关联器
//!
//! 设备对查询（如录像检索）的应答以独立的 MESSAGE 异步到达，可能分多包；
//! 以 SN 为键把应答交给发起查询时登记的回调，由回调决定是否已收齐。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// 等待下限
pub const MIN_WAIT: Duration = Duration::from_secs(5);
/// 等待上限
pub const MAX_WAIT: Duration = Duration::from_secs(60);

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// 回调报告已收齐
    Complete,
    /// 截止时间到，未收齐
    TimedOut,
}

type EventHandler<P> = Box<dyn FnMut(P) -> bool + Send>;

struct Entry<P> {
    on_event: EventHandler<P>,
    done: Arc<Notify>,
    complete: bool,
}

/// SN -> 回调
pub struct ResponseCorrelator<P> {
    next_token: AtomicU32,
    entries: Mutex<HashMap<u32, Entry<P>>>,
    min_wait: Duration,
    max_wait: Duration,
}

impl<P: Send + 'static> ResponseCorrelator<P> {
    pub fn new() -> Self {
        Self::with_bounds(MIN_WAIT, MAX_WAIT)
    }

    pub fn with_bounds(min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            next_token: AtomicU32::new(1),
            entries: Mutex::new(HashMap::new()),
            min_wait,
            max_wait: max_wait.max(min_wait),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Entry<P>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 分配 SN，跳过 0 和仍在等待中的值
    pub fn new_token(&self) -> u32 {
        loop {
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            if token != 0 && !self.entries().contains_key(&token) {
                return token;
            }
        }
    }

    /// 登记回调；回调对每个匹配应答调用一次，返回 true 表示已收齐
    pub fn register(&self, token: u32, on_event: impl FnMut(P) -> bool + Send + 'static) {
        self.entries().insert(
            token,
            Entry {
                on_event: Box::new(on_event),
                done: Arc::new(Notify::new()),
                complete: false,
            },
        );
    }

    /// 登记一个把应答折叠进列表的回调
    pub fn accumulate<T, F>(&self, token: u32, mut fold: F) -> Accumulator<T>
    where
        T: Send + 'static,
        F: FnMut(P, &mut Vec<T>) -> bool + Send + 'static,
    {
        let items = Arc::new(Mutex::new(Vec::new()));
        let sink = items.clone();
        self.register(token, move |payload| {
            let mut items = sink.lock().unwrap_or_else(|e| e.into_inner());
            fold(payload, &mut items)
        });
        Accumulator { items }
    }

    /// 信令接收路径调用；未登记的 SN 直接丢弃。不阻塞。
    pub fn dispatch(&self, token: u32, payload: P) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&token) else {
            tracing::debug!(target: "gb_gateway", sn = token, "Dropped response for unknown SN");
            return false;
        };

        if entry.complete {
            return false;
        }

        if (entry.on_event)(payload) {
            entry.complete = true;
            entry.done.notify_one();
        }
        true
    }

    /// 将调用方给出的超时限制在 [min_wait, max_wait]
    pub fn clamp(&self, requested: Duration) -> Duration {
        requested.clamp(self.min_wait, self.max_wait)
    }

    /// 等待回调报告收齐或超时；返回时移除登记
    pub async fn wait(&self, token: u32, requested: Duration) -> Completion {
        let timeout = self.clamp(requested);

        let done = match self.entries().get(&token) {
            Some(entry) => entry.done.clone(),
            None => return Completion::TimedOut,
        };

        let result = match tokio::time::timeout(timeout, done.notified()).await {
            Ok(()) => Completion::Complete,
            Err(_) => Completion::TimedOut,
        };

        self.entries().remove(&token);
        result
    }

    /// 发送失败时撤销登记
    pub fn cancel(&self, token: u32) {
        self.entries().remove(&token);
    }

    pub fn pending(&self) -> usize {
        self.entries().len()
    }
}

impl<P: Send + 'static> Default for ResponseCorrelator<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// accumulate 登记的累积结果
pub struct Accumulator<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Accumulator<T> {
    pub fn into_items(self) -> Vec<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *items)
    }
}
