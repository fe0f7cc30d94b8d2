//! 使用计数与等待策略
//!
//! 注销服务、移除监听器或钩子时需要等待“正在使用”的计数归零。
//! 这些计数与注册表的全局锁分离，等待方只阻塞在单个条目的条件变量上。

use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

/// 等待策略
///
/// 等待期间每隔 `warn_interval` 输出一次告警；超过 `max_wait` 后放弃等待
/// 并继续执行（`None` 表示无限等待）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// 告警间隔
    pub warn_interval: Duration,
    /// 等待上限
    pub max_wait: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            warn_interval: Duration::from_secs(5),
            max_wait: Some(Duration::from_secs(30)),
        }
    }
}

impl WaitPolicy {
    /// 无限等待（仅周期性告警）
    pub fn unbounded(warn_interval: Duration) -> Self {
        Self {
            warn_interval,
            max_wait: None,
        }
    }
}

/// 可等待归零的计数器
#[derive(Debug, Default)]
pub struct UseCounter {
    count: Mutex<usize>,
    changed: Condvar,
}

impl UseCounter {
    /// 创建计数器
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前计数
    pub fn get(&self) -> usize {
        *self.count.lock()
    }

    /// 计数加一
    pub fn increment(&self) {
        *self.count.lock() += 1;
    }

    /// 计数减一并唤醒等待者
    pub fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        self.changed.notify_all();
    }

    /// 计数加一，返回的守卫被丢弃时减一
    pub(crate) fn enter(&self) -> UseGuard<'_> {
        self.increment();
        UseGuard { counter: self }
    }

    /// 等待计数不超过 `at_most`
    ///
    /// 返回 `false` 表示超过等待上限后被强制放行。
    pub fn wait_until(&self, at_most: usize, policy: &WaitPolicy, what: &str) -> bool {
        let started = Instant::now();
        let warn_interval = policy.warn_interval.max(Duration::from_millis(1));
        let mut next_warn = started + warn_interval;
        let mut count = self.count.lock();

        while *count > at_most {
            let now = Instant::now();
            if let Some(max_wait) = policy.max_wait {
                if now.duration_since(started) >= max_wait {
                    error!(
                        target: "chips_bundle::service",
                        what,
                        count = *count,
                        waited_ms = now.duration_since(started).as_millis() as u64,
                        "等待超过上限，强制继续"
                    );
                    return false;
                }
            }
            if now >= next_warn {
                warn!(
                    target: "chips_bundle::service",
                    what,
                    count = *count,
                    waited_ms = now.duration_since(started).as_millis() as u64,
                    "仍在等待使用计数归零"
                );
                next_warn = now + warn_interval;
            }

            let mut deadline = next_warn;
            if let Some(max_wait) = policy.max_wait {
                deadline = deadline.min(started + max_wait);
            }
            self.changed.wait_until(&mut count, deadline);
        }
        true
    }
}

/// [`UseCounter::enter`] 返回的守卫
pub(crate) struct UseGuard<'a> {
    counter: &'a UseCounter,
}

impl Drop for UseGuard<'_> {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}

/// 带使用计数的条目
pub(crate) trait Counted {
    fn use_counter(&self) -> &UseCounter;
}

/// 持有期间保持条目使用计数加一，丢弃时自动减一
pub(crate) struct InUse<T: Counted> {
    entry: Arc<T>,
}

impl<T: Counted> InUse<T> {
    pub(crate) fn acquire(entry: &Arc<T>) -> Self {
        entry.use_counter().increment();
        Self {
            entry: Arc::clone(entry),
        }
    }
}

impl<T: Counted> Deref for InUse<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.entry
    }
}

impl<T: Counted> Drop for InUse<T> {
    fn drop(&mut self) {
        self.entry.use_counter().decrement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_returns_when_drained() {
        let counter = Arc::new(UseCounter::new());
        counter.increment();
        counter.increment();

        let c = Arc::clone(&counter);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c.decrement();
            c.decrement();
        });

        assert!(counter.wait_until(0, &WaitPolicy::default(), "test"));
        assert_eq!(counter.get(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_forced_after_max_wait() {
        let counter = UseCounter::new();
        counter.increment();
        let policy = WaitPolicy {
            warn_interval: Duration::from_millis(10),
            max_wait: Some(Duration::from_millis(50)),
        };

        let started = Instant::now();
        assert!(!counter.wait_until(0, &policy, "stuck"));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn test_wait_allows_own_share() {
        let counter = UseCounter::new();
        counter.increment();
        assert!(counter.wait_until(1, &WaitPolicy::default(), "self"));
    }

    #[test]
    fn test_in_use_guard_decrements_on_drop() {
        struct Entry(UseCounter);
        impl Counted for Entry {
            fn use_counter(&self) -> &UseCounter {
                &self.0
            }
        }

        let entry = Arc::new(Entry(UseCounter::new()));
        {
            let _a = InUse::acquire(&entry);
            let _b = InUse::acquire(&entry);
            assert_eq!(entry.0.get(), 2);
        }
        assert_eq!(entry.0.get(), 0);
    }

    #[test]
    fn test_enter_guard_is_scoped() {
        let counter = UseCounter::new();
        {
            let _outer = counter.enter();
            let _inner = counter.enter();
            assert_eq!(counter.get(), 2);
        }
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_decrement_saturates() {
        let counter = UseCounter::new();
        counter.decrement();
        assert_eq!(counter.get(), 0);
    }
}
