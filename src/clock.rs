// Copyright (c) 2025, vistone
// All rights reserved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// ClockSource 单调时钟源
/// 连接池内所有时间戳（创建时间、最后归还时间、寿命上限）都来自此接口，
/// 以毫秒为单位；绝不使用挂钟时间计算时长。
/// 测试可以注入 [`ManualClock`] 来模拟时间流逝与时钟跳变。
pub trait ClockSource: Send + Sync {
    /// current_time 当前时刻（毫秒）
    fn current_time(&self) -> u64;
}

/// MonotonicClock 默认时钟源
/// 基于 `std::time::Instant`，以进程内某一固定起点为零点。
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// new 创建默认时钟源
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    fn current_time(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// ManualClock 手动时钟源（测试用）
/// 时间只在调用 `advance`/`set` 时变化，可用来模拟时钟前跳和回拨。
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// new 从指定毫秒时刻开始
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// advance 前进指定毫秒
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// set 直接设置当前时刻（可用于模拟回拨）
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn current_time(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let t1 = clock.current_time();
        thread::sleep(Duration::from_millis(20));
        let t2 = clock.current_time();
        assert!(t2 >= t1 + 10);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.current_time(), 1000);
        clock.advance(500);
        assert_eq!(clock.current_time(), 1500);
        clock.set(100); // 回拨
        assert_eq!(clock.current_time(), 100);
    }
}
