// Copyright (c) 2025, vistone
// All rights reserved.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Stats 连接池统计信息
#[derive(Debug, Clone)]
pub struct Stats {
    /// TotalConnectionsCreated 累计创建的连接数
    pub total_connections_created: i64,
    /// TotalConnectionsClosed 累计关闭的连接数
    pub total_connections_closed: i64,
    /// TotalCreationFailures 累计创建失败次数
    pub total_creation_failures: i64,

    /// TotalGetRequests 累计获取连接请求数
    pub total_get_requests: i64,
    /// SuccessfulGets 成功获取连接数
    pub successful_gets: i64,
    /// FailedGets 失败获取连接数
    pub failed_gets: i64,
    /// TimeoutGets 超时获取连接数
    pub timeout_gets: i64,

    /// ValidationFailures 有效性探测失败次数
    pub validation_failures: i64,
    /// MaxLifetimeEvictions 因寿命到期被驱逐的连接数
    pub max_lifetime_evictions: i64,
    /// IdleEvictions 因空闲超时被驱逐的连接数
    pub idle_evictions: i64,
    /// SoftEvictions 被软驱逐标记后回收的连接数
    pub soft_evictions: i64,
    /// LeakWarnings 泄漏警告次数
    pub leak_warnings: i64,

    /// AverageWaitTime 平均获取连接等待时间
    pub average_wait_time: Duration,
    /// TotalWaitTime 总获取连接等待时间
    pub total_wait_time: Duration,
    /// AverageUsageTime 平均连接借用时长
    pub average_usage_time: Duration,

    /// LastUpdateTime 最后更新时间
    pub last_update_time: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            total_connections_created: 0,
            total_connections_closed: 0,
            total_creation_failures: 0,
            total_get_requests: 0,
            successful_gets: 0,
            failed_gets: 0,
            timeout_gets: 0,
            validation_failures: 0,
            max_lifetime_evictions: 0,
            idle_evictions: 0,
            soft_evictions: 0,
            leak_warnings: 0,
            average_wait_time: Duration::ZERO,
            total_wait_time: Duration::ZERO,
            average_usage_time: Duration::ZERO,
            last_update_time: Instant::now(),
        }
    }
}

/// StatsCollector 统计收集器
pub struct StatsCollector {
    total_connections_created: AtomicI64,
    total_connections_closed: AtomicI64,
    total_creation_failures: AtomicI64,
    total_get_requests: AtomicI64,
    successful_gets: AtomicI64,
    failed_gets: AtomicI64,
    timeout_gets: AtomicI64,
    validation_failures: AtomicI64,
    max_lifetime_evictions: AtomicI64,
    idle_evictions: AtomicI64,
    soft_evictions: AtomicI64,
    leak_warnings: AtomicI64,
    total_wait_time: AtomicU64,  // 纳秒
    total_usage_time: AtomicU64, // 毫秒
    usage_samples: AtomicI64,
    last_update_time: RwLock<Instant>,
}

impl StatsCollector {
    /// NewStatsCollector 创建统计收集器
    pub fn new() -> Self {
        Self {
            total_connections_created: AtomicI64::new(0),
            total_connections_closed: AtomicI64::new(0),
            total_creation_failures: AtomicI64::new(0),
            total_get_requests: AtomicI64::new(0),
            successful_gets: AtomicI64::new(0),
            failed_gets: AtomicI64::new(0),
            timeout_gets: AtomicI64::new(0),
            validation_failures: AtomicI64::new(0),
            max_lifetime_evictions: AtomicI64::new(0),
            idle_evictions: AtomicI64::new(0),
            soft_evictions: AtomicI64::new(0),
            leak_warnings: AtomicI64::new(0),
            total_wait_time: AtomicU64::new(0),
            total_usage_time: AtomicU64::new(0),
            usage_samples: AtomicI64::new(0),
            last_update_time: RwLock::new(Instant::now()),
        }
    }

    /// IncrementTotalConnectionsCreated 增加创建连接计数
    pub fn increment_total_connections_created(&self) {
        self.total_connections_created
            .fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementTotalConnectionsClosed 增加关闭连接计数
    pub fn increment_total_connections_closed(&self) {
        self.total_connections_closed.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementCreationFailures 增加创建失败计数
    pub fn increment_creation_failures(&self) {
        self.total_creation_failures.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementTotalGetRequests 增加获取请求计数
    pub fn increment_total_get_requests(&self) {
        self.total_get_requests.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementSuccessfulGets 增加成功获取计数
    pub fn increment_successful_gets(&self) {
        self.successful_gets.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementFailedGets 增加失败获取计数
    pub fn increment_failed_gets(&self) {
        self.failed_gets.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementTimeoutGets 增加超时获取计数
    pub fn increment_timeout_gets(&self) {
        self.timeout_gets.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementValidationFailures 增加探测失败计数
    pub fn increment_validation_failures(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementMaxLifetimeEvictions 增加寿命到期驱逐计数
    pub fn increment_max_lifetime_evictions(&self) {
        self.max_lifetime_evictions.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementIdleEvictions 增加空闲超时驱逐计数
    pub fn increment_idle_evictions(&self) {
        self.idle_evictions.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementSoftEvictions 增加软驱逐计数
    pub fn increment_soft_evictions(&self) {
        self.soft_evictions.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// IncrementLeakWarnings 增加泄漏警告计数
    pub fn increment_leak_warnings(&self) {
        self.leak_warnings.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// RecordWaitTime 记录一次成功获取的等待时间
    pub fn record_wait_time(&self, duration: Duration) {
        self.total_wait_time
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.update_time();
    }

    /// RecordUsageTime 记录一次借用时长（毫秒）
    pub fn record_usage_time(&self, millis: u64) {
        self.total_usage_time.fetch_add(millis, Ordering::Relaxed);
        self.usage_samples.fetch_add(1, Ordering::Relaxed);
        self.update_time();
    }

    /// GetStats 获取当前统计信息快照
    pub fn get_stats(&self) -> Stats {
        let successful = self.successful_gets.load(Ordering::Relaxed);
        let total_wait_nanos = self.total_wait_time.load(Ordering::Relaxed);
        let average_wait = if successful > 0 {
            Duration::from_nanos(total_wait_nanos / successful as u64)
        } else {
            Duration::ZERO
        };
        let usage_samples = self.usage_samples.load(Ordering::Relaxed);
        let average_usage = if usage_samples > 0 {
            Duration::from_millis(self.total_usage_time.load(Ordering::Relaxed) / usage_samples as u64)
        } else {
            Duration::ZERO
        };

        Stats {
            total_connections_created: self.total_connections_created.load(Ordering::Relaxed),
            total_connections_closed: self.total_connections_closed.load(Ordering::Relaxed),
            total_creation_failures: self.total_creation_failures.load(Ordering::Relaxed),
            total_get_requests: self.total_get_requests.load(Ordering::Relaxed),
            successful_gets: successful,
            failed_gets: self.failed_gets.load(Ordering::Relaxed),
            timeout_gets: self.timeout_gets.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            max_lifetime_evictions: self.max_lifetime_evictions.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
            soft_evictions: self.soft_evictions.load(Ordering::Relaxed),
            leak_warnings: self.leak_warnings.load(Ordering::Relaxed),
            average_wait_time: average_wait,
            total_wait_time: Duration::from_nanos(total_wait_nanos),
            average_usage_time: average_usage,
            last_update_time: *self.last_update_time.read().unwrap_or_else(|e| e.into_inner()),
        }
    }

    fn update_time(&self) {
        // 使用 try_write 避免在高并发下阻塞；拿不到锁说明别的线程正在更新
        if let Ok(mut last_time) = self.last_update_time.try_write() {
            let now = Instant::now();
            // 降低更新频率，每100ms更新一次
            if now.duration_since(*last_time) >= Duration::from_millis(100) {
                *last_time = now;
            }
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
