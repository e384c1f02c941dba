// Copyright (c) 2025, vistone
// All rights reserved.

use crate::clock::ClockSource;
use crate::driver::{ConnectionFactory, IsolationLevel};
use crate::errors::{PoolError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static POOL_NAME_GENERATOR: AtomicU64 = AtomicU64::new(1);

/// Config 连接池配置
pub struct Config {
    /// pool_name 连接池名称，用于线程命名、日志与管理注册
    /// 留空时自动生成 "dbpool-N"
    pub pool_name: String,

    /// maximum_pool_size 最大连接数，必须大于 0
    pub maximum_pool_size: usize,

    /// minimum_idle 空闲连接下限，后台维护负责补足
    /// None 表示与 maximum_pool_size 相同（固定大小池）
    pub minimum_idle: Option<usize>,

    /// connection_timeout 获取连接的超时时间（默认 30s，下限 250ms）
    pub connection_timeout: Duration,

    /// idle_timeout 空闲连接超时时间，超过后被驱逐；0 表示禁用
    pub idle_timeout: Duration,

    /// max_lifetime 连接最大生命周期，超过后被驱逐；0 表示禁用
    pub max_lifetime: Duration,

    /// validation_timeout 有效性探测超时时间（不得超过 connection_timeout）
    pub validation_timeout: Duration,

    /// leak_detection_threshold 泄漏检测阈值，0 表示禁用，否则不得低于 2s
    pub leak_detection_threshold: Duration,

    /// connection_test_query 有效性测试语句
    /// 驱动不支持 is_valid 时必须配置
    pub connection_test_query: Option<String>,

    /// connection_init_sql 新连接建立后执行的初始化语句
    pub connection_init_sql: Option<String>,

    /// allow_pool_suspension 是否允许挂起/恢复
    pub allow_pool_suspension: bool,

    /// register_mbeans 是否把池名称注册到进程级管理注册表
    pub register_mbeans: bool,

    /// housekeeping_period 后台维护周期（默认 30s）
    pub housekeeping_period: Duration,

    /// shutdown_drain_timeout 关闭时等待借出连接归还的上限（默认 10s）
    /// 超过后仍未归还的连接被强制关闭；0 表示不等待
    pub shutdown_drain_timeout: Duration,

    /// alive_bypass_window 归还后的探测豁免窗口（默认 500ms）
    /// 刚归还的连接在此窗口内再次借出时跳过有效性探测
    pub alive_bypass_window: Duration,

    /// auto_commit 连接默认自动提交状态
    pub auto_commit: bool,

    /// read_only 连接默认只读状态
    pub read_only: bool,

    /// transaction_isolation 连接默认事务隔离级别，None 表示沿用驱动默认
    pub transaction_isolation: Option<IsolationLevel>,

    /// catalog 连接默认 catalog，None 表示沿用驱动默认
    pub catalog: Option<String>,

    /// enable_stats 是否启用统计信息
    pub enable_stats: bool,

    /// factory 连接创建函数（必需）
    pub factory: Option<ConnectionFactory>,

    /// clock 时钟源覆盖，None 时使用单调时钟；测试用
    pub clock: Option<Arc<dyn ClockSource>>,
}

impl Default for Config {
    fn default() -> Self {
        default_config()
    }
}

/// default_config 返回默认配置
pub fn default_config() -> Config {
    Config {
        pool_name: String::new(),
        maximum_pool_size: 10,
        minimum_idle: None,
        connection_timeout: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(10 * 60),
        max_lifetime: Duration::from_secs(30 * 60),
        validation_timeout: Duration::from_secs(5),
        leak_detection_threshold: Duration::ZERO,
        connection_test_query: None,
        connection_init_sql: None,
        allow_pool_suspension: false,
        register_mbeans: false,
        housekeeping_period: Duration::from_secs(30),
        shutdown_drain_timeout: Duration::from_secs(10),
        alive_bypass_window: Duration::from_millis(500),
        auto_commit: true,
        read_only: false,
        transaction_isolation: None,
        catalog: None,
        enable_stats: true,
        factory: None,
        clock: None,
    }
}

impl Config {
    /// apply_defaults 补全缺省值
    pub fn apply_defaults(&mut self) {
        if self.pool_name.is_empty() {
            self.pool_name = format!(
                "dbpool-{}",
                POOL_NAME_GENERATOR.fetch_add(1, Ordering::Relaxed)
            );
        }
        if self.housekeeping_period.is_zero() {
            self.housekeeping_period = Duration::from_secs(30);
        }
    }

    /// validate 验证配置有效性
    /// 可安全纠正的越界值会被钳制并记录 WARN，真正非法的配置返回错误。
    pub fn validate(&mut self) -> Result<()> {
        if self.factory.is_none() {
            return Err(PoolError::InvalidConfig {
                reason: "必须提供 factory（连接创建函数）".to_string(),
            });
        }
        if self.maximum_pool_size == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "maximum_pool_size 必须大于 0".to_string(),
            });
        }
        if self.connection_timeout < Duration::from_millis(250) {
            return Err(PoolError::InvalidConfig {
                reason: "connection_timeout 不得低于 250ms".to_string(),
            });
        }
        if let Some(min_idle) = self.minimum_idle {
            if min_idle > self.maximum_pool_size {
                // 空闲下限不应超过最大连接数
                log::warn!(
                    "{}: minimum_idle({}) 超过 maximum_pool_size({})，已钳制",
                    self.pool_name,
                    min_idle,
                    self.maximum_pool_size
                );
                self.minimum_idle = Some(self.maximum_pool_size);
            }
        }
        if self.validation_timeout > self.connection_timeout {
            log::warn!(
                "{}: validation_timeout 超过 connection_timeout，已钳制",
                self.pool_name
            );
            self.validation_timeout = self.connection_timeout;
        }
        if self.validation_timeout < Duration::from_millis(250) {
            return Err(PoolError::InvalidConfig {
                reason: "validation_timeout 不得低于 250ms".to_string(),
            });
        }
        if !self.leak_detection_threshold.is_zero()
            && self.leak_detection_threshold < Duration::from_secs(2)
        {
            log::warn!(
                "{}: leak_detection_threshold 低于 2s，泄漏检测已禁用",
                self.pool_name
            );
            self.leak_detection_threshold = Duration::ZERO;
        }
        if !self.max_lifetime.is_zero() && self.max_lifetime < Duration::from_secs(30) {
            log::warn!("{}: max_lifetime 低于 30s，连接会被频繁重建", self.pool_name);
        }
        Ok(())
    }

    /// min_idle 解析后的空闲连接下限
    pub fn min_idle(&self) -> usize {
        self.minimum_idle.unwrap_or(self.maximum_pool_size)
    }
}
