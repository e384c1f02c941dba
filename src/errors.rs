// Copyright (c) 2025, vistone
// All rights reserved.

use crate::driver::DriverError;
use std::time::Duration;
use thiserror::Error;

/// 连接池相关错误定义
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("连接池已关闭")]
    PoolClosed,

    #[error(
        "获取连接超时（超时 {timeout:?}，已等待 {waited:?}，活跃 {active}，空闲 {idle}，总数 {total}，等待线程 {waiting}，最近创建失败: {}）",
        .last_failure.as_deref().unwrap_or("无")
    )]
    GetConnectionTimeout {
        timeout: Duration,
        waited: Duration,
        active: usize,
        idle: usize,
        total: usize,
        waiting: usize,
        last_failure: Option<String>,
    },

    #[error("连接池处于挂起状态且在 {timeout:?} 内未恢复")]
    PoolSuspendedTimeout { timeout: Duration },

    #[error("连接池未启用挂起功能")]
    SuspensionNotAllowed,

    #[error("连接已归还，禁止继续使用")]
    ConnectionClosed,

    #[error("创建连接失败: {reason}")]
    CreateConnectionFailed { reason: String },

    #[error("配置参数无效: {reason}")]
    InvalidConfig { reason: String },

    #[error("驱动错误: {0}")]
    Driver(#[from] DriverError),
}

impl PartialEq for PoolError {
    fn eq(&self, other: &Self) -> bool {
        // 只比较错误种类，携带的诊断信息不参与相等判断
        match (self, other) {
            (Self::PoolClosed, Self::PoolClosed) => true,
            (Self::GetConnectionTimeout { .. }, Self::GetConnectionTimeout { .. }) => true,
            (Self::PoolSuspendedTimeout { .. }, Self::PoolSuspendedTimeout { .. }) => true,
            (Self::SuspensionNotAllowed, Self::SuspensionNotAllowed) => true,
            (Self::ConnectionClosed, Self::ConnectionClosed) => true,
            (Self::CreateConnectionFailed { .. }, Self::CreateConnectionFailed { .. }) => true,
            (Self::InvalidConfig { .. }, Self::InvalidConfig { .. }) => true,
            (Self::Driver(_), Self::Driver(_)) => true,
            _ => false,
        }
    }
}

/// 连接池相关错误类型别名
pub type Result<T> = std::result::Result<T, PoolError>;
