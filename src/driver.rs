// Copyright (c) 2025, vistone
// All rights reserved.

use std::time::Duration;
use thiserror::Error;

/// 连接级致命错误的 SQLSTATE 固定集合（08 类之外）
const FATAL_SQL_STATES: [&str; 6] = ["57P01", "57P02", "57P03", "01002", "JZ0C0", "JZ0C1"];

/// DriverError 驱动侧错误
/// `Unsupported` 表示驱动缺少某能力（如 is_valid），连接池据此在整个
/// 生命周期内停用该能力；`Database` 携带 SQLSTATE，用于判定连接级致命错误。
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("驱动不支持 {0}")]
    Unsupported(&'static str),

    #[error("数据库错误 [{sql_state}]: {message}")]
    Database { sql_state: String, message: String },

    #[error("驱动IO错误: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// sql_state 返回错误携带的 SQLSTATE（若有）
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            DriverError::Database { sql_state, .. } => Some(sql_state),
            _ => None,
        }
    }

    /// is_connection_error 是否为连接级致命错误
    /// SQLSTATE 08 类（连接异常）或已知致命集合中的状态码视为致命，
    /// 此类错误发生后连接不可再复用。
    pub fn is_connection_error(&self) -> bool {
        match self {
            DriverError::Io(_) => true,
            DriverError::Database { sql_state, .. } => {
                sql_state.starts_with("08") || FATAL_SQL_STATES.contains(&sql_state.as_str())
            }
            DriverError::Unsupported(_) => false,
        }
    }
}

/// IsolationLevel 事务隔离级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// parse_isolation_level 从字符串解析隔离级别
pub fn parse_isolation_level(s: &str) -> Option<IsolationLevel> {
    match s.to_uppercase().replace('_', " ").as_str() {
        "READ UNCOMMITTED" => Some(IsolationLevel::ReadUncommitted),
        "READ COMMITTED" => Some(IsolationLevel::ReadCommitted),
        "REPEATABLE READ" => Some(IsolationLevel::RepeatableRead),
        "SERIALIZABLE" => Some(IsolationLevel::Serializable),
        _ => None,
    }
}

/// DatabaseConnection 底层数据库连接契约
/// 连接池对驱动完全不透明，只依赖此接口完成会话初始化、有效性探测、
/// 状态复位与关闭。所有调用都在调用者线程上执行。
pub trait DatabaseConnection: Send {
    /// is_valid 驱动自带的有效性探测，必须在 timeout 内返回
    fn is_valid(&mut self, timeout: Duration) -> std::result::Result<bool, DriverError>;

    /// execute 执行一条语句（用于 connection_test_query 与 connection_init_sql）
    fn execute(&mut self, sql: &str) -> std::result::Result<(), DriverError>;

    /// network_timeout 读取当前网络超时
    fn network_timeout(&self) -> std::result::Result<Duration, DriverError>;

    /// set_network_timeout 设置网络超时（探测期间临时收紧，之后恢复）
    fn set_network_timeout(&mut self, timeout: Duration) -> std::result::Result<(), DriverError>;

    /// set_auto_commit 设置自动提交
    fn set_auto_commit(&mut self, on: bool) -> std::result::Result<(), DriverError>;

    /// set_read_only 设置只读模式
    fn set_read_only(&mut self, on: bool) -> std::result::Result<(), DriverError>;

    /// set_transaction_isolation 设置事务隔离级别
    fn set_transaction_isolation(
        &mut self,
        level: IsolationLevel,
    ) -> std::result::Result<(), DriverError>;

    /// set_catalog 设置默认 catalog
    fn set_catalog(&mut self, catalog: &str) -> std::result::Result<(), DriverError>;

    /// close 关闭底层连接
    fn close(&mut self) -> std::result::Result<(), DriverError>;
}

/// ConnectionFactory 连接创建函数类型
/// 返回一条原始连接或错误；由使用方注入，连接池串行调用。
pub type ConnectionFactory = Box<
    dyn Fn() -> std::result::Result<
            Box<dyn DatabaseConnection>,
            Box<dyn std::error::Error + Send + Sync>,
        > + Send
        + Sync,
>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        let fatal = DriverError::Database {
            sql_state: "08006".to_string(),
            message: "connection failure".to_string(),
        };
        assert!(fatal.is_connection_error());

        let fatal_fixed = DriverError::Database {
            sql_state: "57P01".to_string(),
            message: "admin shutdown".to_string(),
        };
        assert!(fatal_fixed.is_connection_error());

        let benign = DriverError::Database {
            sql_state: "42601".to_string(),
            message: "syntax error".to_string(),
        };
        assert!(!benign.is_connection_error());

        assert!(!DriverError::Unsupported("is_valid").is_connection_error());
    }

    #[test]
    fn test_parse_isolation_level() {
        assert_eq!(
            parse_isolation_level("read committed"),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(
            parse_isolation_level("REPEATABLE_READ"),
            Some(IsolationLevel::RepeatableRead)
        );
        assert_eq!(parse_isolation_level("chaos"), None);
    }
}
