// Copyright (c) 2025, vistone
// All rights reserved.

//! dbconnpool 高性能数据库连接池
//!
//! 在多个并发借出者之间代理一组有上限、可复用的数据库连接，
//! 以最小的交接延迟执行超时、容量、空闲/寿命上限与有效性检查。
//!
//! 核心组成：
//! - [`bag::ConcurrentBag`]：并发借还容器，线程本地优先、交接队列直递；
//! - [`entry::PoolEntry`]：条目状态机（not-in-use / in-use / removed / reserved）；
//! - [`Pool`]：公开入口，负责准入、创建、驱逐、挂起/恢复与后台维护。
//!
//! # 示例
//! ```rust,no_run
//! use dbconnpool::{default_config, DatabaseConnection, DriverError, IsolationLevel, Pool};
//! use std::time::Duration;
//!
//! struct MyConnection;
//!
//! impl DatabaseConnection for MyConnection {
//!     fn is_valid(&mut self, _timeout: Duration) -> Result<bool, DriverError> {
//!         Ok(true)
//!     }
//!     fn execute(&mut self, _sql: &str) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//!     fn network_timeout(&self) -> Result<Duration, DriverError> {
//!         Ok(Duration::ZERO)
//!     }
//!     fn set_network_timeout(&mut self, _timeout: Duration) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//!     fn set_auto_commit(&mut self, _on: bool) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//!     fn set_read_only(&mut self, _on: bool) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//!     fn set_transaction_isolation(&mut self, _level: IsolationLevel) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//!     fn set_catalog(&mut self, _catalog: &str) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//!     fn close(&mut self) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//! }
//!
//! let mut config = default_config();
//! config.maximum_pool_size = 5;
//! config.factory = Some(Box::new(|| Ok(Box::new(MyConnection))));
//!
//! let pool = Pool::new(config).unwrap();
//! let conn = pool.get_connection().unwrap();
//! conn.execute("SELECT 1").unwrap();
//! drop(conn); // 自动归还
//! pool.close().unwrap();
//! ```

pub mod bag;
pub mod clock;
pub mod config;
pub mod driver;
pub mod entry;
pub mod errors;
pub mod leak;
pub mod pool;
pub mod proxy;
pub mod state;
pub mod stats;

pub use clock::{ClockSource, ManualClock, MonotonicClock};
pub use config::{default_config, Config};
pub use driver::{
    parse_isolation_level, ConnectionFactory, DatabaseConnection, DriverError, IsolationLevel,
};
pub use errors::{PoolError, Result};
pub use pool::Pool;
pub use proxy::PooledConnection;
pub use state::EntryState;
pub use stats::Stats;
