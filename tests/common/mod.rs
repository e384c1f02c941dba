// Copyright (c) 2025, vistone
// All rights reserved.

// 集成测试共用的内存驱动桩：可注入创建失败、探测结果与能力缺失，
// 每条连接的会话状态通过共享句柄暴露给测试断言。

use dbconnpool::{ConnectionFactory, DatabaseConnection, DriverError, IsolationLevel};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// ConnState 单条连接的可观测状态
pub struct ConnState {
    pub serial: usize,
    pub busy: AtomicBool,
    pub closed: AtomicBool,
    pub auto_commit: AtomicBool,
    pub read_only: AtomicBool,
    pub isolation: Mutex<Option<IsolationLevel>>,
    pub catalog: Mutex<Option<String>>,
    pub network_timeout: Mutex<Duration>,
    pub executed: Mutex<Vec<String>>,
}

/// TestDriver 驱动桩的共享控制面
pub struct TestDriver {
    /// 前 N 次创建失败
    pub fail_connects: AtomicUsize,
    /// is_valid / 测试语句返回失败
    pub fail_validation: AtomicBool,
    /// 驱动是否支持 is_valid
    pub supports_is_valid: AtomicBool,
    /// 同一连接被并发驱动的次数（必须恒为 0）
    pub double_use: AtomicUsize,
    /// 全部已创建连接的状态句柄，按创建顺序排列
    pub connections: Mutex<Vec<Arc<ConnState>>>,
}

impl TestDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_connects: AtomicUsize::new(0),
            fail_validation: AtomicBool::new(false),
            supports_is_valid: AtomicBool::new(true),
            double_use: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// factory 构造连接池可用的创建函数
    pub fn factory(self: &Arc<Self>) -> ConnectionFactory {
        let driver = self.clone();
        Box::new(move || {
            if driver
                .fail_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "模拟连接失败",
                )) as Box<dyn std::error::Error + Send + Sync>);
            }
            let mut connections = driver.connections.lock().unwrap();
            let state = Arc::new(ConnState {
                serial: connections.len(),
                busy: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                auto_commit: AtomicBool::new(true),
                read_only: AtomicBool::new(false),
                isolation: Mutex::new(None),
                catalog: Mutex::new(None),
                network_timeout: Mutex::new(Duration::ZERO),
                executed: Mutex::new(Vec::new()),
            });
            connections.push(state.clone());
            Ok(Box::new(TestConnection {
                driver: driver.clone(),
                state,
            }) as Box<dyn DatabaseConnection>)
        })
    }

    /// created 累计创建的连接数
    pub fn created(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// closed 累计关闭的连接数
    pub fn closed(&self) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|state| state.closed.load(Ordering::SeqCst))
            .count()
    }
}

/// TestConnection 内存连接桩
pub struct TestConnection {
    driver: Arc<TestDriver>,
    pub state: Arc<ConnState>,
}

impl TestConnection {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Database {
                sql_state: "08003".to_string(),
                message: "连接已关闭".to_string(),
            });
        }
        Ok(())
    }
}

impl DatabaseConnection for TestConnection {
    fn is_valid(&mut self, _timeout: Duration) -> Result<bool, DriverError> {
        self.ensure_open()?;
        if !self.driver.supports_is_valid.load(Ordering::SeqCst) {
            return Err(DriverError::Unsupported("is_valid"));
        }
        Ok(!self.driver.fail_validation.load(Ordering::SeqCst))
    }

    fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        self.ensure_open()?;
        // 双重借出检测：同一条底层连接绝不应被两个借出者同时驱动
        if self.state.busy.swap(true, Ordering::SeqCst) {
            self.driver.double_use.fetch_add(1, Ordering::SeqCst);
        }
        self.state
            .executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sql.to_string());
        std::thread::yield_now();
        self.state.busy.store(false, Ordering::SeqCst);
        if self.driver.fail_validation.load(Ordering::SeqCst) {
            return Err(DriverError::Database {
                sql_state: "08006".to_string(),
                message: "模拟探测失败".to_string(),
            });
        }
        Ok(())
    }

    fn network_timeout(&self) -> Result<Duration, DriverError> {
        Ok(*self
            .state
            .network_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner()))
    }

    fn set_network_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.ensure_open()?;
        *self
            .state
            .network_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = timeout;
        Ok(())
    }

    fn set_auto_commit(&mut self, on: bool) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.state.auto_commit.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn set_read_only(&mut self, on: bool) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.state.read_only.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<(), DriverError> {
        self.ensure_open()?;
        *self
            .state
            .isolation
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(level);
        Ok(())
    }

    fn set_catalog(&mut self, catalog: &str) -> Result<(), DriverError> {
        self.ensure_open()?;
        *self.state.catalog.lock().unwrap_or_else(|e| e.into_inner()) = Some(catalog.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
