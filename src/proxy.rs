// Copyright (c) 2025, vistone
// All rights reserved.

use crate::bag::BagItem;
use crate::driver::{DriverError, IsolationLevel};
use crate::entry::PoolEntry;
use crate::errors::{PoolError, Result};
use crate::pool::PoolInner;
use crate::state::EntryState;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// 会话属性脏位：归还时只复位被改动过的属性
pub const DIRTY_BIT_READONLY: u8 = 0b0_0001;
pub const DIRTY_BIT_AUTOCOMMIT: u8 = 0b0_0010;
pub const DIRTY_BIT_ISOLATION: u8 = 0b0_0100;
pub const DIRTY_BIT_CATALOG: u8 = 0b0_1000;
pub const DIRTY_BIT_NETTIMEOUT: u8 = 0b1_0000;

/// PooledConnection 借出连接的代理包装器
///
/// 用户可见的 `close()`（或 Drop）不关闭底层连接，而是复位被改动的会话
/// 属性、撤销泄漏检测并把条目归还池中。归还之后任何操作都返回
/// [`PoolError::ConnectionClosed`]。
///
/// 任何携带连接级 SQLSTATE（08 类或既定致命集合）的驱动错误都会把条目
/// 标记为驱逐，归还时底层连接被关闭而不是复用。
pub struct PooledConnection {
    entry: Arc<PoolEntry>,
    pool: Weak<PoolInner>,
    closed: AtomicBool,
    dirty_bits: AtomicU8,
    // 代理视角的当前会话属性，借出时为池默认值
    auto_commit: AtomicBool,
    read_only: AtomicBool,
    isolation: Mutex<Option<IsolationLevel>>,
    catalog: Mutex<Option<String>>,
}

impl PooledConnection {
    pub(crate) fn new(
        entry: Arc<PoolEntry>,
        pool: Weak<PoolInner>,
        auto_commit: bool,
        read_only: bool,
        isolation: Option<IsolationLevel>,
        catalog: Option<String>,
    ) -> Self {
        Self {
            entry,
            pool,
            closed: AtomicBool::new(false),
            dirty_bits: AtomicU8::new(0),
            auto_commit: AtomicBool::new(auto_commit),
            read_only: AtomicBool::new(read_only),
            isolation: Mutex::new(isolation),
            catalog: Mutex::new(catalog),
        }
    }

    pub(crate) fn entry(&self) -> &Arc<PoolEntry> {
        &self.entry
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ConnectionClosed);
        }
        Ok(())
    }

    /// 致命错误把条目标记为驱逐，归还时连接被丢弃
    fn check_fatal(&self, err: &DriverError) {
        if err.is_connection_error() {
            self.entry.mark_evicted();
            log::warn!(
                "{} 发生连接级致命错误（{}），已标记驱逐",
                self.entry,
                err
            );
        }
    }

    fn with_connection<R>(
        &self,
        op: impl FnOnce(&mut dyn crate::driver::DatabaseConnection) -> std::result::Result<R, DriverError>,
    ) -> Result<R> {
        self.ensure_open()?;
        let mut guard = self.entry.connection();
        let conn = guard.as_mut().ok_or(PoolError::ConnectionClosed)?;
        match op(conn.as_mut()) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.check_fatal(&e);
                Err(e.into())
            }
        }
    }

    /// execute 执行一条语句
    pub fn execute(&self, sql: &str) -> Result<()> {
        self.with_connection(|conn| conn.execute(sql))
    }

    /// set_auto_commit 修改自动提交，归还时复位
    pub fn set_auto_commit(&self, on: bool) -> Result<()> {
        self.with_connection(|conn| conn.set_auto_commit(on))?;
        self.auto_commit.store(on, Ordering::Release);
        self.dirty_bits.fetch_or(DIRTY_BIT_AUTOCOMMIT, Ordering::AcqRel);
        Ok(())
    }

    /// auto_commit 当前自动提交状态
    pub fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::Acquire)
    }

    /// set_read_only 修改只读模式，归还时复位
    pub fn set_read_only(&self, on: bool) -> Result<()> {
        self.with_connection(|conn| conn.set_read_only(on))?;
        self.read_only.store(on, Ordering::Release);
        self.dirty_bits.fetch_or(DIRTY_BIT_READONLY, Ordering::AcqRel);
        Ok(())
    }

    /// read_only 当前只读状态
    pub fn read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// set_transaction_isolation 修改隔离级别，归还时复位
    pub fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.with_connection(|conn| conn.set_transaction_isolation(level))?;
        *self.isolation.lock().unwrap_or_else(|e| e.into_inner()) = Some(level);
        self.dirty_bits.fetch_or(DIRTY_BIT_ISOLATION, Ordering::AcqRel);
        Ok(())
    }

    /// set_catalog 修改默认 catalog，归还时复位
    pub fn set_catalog(&self, catalog: &str) -> Result<()> {
        self.with_connection(|conn| conn.set_catalog(catalog))?;
        *self.catalog.lock().unwrap_or_else(|e| e.into_inner()) = Some(catalog.to_string());
        self.dirty_bits.fetch_or(DIRTY_BIT_CATALOG, Ordering::AcqRel);
        Ok(())
    }

    /// transaction_isolation 当前隔离级别（None 表示沿用驱动默认）
    pub fn transaction_isolation(&self) -> Option<IsolationLevel> {
        *self.isolation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// catalog 当前 catalog（None 表示沿用驱动默认）
    pub fn catalog(&self) -> Option<String> {
        self.catalog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// set_network_timeout 修改网络超时，归还时复位
    pub fn set_network_timeout(&self, timeout: Duration) -> Result<()> {
        self.with_connection(|conn| conn.set_network_timeout(timeout))?;
        self.dirty_bits.fetch_or(DIRTY_BIT_NETTIMEOUT, Ordering::AcqRel);
        Ok(())
    }

    /// is_closed 代理是否已关闭
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// close 归还连接（幂等）
    /// 等价于 Drop，提供显式调用点。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.release();
    }

    fn release(&self) {
        let dirty_bits = self.dirty_bits.load(Ordering::Acquire);
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.entry.clone(), dirty_bits);
        } else {
            // 池已销毁：就地关闭底层连接
            self.entry.cancel_leak_task();
            if let Some(mut conn) = self.entry.take_connection() {
                let _ = conn.close();
            }
            self.entry.set_state(EntryState::Removed);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("entry", &self.entry.id())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("dirty_bits", &self.dirty_bits.load(Ordering::Relaxed))
            .finish()
    }
}
