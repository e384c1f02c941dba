// Copyright (c) 2025, vistone
// All rights reserved.

use crate::bag::ConcurrentBag;
use crate::clock::{ClockSource, MonotonicClock};
use crate::config::Config;
use crate::driver::{DatabaseConnection, DriverError};
use crate::entry::PoolEntry;
use crate::errors::{PoolError, Result};
use crate::leak::{LeakTask, LeakWatcher};
use crate::proxy::{
    PooledConnection, DIRTY_BIT_AUTOCOMMIT, DIRTY_BIT_CATALOG, DIRTY_BIT_ISOLATION,
    DIRTY_BIT_NETTIMEOUT, DIRTY_BIT_READONLY,
};
use crate::state::EntryState;
use crate::stats::{Stats, StatsCollector};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

// 池运行状态
const POOL_NORMAL: i32 = 0;
const POOL_SUSPENDED: i32 = 1;
const POOL_SHUTDOWN: i32 = 2;

// 创建失败的退避区间
const CREATION_BACKOFF_BASE: Duration = Duration::from_millis(250);
const CREATION_BACKOFF_CAP: Duration = Duration::from_secs(10);

// 时钟漂移容忍：回拨超过 128ms 或前跳超过维护周期加 15s 视为异常
const ALLOWED_CLOCK_DRIFT_MS: u64 = 128;
const FORWARD_JUMP_TOLERANCE_MS: u64 = 15_000;

// 进程级池名称注册表，注册/注销在锁内串行执行
static POOL_REGISTRY: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn register_pool(name: &str) {
    let mut registry = POOL_REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if registry.iter().any(|n| n == name) {
        log::warn!("池名称 {} 已被注册，监控输出将无法区分", name);
    } else {
        registry.push(name.to_string());
    }
}

fn unregister_pool(name: &str) {
    let mut registry = POOL_REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(pos) = registry.iter().position(|n| n == name) {
        registry.remove(pos);
    }
}

/// Pool 连接池
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

// 确保 Pool 和 PooledConnection 可以安全地跨线程使用
// 这些断言在编译期检查，如果类型不满足 Send + Sync 则编译失败
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Pool>();
    assert_send_sync::<PooledConnection>();
};

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.config.pool_name)
            .field("state", &self.inner.pool_state())
            .field("total", &self.inner.bag.len())
            .field("idle", &self.inner.bag.state_count(EntryState::NotInUse))
            .finish()
    }
}

pub(crate) struct PoolInner {
    config: Config,
    clock: Arc<dyn ClockSource>,
    bag: ConcurrentBag<PoolEntry>,
    state: AtomicI32,
    self_weak: Weak<PoolInner>,
    // 最近一次创建失败：(时刻, 描述)，超时错误中携带
    last_connection_failure: Mutex<Option<(u64, String)>>,
    // 挂起门闩：挂起期间新的获取请求在此阻塞
    suspend_lock: Mutex<()>,
    suspend_cv: Condvar,
    housekeeper_lock: Mutex<()>,
    housekeeper_cv: Condvar,
    add_tx: Sender<()>,
    close_tx: Sender<(Box<dyn DatabaseConnection>, String)>,
    leak_watcher: Option<LeakWatcher>,
    stats: Option<Arc<StatsCollector>>,
    // 驱动能力开关：首次失败后对整个池生命周期停用
    is_valid_supported: AtomicBool,
    network_timeout_supported: AtomicBool,
    previous_housekeeping_time: AtomicU64,
}

impl Pool {
    /// new 创建连接池
    ///
    /// # 参数
    /// - `config`: 连接池配置，必须包含有效的 factory（连接创建函数）
    ///
    /// # 返回值
    /// - `Ok(Pool)`: 成功创建连接池
    /// - `Err(PoolError)`: 配置无效或后台线程启动失败
    pub fn new(mut config: Config) -> Result<Self> {
        config.apply_defaults();
        config.validate()?;

        let clock: Arc<dyn ClockSource> = config
            .clock
            .clone()
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let stats = if config.enable_stats {
            Some(Arc::new(StatsCollector::new()))
        } else {
            None
        };
        let leak_watcher = if config.leak_detection_threshold.is_zero() {
            None
        } else {
            Some(LeakWatcher::new(
                config.pool_name.clone(),
                clock.clone(),
                stats.clone(),
            ))
        };

        // 创建队列有界：需求信号合并即可，积压没有意义
        let (add_tx, add_rx) = bounded::<()>(config.maximum_pool_size.max(1));
        let (close_tx, close_rx) = unbounded::<(Box<dyn DatabaseConnection>, String)>();

        if config.register_mbeans {
            register_pool(&config.pool_name);
        }

        let pool_name = config.pool_name.clone();
        let now = clock.current_time();
        let inner = Arc::new_cyclic(|self_weak| PoolInner {
            clock,
            bag: ConcurrentBag::new(),
            state: AtomicI32::new(POOL_NORMAL),
            self_weak: self_weak.clone(),
            last_connection_failure: Mutex::new(None),
            suspend_lock: Mutex::new(()),
            suspend_cv: Condvar::new(),
            housekeeper_lock: Mutex::new(()),
            housekeeper_cv: Condvar::new(),
            add_tx,
            close_tx,
            leak_watcher,
            stats,
            is_valid_supported: AtomicBool::new(true),
            network_timeout_supported: AtomicBool::new(true),
            previous_housekeeping_time: AtomicU64::new(now),
            config,
        });

        // 等待者出现时登记一次补充需求；worker 端再按容量与需求过滤
        {
            let weak = Arc::downgrade(&inner);
            inner.bag.set_add_listener(Box::new(move || {
                if let Some(pool) = weak.upgrade() {
                    pool.request_add();
                }
            }));
        }

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name(format!("{}-add-connection", pool_name))
            .spawn(move || Self::add_connection_worker(weak, add_rx))
            .map_err(|e| PoolError::CreateConnectionFailed {
                reason: format!("无法启动创建线程: {}", e),
            })?;

        let close_worker_name = pool_name.clone();
        thread::Builder::new()
            .name(format!("{}-close-connection", pool_name))
            .spawn(move || Self::close_connection_worker(close_rx, close_worker_name))
            .map_err(|e| PoolError::CreateConnectionFailed {
                reason: format!("无法启动关闭线程: {}", e),
            })?;

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name(format!("{}-housekeeper", pool_name))
            .spawn(move || Self::house_keeper(weak))
            .map_err(|e| PoolError::CreateConnectionFailed {
                reason: format!("无法启动维护线程: {}", e),
            })?;

        // 预热到空闲下限
        inner.fill_pool();

        Ok(Self { inner })
    }

    /// get_connection 获取一个连接，使用配置的 connection_timeout
    ///
    /// # 返回值
    /// - `Ok(PooledConnection)`: 成功借出，Drop 时自动归还
    /// - `Err(PoolError)`: 超时、池已关闭或挂起超时
    pub fn get_connection(&self) -> Result<PooledConnection> {
        self.inner.acquire(self.inner.config.connection_timeout)
    }

    /// get_connection_timeout 获取一个连接（带超时）
    pub fn get_connection_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        self.inner.acquire(timeout)
    }

    /// close 关闭连接池
    ///
    /// 停止接受新的获取请求，唤醒所有阻塞中的借出者，回收空闲连接，
    /// 在有限时间内等待借出连接归还后强制关闭剩余连接。幂等。
    pub fn close(&self) -> Result<()> {
        self.inner.shutdown()
    }

    /// is_closed 连接池是否已关闭
    pub fn is_closed(&self) -> bool {
        self.inner.pool_state() == POOL_SHUTDOWN
    }

    /// is_suspended 连接池是否处于挂起状态
    pub fn is_suspended(&self) -> bool {
        self.inner.pool_state() == POOL_SUSPENDED
    }

    /// suspend_pool 挂起连接池，新的获取请求阻塞直到恢复
    /// 仅在配置了 allow_pool_suspension 时可用。
    pub fn suspend_pool(&self) -> Result<()> {
        self.inner.suspend()
    }

    /// resume_pool 恢复挂起的连接池
    pub fn resume_pool(&self) -> Result<()> {
        self.inner.resume()
    }

    /// evict_connection 标记借出连接为待驱逐，归还时关闭而非复用
    pub fn evict_connection(&self, conn: &PooledConnection) {
        conn.entry().mark_evicted();
    }

    /// soft_evict_connections 软驱逐全部连接
    /// 空闲连接立即回收；使用中的连接在下次归还时回收，不打断使用者。
    pub fn soft_evict_connections(&self) {
        self.inner.soft_evict_all();
    }

    /// active_connections 当前借出的连接数
    pub fn active_connections(&self) -> usize {
        let total = self.inner.bag.len();
        total.saturating_sub(self.inner.bag.state_count(EntryState::NotInUse))
    }

    /// idle_connections 当前空闲连接数
    pub fn idle_connections(&self) -> usize {
        self.inner.bag.state_count(EntryState::NotInUse)
    }

    /// total_connections 当前连接总数
    pub fn total_connections(&self) -> usize {
        self.inner.bag.len()
    }

    /// threads_awaiting_connection 阻塞等待连接的线程数
    pub fn threads_awaiting_connection(&self) -> usize {
        self.inner.bag.waiting_thread_count()
    }

    /// last_connection_failure 最近一次创建失败的描述
    pub fn last_connection_failure(&self) -> Option<String> {
        self.inner.last_connection_failure()
    }

    /// stats 获取连接池统计信息快照
    /// 未启用统计时返回默认值（全为0）。
    pub fn stats(&self) -> Stats {
        match &self.inner.stats {
            Some(stats) => stats.get_stats(),
            None => Stats::default(),
        }
    }

    /// 创建线程：串行建立连接，避免冲击驱动；失败按指数退避重试
    fn add_connection_worker(inner: Weak<PoolInner>, rx: Receiver<()>) {
        let mut backoff = CREATION_BACKOFF_BASE;
        loop {
            if rx.recv().is_err() {
                return;
            }
            let pool = match inner.upgrade() {
                Some(p) => p,
                None => return,
            };
            if pool.pool_state() == POOL_SHUTDOWN {
                return;
            }
            if !pool.should_create() {
                continue;
            }
            match pool.create_entry() {
                Ok(entry) => {
                    backoff = CREATION_BACKOFF_BASE;
                    if pool.pool_state() == POOL_SHUTDOWN {
                        // 创建期间池已关闭，连接直接回收
                        if let Some(conn) = entry.take_connection() {
                            let _ = pool.close_tx.send((conn, "连接池关闭".to_string()));
                        }
                        return;
                    }
                    pool.bag.add(entry);
                }
                Err(e) => {
                    pool.record_connection_failure(&e);
                    drop(pool);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(CREATION_BACKOFF_CAP);
                    // 退避后重新登记需求，需求者可能仍在等待
                    if let Some(pool) = inner.upgrade() {
                        if pool.pool_state() != POOL_SHUTDOWN {
                            pool.request_add();
                        }
                    }
                }
            }
        }
    }

    /// 关闭线程：把底层连接的关闭移出调用路径
    fn close_connection_worker(
        rx: Receiver<(Box<dyn DatabaseConnection>, String)>,
        pool_name: String,
    ) {
        while let Ok((mut conn, reason)) = rx.recv() {
            // 关闭前收紧网络超时，避免卡在失联的连接上
            let _ = conn.set_network_timeout(Duration::from_secs(15));
            match conn.close() {
                Ok(()) => log::debug!("{}: 底层连接已关闭（{}）", pool_name, reason),
                Err(e) => log::debug!("{}: 关闭底层连接失败（{}）: {}", pool_name, reason, e),
            }
        }
    }

    /// 后台维护任务
    fn house_keeper(inner: Weak<PoolInner>) {
        loop {
            let pool = match inner.upgrade() {
                Some(p) => p,
                None => return, // Pool已销毁
            };
            if pool.pool_state() == POOL_SHUTDOWN {
                return;
            }

            let period = pool.config.housekeeping_period;

            // 使用 Condvar 等待，池关闭时可以立即被唤醒
            let guard = pool
                .housekeeper_lock
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let (guard, _timeout) = match pool.housekeeper_cv.wait_timeout(guard, period) {
                Ok(result) => result,
                Err(e) => e.into_inner(),
            };
            drop(guard);

            if pool.pool_state() == POOL_SHUTDOWN {
                return;
            }
            pool.housekeeping_tick();
            drop(pool);
        }
    }
}

impl PoolInner {
    fn pool_state(&self) -> i32 {
        self.state.load(Ordering::SeqCst)
    }

    fn request_add(&self) {
        let _ = self.add_tx.try_send(());
    }

    fn should_create(&self) -> bool {
        self.pool_state() == POOL_NORMAL
            && self.bag.len() < self.config.maximum_pool_size
            && (self.bag.waiting_thread_count() > 0
                || self.bag.state_count(EntryState::NotInUse) < self.config.min_idle())
    }

    fn acquire(&self, timeout: Duration) -> Result<PooledConnection> {
        if let Some(stats) = &self.stats {
            stats.increment_total_get_requests();
        }
        let start = Instant::now();

        loop {
            match self.pool_state() {
                POOL_SHUTDOWN => {
                    if let Some(stats) = &self.stats {
                        stats.increment_failed_gets();
                    }
                    return Err(PoolError::PoolClosed);
                }
                POOL_SUSPENDED => {
                    if let Err(e) = self.await_resume(start, timeout) {
                        if let Some(stats) = &self.stats {
                            stats.increment_failed_gets();
                            if matches!(e, PoolError::PoolSuspendedTimeout { .. }) {
                                stats.increment_timeout_gets();
                            }
                        }
                        return Err(e);
                    }
                    continue;
                }
                _ => {}
            }

            let elapsed = start.elapsed();
            let remaining = match timeout.checked_sub(elapsed) {
                Some(d) if !d.is_zero() => d,
                _ => return Err(self.timeout_error(timeout, elapsed)),
            };

            let entry = match self.bag.borrow(remaining) {
                Some(entry) => entry,
                None => continue,
            };

            let now = self.clock.current_time();
            if entry.is_marked_evicted() {
                self.close_entry(&entry, "已标记驱逐");
                if let Some(stats) = &self.stats {
                    stats.increment_soft_evictions();
                }
                continue;
            }
            if entry.is_expired(now) {
                self.close_entry(&entry, "已到最大生命周期");
                if let Some(stats) = &self.stats {
                    stats.increment_max_lifetime_evictions();
                }
                continue;
            }
            // 刚归还的连接跳过探测
            let bypass = self.config.alive_bypass_window.as_millis() as u64;
            if now.saturating_sub(entry.last_accessed()) > bypass
                && !self.is_connection_alive(&entry)
            {
                self.close_entry(&entry, "有效性检查未通过");
                continue;
            }

            entry.set_last_open(now);
            if let Some(watcher) = &self.leak_watcher {
                let threshold = self.config.leak_detection_threshold;
                let task = Arc::new(LeakTask::new(
                    entry.id(),
                    now + threshold.as_millis() as u64,
                    threshold,
                ));
                entry.set_leak_task(task.clone());
                watcher.schedule(task);
            }
            if let Some(stats) = &self.stats {
                stats.increment_successful_gets();
                stats.record_wait_time(start.elapsed());
            }

            return Ok(PooledConnection::new(
                entry,
                self.self_weak.clone(),
                self.config.auto_commit,
                self.config.read_only,
                self.config.transaction_isolation,
                self.config.catalog.clone(),
            ));
        }
    }

    /// 挂起期间在门闩上等待恢复；超时返回 PoolSuspendedTimeout
    fn await_resume(&self, start: Instant, timeout: Duration) -> Result<()> {
        let deadline = start + timeout;
        let mut guard = self.suspend_lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.pool_state() == POOL_SUSPENDED {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Err(PoolError::PoolSuspendedTimeout { timeout }),
            };
            let (g, _) = self
                .suspend_cv
                .wait_timeout(guard, remaining)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
        if self.pool_state() == POOL_SHUTDOWN {
            return Err(PoolError::PoolClosed);
        }
        Ok(())
    }

    fn timeout_error(&self, timeout: Duration, waited: Duration) -> PoolError {
        if let Some(stats) = &self.stats {
            stats.increment_failed_gets();
            stats.increment_timeout_gets();
        }
        let idle = self.bag.state_count(EntryState::NotInUse);
        let total = self.bag.len();
        PoolError::GetConnectionTimeout {
            timeout,
            waited,
            active: total.saturating_sub(idle),
            idle,
            total,
            waiting: self.bag.waiting_thread_count(),
            last_failure: self.last_connection_failure(),
        }
    }

    fn create_entry(&self) -> Result<Arc<PoolEntry>> {
        let factory = self
            .config
            .factory
            .as_ref()
            .ok_or_else(|| PoolError::InvalidConfig {
                reason: "缺少 factory".to_string(),
            })?;
        let mut raw = factory().map_err(|e| PoolError::CreateConnectionFailed {
            reason: e.to_string(),
        })?;

        let original_timeout = self.read_network_timeout(raw.as_mut());
        self.setup_connection(raw.as_mut(), original_timeout)?;

        let entry = Arc::new(PoolEntry::new(
            raw,
            &self.clock,
            self.config.max_lifetime,
            original_timeout,
        ));
        if let Some(stats) = &self.stats {
            stats.increment_total_connections_created();
        }
        log::debug!("{}: 建立新连接 entry#{}", self.config.pool_name, entry.id());
        Ok(entry)
    }

    /// 新连接初始化：网络超时 → 初始化语句 → 会话默认值 → 有效性检查 → 恢复网络超时
    fn setup_connection(
        &self,
        conn: &mut dyn DatabaseConnection,
        original_timeout: Option<Duration>,
    ) -> Result<()> {
        self.set_network_timeout_quietly(conn, self.config.validation_timeout);
        if let Some(sql) = &self.config.connection_init_sql {
            conn.execute(sql)?;
        }
        conn.set_auto_commit(self.config.auto_commit)?;
        conn.set_read_only(self.config.read_only)?;
        if let Some(level) = self.config.transaction_isolation {
            conn.set_transaction_isolation(level)?;
        }
        if let Some(catalog) = &self.config.catalog {
            conn.set_catalog(catalog)?;
        }
        if !self.probe_connection(conn) {
            return Err(PoolError::CreateConnectionFailed {
                reason: "新连接未通过有效性检查".to_string(),
            });
        }
        if let Some(original) = original_timeout {
            self.set_network_timeout_quietly(conn, original);
        }
        Ok(())
    }

    /// 探测连接是否存活：优先 connection_test_query，否则驱动的 is_valid
    fn probe_connection(&self, conn: &mut dyn DatabaseConnection) -> bool {
        if let Some(query) = &self.config.connection_test_query {
            match conn.execute(query) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("{}: 测试语句执行失败: {}", self.config.pool_name, e);
                    false
                }
            }
        } else if self.is_valid_supported.load(Ordering::Relaxed) {
            match conn.is_valid(self.config.validation_timeout) {
                Ok(ok) => ok,
                Err(DriverError::Unsupported(_)) => {
                    if self.is_valid_supported.swap(false, Ordering::Relaxed) {
                        log::error!(
                            "{}: 驱动不支持 is_valid 且未配置 connection_test_query，无法探测连接",
                            self.config.pool_name
                        );
                    }
                    false
                }
                Err(e) => {
                    log::debug!("{}: is_valid 探测失败: {}", self.config.pool_name, e);
                    false
                }
            }
        } else {
            false
        }
    }

    /// 探测借出候选是否存活，探测期间收紧网络超时并在通过后恢复
    fn is_connection_alive(&self, entry: &Arc<PoolEntry>) -> bool {
        let mut guard = entry.connection();
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => return false,
        };
        self.set_network_timeout_quietly(conn.as_mut(), self.config.validation_timeout);
        let alive = self.probe_connection(conn.as_mut());
        if alive {
            if let Some(original) = entry.default_network_timeout() {
                self.set_network_timeout_quietly(conn.as_mut(), original);
            }
        } else if let Some(stats) = &self.stats {
            stats.increment_validation_failures();
        }
        alive
    }

    fn read_network_timeout(&self, conn: &mut dyn DatabaseConnection) -> Option<Duration> {
        if !self.network_timeout_supported.load(Ordering::Relaxed) {
            return None;
        }
        match conn.network_timeout() {
            Ok(timeout) => Some(timeout),
            Err(DriverError::Unsupported(_)) => {
                self.disable_network_timeout();
                None
            }
            Err(e) => {
                log::debug!("{}: 读取网络超时失败: {}", self.config.pool_name, e);
                None
            }
        }
    }

    fn set_network_timeout_quietly(&self, conn: &mut dyn DatabaseConnection, timeout: Duration) {
        if !self.network_timeout_supported.load(Ordering::Relaxed) {
            return;
        }
        match conn.set_network_timeout(timeout) {
            Ok(()) => {}
            Err(DriverError::Unsupported(_)) => self.disable_network_timeout(),
            Err(e) => log::debug!("{}: 设置网络超时失败: {}", self.config.pool_name, e),
        }
    }

    fn disable_network_timeout(&self) {
        if self.network_timeout_supported.swap(false, Ordering::Relaxed) {
            log::warn!(
                "{}: 驱动不支持网络超时，探测时限将不受保护",
                self.config.pool_name
            );
        }
    }

    /// 归还路径：复位会话状态，按条目状况决定复用还是回收
    pub(crate) fn release(&self, entry: Arc<PoolEntry>, dirty_bits: u8) {
        entry.cancel_leak_task();
        let now = self.clock.current_time();
        if let Some(stats) = &self.stats {
            stats.record_usage_time(now.saturating_sub(entry.last_open_time()));
        }

        if dirty_bits != 0 && !self.reset_connection_state(&entry, dirty_bits) {
            entry.mark_evicted();
        }

        let shutdown = self.pool_state() == POOL_SHUTDOWN;
        let expired = entry.is_expired(now);
        if shutdown || expired || entry.is_marked_evicted() {
            let reason = if shutdown {
                "连接池关闭"
            } else if expired {
                "已到最大生命周期"
            } else {
                "已标记驱逐"
            };
            self.close_entry(&entry, reason);
            if let Some(stats) = &self.stats {
                if !shutdown {
                    if expired {
                        stats.increment_max_lifetime_evictions();
                    } else {
                        stats.increment_soft_evictions();
                    }
                }
            }
            return;
        }

        entry.set_last_accessed(now);
        self.bag.requite(&entry);
    }

    /// 复位被改动过的会话属性，失败返回 false（条目随后被驱逐）
    fn reset_connection_state(&self, entry: &Arc<PoolEntry>, dirty_bits: u8) -> bool {
        // 没有池级默认值就无法复位到已知状态，只能弃用该连接
        if (dirty_bits & DIRTY_BIT_ISOLATION != 0 && self.config.transaction_isolation.is_none())
            || (dirty_bits & DIRTY_BIT_CATALOG != 0 && self.config.catalog.is_none())
        {
            return false;
        }

        let mut guard = entry.connection();
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => return false,
        };

        let result: std::result::Result<(), DriverError> = (|| {
            if dirty_bits & DIRTY_BIT_READONLY != 0 {
                conn.set_read_only(self.config.read_only)?;
            }
            if dirty_bits & DIRTY_BIT_AUTOCOMMIT != 0 {
                conn.set_auto_commit(self.config.auto_commit)?;
            }
            if dirty_bits & DIRTY_BIT_ISOLATION != 0 {
                if let Some(level) = self.config.transaction_isolation {
                    conn.set_transaction_isolation(level)?;
                }
            }
            if dirty_bits & DIRTY_BIT_CATALOG != 0 {
                if let Some(catalog) = &self.config.catalog {
                    conn.set_catalog(catalog)?;
                }
            }
            if dirty_bits & DIRTY_BIT_NETTIMEOUT != 0 {
                if let Some(timeout) = entry.default_network_timeout() {
                    conn.set_network_timeout(timeout)?;
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "{}: 复位 {} 的会话状态失败: {}",
                    self.config.pool_name,
                    entry,
                    e
                );
                false
            }
        }
    }

    /// 回收条目：移出容器、交给关闭线程，必要时补充新连接
    /// 前置条件：调用者以 InUse 或 Reserved 状态持有该条目。
    fn close_entry(&self, entry: &Arc<PoolEntry>, reason: &str) {
        if !self.bag.remove(entry) {
            return;
        }
        entry.cancel_leak_task();
        // 连接可能已在强制关闭路径被取走，只对真实关闭计数
        if let Some(conn) = entry.take_connection() {
            let _ = self.close_tx.send((conn, reason.to_string()));
            if let Some(stats) = &self.stats {
                stats.increment_total_connections_closed();
            }
            log::debug!(
                "{}: 回收连接 entry#{}（{}）",
                self.config.pool_name,
                entry.id(),
                reason
            );
        }
        if self.pool_state() == POOL_NORMAL {
            self.request_add();
        }
    }

    fn record_connection_failure(&self, err: &PoolError) {
        log::debug!("{}: 创建连接失败: {}", self.config.pool_name, err);
        if let Some(stats) = &self.stats {
            stats.increment_creation_failures();
        }
        let now = self.clock.current_time();
        *self
            .last_connection_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((now, err.to_string()));
    }

    fn last_connection_failure(&self) -> Option<String> {
        self.last_connection_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, message)| message.clone())
    }

    fn suspend(&self) -> Result<()> {
        if !self.config.allow_pool_suspension {
            return Err(PoolError::SuspensionNotAllowed);
        }
        match self.state.compare_exchange(
            POOL_NORMAL,
            POOL_SUSPENDED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(POOL_SUSPENDED) => Ok(()), // 已挂起，幂等
            Err(_) => Err(PoolError::PoolClosed),
        }
    }

    fn resume(&self) -> Result<()> {
        if !self.config.allow_pool_suspension {
            return Err(PoolError::SuspensionNotAllowed);
        }
        if self
            .state
            .compare_exchange(
                POOL_SUSPENDED,
                POOL_NORMAL,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            // 在门闩锁内通知，确保等待者不会错过唤醒
            let _guard = self.suspend_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.suspend_cv.notify_all();
            drop(_guard);
            self.fill_pool();
        }
        Ok(())
    }

    fn soft_evict_all(&self) {
        for entry in self.bag.values() {
            entry.mark_evicted();
            if self.bag.reserve(&entry) {
                self.close_entry(&entry, "软驱逐");
                if let Some(stats) = &self.stats {
                    stats.increment_soft_evictions();
                }
            }
        }
    }

    fn fill_pool(&self) {
        if self.pool_state() != POOL_NORMAL {
            return;
        }
        let total = self.bag.len();
        let idle = self.bag.state_count(EntryState::NotInUse);
        let headroom = self.config.maximum_pool_size.saturating_sub(total);
        let shortfall = self.config.min_idle().saturating_sub(idle);
        for _ in 0..headroom.min(shortfall) {
            self.request_add();
        }
    }

    /// 维护一轮：时钟漂移检测 → 空闲超时驱逐 → 寿命到期驱逐 → 补足空闲下限
    /// 任何故障只记录日志，绝不向借出者传播。
    fn housekeeping_tick(&self) {
        let now = self.clock.current_time();
        let period_ms = self.config.housekeeping_period.as_millis() as u64;
        let previous = self.previous_housekeeping_time.swap(now, Ordering::Relaxed);
        if now < previous.saturating_sub(ALLOWED_CLOCK_DRIFT_MS)
            || now > previous + period_ms + FORWARD_JUMP_TOLERANCE_MS
        {
            log::warn!(
                "{}: 检测到时钟异常跳变（{} -> {}），软驱逐全部连接",
                self.config.pool_name,
                previous,
                now
            );
            self.soft_evict_all();
        }

        if self.pool_state() != POOL_NORMAL {
            return;
        }

        let idle_timeout_ms = self.config.idle_timeout.as_millis() as u64;
        if idle_timeout_ms > 0 {
            let mut idle = self.bag.values_with_state(EntryState::NotInUse);
            let min_idle = self.config.min_idle();
            if idle.len() > min_idle {
                // 最久未用的先回收
                idle.sort_by_key(|entry| entry.last_accessed());
                let removable = idle.len() - min_idle;
                for entry in idle.into_iter().take(removable) {
                    if now.saturating_sub(entry.last_accessed()) > idle_timeout_ms
                        && self.bag.reserve(&entry)
                    {
                        self.close_entry(&entry, "空闲超时");
                        if let Some(stats) = &self.stats {
                            stats.increment_idle_evictions();
                        }
                    }
                }
            }
        }

        for entry in self.bag.values_with_state(EntryState::NotInUse) {
            let expired = entry.is_expired(now);
            if (expired || entry.is_marked_evicted()) && self.bag.reserve(&entry) {
                self.close_entry(
                    &entry,
                    if expired {
                        "已到最大生命周期"
                    } else {
                        "已标记驱逐"
                    },
                );
                if let Some(stats) = &self.stats {
                    if expired {
                        stats.increment_max_lifetime_evictions();
                    } else {
                        stats.increment_soft_evictions();
                    }
                }
            }
        }

        self.fill_pool();
    }

    fn shutdown(&self) -> Result<()> {
        let previous = self.state.swap(POOL_SHUTDOWN, Ordering::SeqCst);
        if previous == POOL_SHUTDOWN {
            return Ok(());
        }
        log::debug!("{}: 正在关闭连接池", self.config.pool_name);

        // 唤醒挂起门闩与后台维护
        {
            let _guard = self.suspend_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.suspend_cv.notify_all();
        }
        self.housekeeper_cv.notify_all();

        // 唤醒阻塞中的借出者，它们将观察到 PoolClosed
        self.bag.close();

        // 空闲连接立即回收
        for entry in self.bag.values_with_state(EntryState::NotInUse) {
            if self.bag.reserve(&entry) {
                self.close_entry(&entry, "连接池关闭");
            }
        }

        // 等待使用中的连接归还（归还路径在关闭状态下会自行回收）
        let deadline = Instant::now() + self.config.shutdown_drain_timeout;
        while self.bag.len() > 0 && Instant::now() < deadline {
            for entry in self.bag.values_with_state(EntryState::NotInUse) {
                if self.bag.reserve(&entry) {
                    self.close_entry(&entry, "连接池关闭");
                }
            }
            if self.bag.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }

        // 兜底：超时仍未归还的连接强制关闭
        for entry in self.bag.values() {
            log::warn!(
                "{}: 关闭时 entry#{} 仍未归还，强制关闭",
                self.config.pool_name,
                entry.id()
            );
            self.bag.remove(&entry);
            entry.cancel_leak_task();
            if let Some(conn) = entry.take_connection() {
                let _ = self.close_tx.send((conn, "连接池关闭（强制）".to_string()));
                if let Some(stats) = &self.stats {
                    stats.increment_total_connections_closed();
                }
            }
        }

        if self.config.register_mbeans {
            unregister_pool(&self.config.pool_name);
        }
        Ok(())
    }
}
