// Copyright (c) 2025, vistone
// All rights reserved.

use crate::state::EntryState;
use crossbeam::channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// 线程本地缓存保留的最近归还条目上限
const THREAD_CACHE_LIMIT: usize = 16;

/// BagItem 可入包条目的能力约束
/// 条目必须提供 CAS 语义的原子状态；成功的 NotInUse→InUse CAS 即为
/// 借出的线性化点，并发布归还者此前的全部写入。
pub trait BagItem: Send + Sync + 'static {
    /// state 读取当前状态
    fn state(&self) -> EntryState;

    /// compare_and_set 原子地从 expect 迁移到 target
    fn compare_and_set(&self, expect: EntryState, target: EntryState) -> bool;

    /// set_state 无条件写入状态（Release 语义）
    fn set_state(&self, state: EntryState);
}

/// ConcurrentBag 并发借还容器
///
/// 借出优先级：线程本地缓存（新近优先）→ 共享列表扫描 → 交接队列等待。
/// 交接队列是零容量的会合通道，归还者仅在确有阻塞等待者时才直接递交，
/// 低负载下完全无队列竞争。线程本地缓存只是偏好，绝不承担正确性：
/// 缓存持有弱引用，条目随时可能被其他线程借走或移除。
///
/// 公平性：有等待者时近似 FIFO，但不提供严格保证，调用方不得依赖。
pub struct ConcurrentBag<T: BagItem> {
    shared_list: RwLock<Vec<Arc<T>>>,
    thread_cache: DashMap<ThreadId, Vec<Weak<T>>>,
    handoff_tx: Sender<Arc<T>>,
    handoff_rx: Receiver<Arc<T>>,
    // 关闭时丢弃发送端，阻塞中的等待者立即被唤醒
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    // 每当出现新的阻塞等待者时回调，持有方用它触发容量补充
    add_listener: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
    waiters: AtomicUsize,
    closed: AtomicBool,
}

impl<T: BagItem> ConcurrentBag<T> {
    /// new 创建空容器
    pub fn new() -> Self {
        let (handoff_tx, handoff_rx) = bounded(0);
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            shared_list: RwLock::new(Vec::new()),
            thread_cache: DashMap::new(),
            handoff_tx,
            handoff_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            add_listener: RwLock::new(None),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// set_add_listener 注册等待者回调
    /// 借出者注册为等待者之后、阻塞之前触发，因此回调方观察到的
    /// 等待计数一定不小于 1，不会漏判补充需求。
    pub fn set_add_listener(&self, listener: Box<dyn Fn() + Send + Sync>) {
        *self
            .add_listener
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    fn notify_add_listener(&self) {
        if let Some(listener) = self
            .add_listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            listener();
        }
    }

    /// add 追加新条目
    /// 有阻塞等待者时尝试直接递交，避免新条目在列表里躺到下一次扫描。
    pub fn add(&self, item: Arc<T>) {
        if self.closed.load(Ordering::Acquire) {
            log::warn!("容器已关闭，忽略新增条目");
            return;
        }
        self.shared_list
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(item.clone());

        while self.waiters.load(Ordering::SeqCst) > 0
            && item.state() == EntryState::NotInUse
            && self.handoff_tx.try_send(item.clone()).is_err()
        {
            thread::yield_now();
        }
    }

    /// borrow 借出一个条目，超时返回 None
    pub fn borrow(&self, timeout: Duration) -> Option<Arc<T>> {
        // 1. 线程本地缓存，新近归还的优先
        let tid = thread::current().id();
        if let Some(mut cached) = self.thread_cache.get_mut(&tid) {
            while let Some(weak) = cached.pop() {
                if let Some(item) = weak.upgrade() {
                    if item.compare_and_set(EntryState::NotInUse, EntryState::InUse) {
                        return Some(item);
                    }
                }
            }
        }

        // 2. 注册为等待者后再扫描，保证此后的归还都会看到 waiters > 0
        self.waiters.fetch_add(1, Ordering::SeqCst);
        self.notify_add_listener();
        let result = self.borrow_slow(timeout);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn borrow_slow(&self, timeout: Duration) -> Option<Arc<T>> {
        let deadline = Instant::now() + timeout;

        {
            let shared = self.shared_list.read().unwrap_or_else(|e| e.into_inner());
            for item in shared.iter() {
                if item.compare_and_set(EntryState::NotInUse, EntryState::InUse) {
                    return Some(item.clone());
                }
            }
        }

        // 3. 在交接队列上等待归还者直接递交；CAS 失败说明竞争失败，继续等
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return None,
            };
            crossbeam::select! {
                recv(self.handoff_rx) -> msg => match msg {
                    Ok(item) => {
                        if item.compare_and_set(EntryState::NotInUse, EntryState::InUse) {
                            return Some(item);
                        }
                    }
                    Err(_) => return None,
                },
                recv(self.shutdown_rx) -> _ => return None,
                default(remaining) => return None,
            }
        }
    }

    /// requite 归还借出的条目
    /// 先置回 NotInUse 再尝试递交；递交与扫描取走二者必居其一，
    /// 等待者存在时自旋直到条目确定有了下家。
    pub fn requite(&self, item: &Arc<T>) {
        item.set_state(EntryState::NotInUse);

        {
            let tid = thread::current().id();
            let mut cached = self.thread_cache.entry(tid).or_default();
            if cached.len() >= THREAD_CACHE_LIMIT {
                cached.remove(0);
            }
            cached.push(Arc::downgrade(item));
        }

        let mut spins = 0u32;
        while self.waiters.load(Ordering::SeqCst) > 0 {
            if item.state() != EntryState::NotInUse {
                // 已被扫描者抢走
                return;
            }
            if self.handoff_tx.try_send(item.clone()).is_ok() {
                return;
            }
            spins += 1;
            if spins & 0xFF == 0xFF {
                thread::sleep(Duration::from_micros(10));
            } else {
                thread::yield_now();
            }
        }
    }

    /// reserve 占用一个空闲条目（后台维护专用）
    pub fn reserve(&self, item: &Arc<T>) -> bool {
        item.compare_and_set(EntryState::NotInUse, EntryState::Reserved)
    }

    /// unreserve 放弃占用，条目重新可借
    pub fn unreserve(&self, item: &Arc<T>) {
        if item.compare_and_set(EntryState::Reserved, EntryState::NotInUse) {
            while self.waiters.load(Ordering::SeqCst) > 0
                && item.state() == EntryState::NotInUse
                && self.handoff_tx.try_send(item.clone()).is_err()
            {
                thread::yield_now();
            }
        } else {
            log::warn!("unreserve 失败：条目不处于 reserved 状态");
        }
    }

    /// remove 移除条目
    /// 前置条件：调用者以 InUse 或 Reserved 状态持有该条目。
    /// 成功后条目进入 Removed 终态并从共享列表清除。
    pub fn remove(&self, item: &Arc<T>) -> bool {
        let removed = item.compare_and_set(EntryState::InUse, EntryState::Removed)
            || item.compare_and_set(EntryState::Reserved, EntryState::Removed);
        if !removed && !self.closed.load(Ordering::Acquire) {
            log::warn!("尝试移除未持有的条目（state={}），已忽略", item.state());
            return false;
        }
        if !removed {
            // 关闭流程中强制进入终态
            item.set_state(EntryState::Removed);
        }
        self.shared_list
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|e| !Arc::ptr_eq(e, item));
        true
    }

    /// values 共享列表快照（后台维护用）
    pub fn values(&self) -> Vec<Arc<T>> {
        self.shared_list
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// values_with_state 指定状态的条目快照
    pub fn values_with_state(&self, state: EntryState) -> Vec<Arc<T>> {
        self.shared_list
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|item| item.state() == state)
            .cloned()
            .collect()
    }

    /// state_count 指定状态的条目数量
    pub fn state_count(&self, state: EntryState) -> usize {
        self.shared_list
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|item| item.state() == state)
            .count()
    }

    /// len 条目总数（不含已移除）
    pub fn len(&self) -> usize {
        self.shared_list
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// is_empty 容器是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// waiting_thread_count 当前阻塞的借出者数量
    pub fn waiting_thread_count(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// close 关闭容器并唤醒所有阻塞的等待者
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // 丢弃发送端使 shutdown 通道断开，select 立即返回
        self.shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// is_closed 容器是否已关闭
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T: BagItem> Default for ConcurrentBag<T> {
    fn default() -> Self {
        Self::new()
    }
}
