// Copyright (c) 2025, vistone
// All rights reserved.

use crate::bag::BagItem;
use crate::clock::ClockSource;
use crate::driver::DatabaseConnection;
use crate::leak::LeakTask;
use crate::state::EntryState;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

static ENTRY_ID_GENERATOR: AtomicU64 = AtomicU64::new(1);

/// PoolEntry 池条目
/// 一条池化连接的记录：原子状态、时间戳、寿命上限与驱逐标记。
/// 时间戳全部来自池的时钟源（毫秒）；`end_of_life` 在 max_lifetime 基础上
/// 减去最多 2.5% 的随机量，避免整池连接同时到期。
pub struct PoolEntry {
    /// ID 条目唯一标识符
    id: u64,

    /// Connection 底层连接，teardown 时被取走交给关闭线程
    connection: Mutex<Option<Box<dyn DatabaseConnection>>>,

    /// State 条目状态，仅通过 CAS 迁移
    state: AtomicI32,

    /// CreatedAt 创建时刻
    created_at: u64,

    /// LastAccessed 最后归还时刻
    last_accessed: AtomicU64,

    /// LastOpenTime 最后借出时刻
    last_open_time: AtomicU64,

    /// EndOfLife 寿命上限的绝对时刻，禁用时为 u64::MAX
    end_of_life: u64,

    /// Evict 驱逐标记，下次归还或维护扫描时生效
    evict: AtomicBool,

    /// NetworkTimeout 驱动原生的网络超时，探测收紧后按此恢复
    default_network_timeout: Option<Duration>,

    /// LeakTask 泄漏检测任务句柄
    leak_task: Mutex<Option<Arc<LeakTask>>>,
}

impl PoolEntry {
    /// new 创建条目
    pub fn new(
        connection: Box<dyn DatabaseConnection>,
        clock: &Arc<dyn ClockSource>,
        max_lifetime: Duration,
        default_network_timeout: Option<Duration>,
    ) -> Self {
        let now = clock.current_time();
        let end_of_life = if max_lifetime.is_zero() {
            u64::MAX
        } else {
            let lifetime = max_lifetime.as_millis() as u64;
            let variance = if lifetime >= 40 {
                rand::thread_rng().gen_range(0..=lifetime / 40)
            } else {
                0
            };
            now.saturating_add(lifetime - variance)
        };

        Self {
            id: ENTRY_ID_GENERATOR.fetch_add(1, Ordering::Relaxed),
            connection: Mutex::new(Some(connection)),
            state: AtomicI32::new(EntryState::NotInUse as i32),
            created_at: now,
            last_accessed: AtomicU64::new(now),
            last_open_time: AtomicU64::new(now),
            end_of_life,
            evict: AtomicBool::new(false),
            default_network_timeout,
            leak_task: Mutex::new(None),
        }
    }

    /// default_network_timeout 驱动原生网络超时
    pub fn default_network_timeout(&self) -> Option<Duration> {
        self.default_network_timeout
    }

    /// id 条目标识符
    pub fn id(&self) -> u64 {
        self.id
    }

    /// connection 访问底层连接
    pub fn connection(&self) -> MutexGuard<'_, Option<Box<dyn DatabaseConnection>>> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// take_connection 取走底层连接（teardown 专用，之后条目不再可用）
    pub fn take_connection(&self) -> Option<Box<dyn DatabaseConnection>> {
        self.connection().take()
    }

    /// created_at 创建时刻
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// end_of_life 寿命上限
    pub fn end_of_life(&self) -> u64 {
        self.end_of_life
    }

    /// is_expired 是否已到寿命上限
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.end_of_life
    }

    /// mark_evicted 标记驱逐
    pub fn mark_evicted(&self) {
        self.evict.store(true, Ordering::Release);
    }

    /// is_marked_evicted 是否已被标记驱逐
    pub fn is_marked_evicted(&self) -> bool {
        self.evict.load(Ordering::Acquire)
    }

    /// last_accessed 最后归还时刻
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Acquire)
    }

    /// set_last_accessed 归还时更新
    pub fn set_last_accessed(&self, now: u64) {
        self.last_accessed.store(now, Ordering::Release);
    }

    /// last_open_time 最后借出时刻
    pub fn last_open_time(&self) -> u64 {
        self.last_open_time.load(Ordering::Acquire)
    }

    /// set_last_open 借出时更新
    pub fn set_last_open(&self, now: u64) {
        self.last_open_time.store(now, Ordering::Release);
    }

    /// set_leak_task 挂上泄漏检测任务
    pub fn set_leak_task(&self, task: Arc<LeakTask>) {
        *self.leak_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// cancel_leak_task 归还时撤销泄漏检测
    pub fn cancel_leak_task(&self) {
        if let Some(task) = self
            .leak_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.cancel();
        }
    }
}

impl BagItem for PoolEntry {
    fn state(&self) -> EntryState {
        EntryState::from_i32(self.state.load(Ordering::Acquire)).unwrap_or(EntryState::Removed)
    }

    fn compare_and_set(&self, expect: EntryState, target: EntryState) -> bool {
        self.state
            .compare_exchange(
                expect as i32,
                target as i32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn set_state(&self, state: EntryState) {
        self.state.store(state as i32, Ordering::Release);
    }
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .field("last_accessed", &self.last_accessed())
            .field("end_of_life", &self.end_of_life)
            .field("evict", &self.is_marked_evicted())
            .finish()
    }
}

impl fmt::Display for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{} ({})", self.id, self.state())
    }
}
