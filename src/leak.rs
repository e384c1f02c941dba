// Copyright (c) 2025, vistone
// All rights reserved.

use crate::clock::ClockSource;
use crate::stats::StatsCollector;
use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use std::backtrace::Backtrace;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 无任务时看守线程的最长休眠
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// LeakTask 单次泄漏检测任务
/// 借出时创建并登记到看守线程；归还时撤销。到期仍未撤销则报告一次泄漏，
/// 报告从不回收条目本身。
pub struct LeakTask {
    armed: AtomicBool,
    deadline: u64,
    entry_id: u64,
    threshold: Duration,
    /// 借出点的调用栈快照
    backtrace: String,
}

impl LeakTask {
    /// new 创建任务，在调用处捕获借出栈
    pub fn new(entry_id: u64, deadline: u64, threshold: Duration) -> Self {
        Self {
            armed: AtomicBool::new(true),
            deadline,
            entry_id,
            threshold,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    /// cancel 撤销任务，返回是否撤销成功（false 表示已经触发过）
    pub fn cancel(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }

    fn fire(&self, pool_name: &str) -> bool {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return false;
        }
        log::warn!(
            "{}: 疑似连接泄漏，entry#{} 借出超过 {:?} 未归还，借出位置:\n{}",
            pool_name,
            self.entry_id,
            self.threshold,
            self.backtrace
        );
        true
    }
}

struct Scheduled {
    deadline: u64,
    seq: u64,
    task: Arc<LeakTask>,
}

// BinaryHeap 是大顶堆，比较取反得到最早到期优先
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

/// LeakWatcher 泄漏看守
/// 单线程维护按到期时刻排序的任务堆；喂入通道断开后线程自行退出。
pub struct LeakWatcher {
    tx: Sender<Arc<LeakTask>>,
}

impl LeakWatcher {
    /// new 启动看守线程
    pub fn new(
        pool_name: String,
        clock: Arc<dyn ClockSource>,
        stats: Option<Arc<StatsCollector>>,
    ) -> Self {
        let (tx, rx) = unbounded::<Arc<LeakTask>>();
        let thread_name = format!("{}-leak-watcher", pool_name);
        let _ = thread::Builder::new().name(thread_name).spawn(move || {
            let mut heap: BinaryHeap<Scheduled> = BinaryHeap::new();
            let mut seq: u64 = 0;
            loop {
                let wait = heap
                    .peek()
                    .map(|s| {
                        Duration::from_millis(s.deadline.saturating_sub(clock.current_time()))
                    })
                    .unwrap_or(IDLE_WAIT)
                    .max(Duration::from_millis(1));

                match rx.recv_timeout(wait) {
                    Ok(task) => {
                        seq += 1;
                        heap.push(Scheduled {
                            deadline: task.deadline,
                            seq,
                            task,
                        });
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }

                let now = clock.current_time();
                while heap.peek().is_some_and(|top| top.deadline <= now) {
                    if let Some(scheduled) = heap.pop() {
                        if scheduled.task.fire(&pool_name) {
                            if let Some(stats) = &stats {
                                stats.increment_leak_warnings();
                            }
                        }
                    }
                }
            }
        });
        Self { tx }
    }

    /// schedule 登记一个任务
    pub fn schedule(&self, task: Arc<LeakTask>) {
        let _ = self.tx.send(task);
    }
}
