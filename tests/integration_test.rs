// Copyright (c) 2025, vistone
// All rights reserved.

// 集成测试：借还、超时、驱逐、挂起/恢复、泄漏检测与关闭语义

mod common;

use common::TestDriver;
use dbconnpool::{default_config, Config, ManualClock, PoolError};
use dbconnpool::{ClockSource, Pool};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn base_config(driver: &Arc<TestDriver>) -> Config {
    let mut config = default_config();
    config.factory = Some(driver.factory());
    config.maximum_pool_size = 5;
    config.minimum_idle = Some(0);
    config.idle_timeout = Duration::ZERO;
    config.max_lifetime = Duration::ZERO;
    config.housekeeping_period = Duration::from_millis(200);
    config
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_borrow_and_reuse() {
    let driver = TestDriver::new();
    let pool = Pool::new(base_config(&driver)).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(2)).unwrap();
    conn.execute("SELECT 1").unwrap();
    assert_eq!(pool.active_connections(), 1);
    drop(conn);

    assert!(wait_until(Duration::from_secs(1), || {
        pool.idle_connections() == 1
    }));

    // 第二次借出复用同一条底层连接
    let conn = pool.get_connection_timeout(Duration::from_secs(2)).unwrap();
    conn.execute("SELECT 1").unwrap();
    drop(conn);
    assert_eq!(driver.created(), 1);

    pool.close().unwrap();
}

// 池饱和时，后来的借出者在持有者归还后的超时窗口内拿到连接
#[test]
fn test_saturated_pool_waiter_served_on_release() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.maximum_pool_size = 2;
    config.minimum_idle = Some(2);
    let pool = Pool::new(config).unwrap();

    let first = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();
    let second = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();

    let pool2 = pool.clone();
    let waiter = thread::spawn(move || {
        let start = Instant::now();
        let result = pool2.get_connection_timeout(Duration::from_millis(1000));
        (result.is_ok(), start.elapsed())
    });

    assert!(wait_until(Duration::from_secs(1), || {
        pool.threads_awaiting_connection() == 1
    }));
    drop(first);

    let (served, elapsed) = waiter.join().unwrap();
    assert!(served, "等待者应在归还后被服务");
    assert!(elapsed < Duration::from_millis(1000));

    drop(second);
    pool.close().unwrap();
}

// 饱和且无人归还时，短超时应当很快返回超时错误
#[test]
fn test_timeout_when_saturated() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.maximum_pool_size = 1;
    config.connection_timeout = Duration::from_millis(250);
    let pool = Pool::new(config).unwrap();

    let held = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();

    let start = Instant::now();
    let err = pool.get_connection().unwrap_err();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_secs(1), "超时耗时 {:?}", elapsed);

    match err {
        PoolError::GetConnectionTimeout { total, active, .. } => {
            assert_eq!(total, 1);
            assert_eq!(active, 1);
        }
        other => panic!("预期超时错误，得到 {:?}", other),
    }

    drop(held);
    pool.close().unwrap();
}

// 寿命到期的连接不会再次被借出，池重建新连接且总数不超上限
#[test]
fn test_max_lifetime_recycles_entry() {
    let driver = TestDriver::new();
    let clock = Arc::new(ManualClock::new(0));
    let mut config = base_config(&driver);
    config.maximum_pool_size = 5;
    config.max_lifetime = Duration::from_millis(2_000);
    config.housekeeping_period = Duration::from_secs(60); // 只验证借出路径
    config.clock = Some(clock.clone() as Arc<dyn ClockSource>);
    let pool = Pool::new(config).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(2)).unwrap();
    drop(conn);
    assert_eq!(driver.created(), 1);

    clock.advance(2_100);

    let conn = pool.get_connection_timeout(Duration::from_secs(2)).unwrap();
    conn.execute("SELECT 1").unwrap();
    drop(conn);

    assert_eq!(driver.created(), 2, "到期条目应被更换");
    assert!(wait_until(Duration::from_secs(1), || driver.closed() == 1));
    assert!(pool.total_connections() <= 5);

    pool.close().unwrap();
}

// 创建失败若在超时窗口内恢复，借出者不感知失败
#[test]
fn test_creation_failure_retries_within_deadline() {
    let driver = TestDriver::new();
    driver.fail_connects.store(3, Ordering::SeqCst);
    let mut config = base_config(&driver);
    config.maximum_pool_size = 1;
    let pool = Pool::new(config).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(5)).unwrap();
    conn.execute("SELECT 1").unwrap();

    assert!(pool.last_connection_failure().is_some());
    assert_eq!(pool.stats().total_creation_failures, 3);

    drop(conn);
    pool.close().unwrap();
}

// 超过泄漏阈值仅告警一次，连接仍正常归还
#[test]
fn test_leak_detection_warns_once() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.leak_detection_threshold = Duration::from_millis(2_000);
    let pool = Pool::new(config).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(2)).unwrap();
    assert!(wait_until(Duration::from_secs(4), || {
        pool.stats().leak_warnings == 1
    }));

    drop(conn);
    assert!(wait_until(Duration::from_secs(1), || {
        pool.idle_connections() == 1
    }));

    // 归还后不再产生新的警告
    thread::sleep(Duration::from_millis(300));
    assert_eq!(pool.stats().leak_warnings, 1);

    pool.close().unwrap();
}

// 归还发生在阈值之前时不产生警告
#[test]
fn test_leak_detection_cancelled_on_release() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.leak_detection_threshold = Duration::from_millis(2_000);
    let pool = Pool::new(config).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(2)).unwrap();
    drop(conn);

    thread::sleep(Duration::from_millis(2_500));
    assert_eq!(pool.stats().leak_warnings, 0);

    pool.close().unwrap();
}

// 挂起期间获取请求阻塞直至超时；恢复后立即可用
#[test]
fn test_suspend_and_resume() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.allow_pool_suspension = true;
    config.minimum_idle = Some(1);
    let pool = Pool::new(config).unwrap();

    assert!(wait_until(Duration::from_secs(1), || {
        pool.idle_connections() == 1
    }));

    pool.suspend_pool().unwrap();
    assert!(pool.is_suspended());

    let start = Instant::now();
    let err = pool
        .get_connection_timeout(Duration::from_millis(500))
        .unwrap_err();
    assert_eq!(err, PoolError::PoolSuspendedTimeout {
        timeout: Duration::from_millis(500)
    });
    assert!(start.elapsed() >= Duration::from_millis(450));

    pool.resume_pool().unwrap();
    let conn = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();
    drop(conn);

    pool.close().unwrap();
}

#[test]
fn test_suspension_requires_configuration() {
    let driver = TestDriver::new();
    let pool = Pool::new(base_config(&driver)).unwrap();
    assert_eq!(pool.suspend_pool().unwrap_err(), PoolError::SuspensionNotAllowed);
    assert_eq!(pool.resume_pool().unwrap_err(), PoolError::SuspensionNotAllowed);
    pool.close().unwrap();
}

// 空闲超时把池收敛到 minimum_idle
#[test]
fn test_idle_timeout_settles_to_minimum_idle() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.maximum_pool_size = 10;
    config.minimum_idle = Some(2);
    config.idle_timeout = Duration::from_millis(1_000);
    config.housekeeping_period = Duration::from_millis(200);
    let pool = Pool::new(config).unwrap();

    // 预热到 10 条空闲
    let mut held = Vec::new();
    for _ in 0..10 {
        held.push(pool.get_connection_timeout(Duration::from_secs(2)).unwrap());
    }
    drop(held);
    assert!(wait_until(Duration::from_secs(1), || {
        pool.idle_connections() == 10
    }));

    assert!(
        wait_until(Duration::from_secs(5), || pool.idle_connections() == 2
            && pool.total_connections() == 2),
        "池应收敛到 minimum_idle，当前 idle={} total={}",
        pool.idle_connections(),
        pool.total_connections()
    );

    pool.close().unwrap();
}

// close 幂等，之后所有获取请求返回 PoolClosed
#[test]
fn test_close_idempotent_and_rejects_gets() {
    let driver = TestDriver::new();
    let pool = Pool::new(base_config(&driver)).unwrap();

    pool.close().unwrap();
    pool.close().unwrap();
    assert!(pool.is_closed());

    let err = pool.get_connection_timeout(Duration::from_secs(1)).unwrap_err();
    assert_eq!(err, PoolError::PoolClosed);
}

// 关闭唤醒阻塞中的借出者并返回 PoolClosed
#[test]
fn test_close_wakes_parked_waiters() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.maximum_pool_size = 1;
    let pool = Pool::new(config).unwrap();

    let held = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();

    let pool2 = pool.clone();
    let waiter = thread::spawn(move || {
        let start = Instant::now();
        let result = pool2.get_connection_timeout(Duration::from_secs(10));
        (result.unwrap_err(), start.elapsed())
    });

    assert!(wait_until(Duration::from_secs(1), || {
        pool.threads_awaiting_connection() == 1
    }));

    let pool3 = pool.clone();
    let closer = thread::spawn(move || pool3.close());

    let (err, elapsed) = waiter.join().unwrap();
    assert_eq!(err, PoolError::PoolClosed);
    assert!(elapsed < Duration::from_secs(5), "等待者未被及时唤醒");

    drop(held);
    closer.join().unwrap().unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        driver.closed() == driver.created()
    }));
}

// 归还等待超过 shutdown_drain_timeout 后连接被强制关闭；
// 迟到的归还不产生第二次关闭，计数与真实关闭一一对应
#[test]
fn test_forced_close_after_drain_timeout() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.maximum_pool_size = 1;
    config.shutdown_drain_timeout = Duration::from_millis(200);
    let pool = Pool::new(config).unwrap();

    let held = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();

    // 持有者不归还，close() 等满排水窗口后强制关闭
    let start = Instant::now();
    pool.close().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(pool.total_connections(), 0);
    assert!(wait_until(Duration::from_secs(1), || driver.closed() == 1));

    // 迟到的归还只是丢弃条目
    drop(held);
    thread::sleep(Duration::from_millis(100));

    let stats = pool.stats();
    assert_eq!(stats.total_connections_created, 1);
    assert_eq!(
        stats.total_connections_closed, 1,
        "强制关闭后的迟到归还不得重复计数"
    );
    assert_eq!(driver.closed(), 1);
}

// 软驱逐：空闲连接立即回收，使用中的连接在归还时回收
#[test]
fn test_soft_evict_connections() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.minimum_idle = Some(2);
    config.maximum_pool_size = 3;
    let pool = Pool::new(config).unwrap();

    assert!(wait_until(Duration::from_secs(1), || {
        pool.idle_connections() == 2
    }));

    let held = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();

    pool.soft_evict_connections();

    // 使用中的连接不受打断
    held.execute("SELECT 1").unwrap();

    // 空闲连接立即回收
    assert!(wait_until(Duration::from_secs(2), || driver.closed() >= 1));

    drop(held);
    // 被标记的持有连接归还时关闭
    assert!(wait_until(Duration::from_secs(2), || driver.closed() >= 2));

    pool.close().unwrap();
}

#[test]
fn test_evict_connection_on_release() {
    let driver = TestDriver::new();
    let pool = Pool::new(base_config(&driver)).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();
    pool.evict_connection(&conn);
    conn.execute("SELECT 1").unwrap(); // 标记不影响当前使用
    drop(conn);

    assert!(wait_until(Duration::from_secs(1), || driver.closed() == 1));
    assert_eq!(pool.idle_connections(), 0);

    pool.close().unwrap();
}

// 代理归还后拒绝一切操作
#[test]
fn test_proxy_rejects_use_after_close() {
    let driver = TestDriver::new();
    let pool = Pool::new(base_config(&driver)).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();
    conn.close();
    assert!(conn.is_closed());
    assert_eq!(conn.execute("SELECT 1").unwrap_err(), PoolError::ConnectionClosed);
    assert_eq!(
        conn.set_auto_commit(false).unwrap_err(),
        PoolError::ConnectionClosed
    );

    pool.close().unwrap();
}

// 归还时按脏位复位被改动过的会话属性
#[test]
fn test_dirty_session_state_reset_on_release() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.catalog = Some("app".to_string());
    let pool = Pool::new(config).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();
    conn.set_auto_commit(false).unwrap();
    conn.set_read_only(true).unwrap();
    conn.set_catalog("other").unwrap();
    assert!(!conn.auto_commit());
    assert!(conn.read_only());

    {
        let connections = driver.connections.lock().unwrap();
        let state = &connections[0];
        assert!(!state.auto_commit.load(Ordering::SeqCst));
        assert!(state.read_only.load(Ordering::SeqCst));
        assert_eq!(state.catalog.lock().unwrap().as_deref(), Some("other"));
    }

    drop(conn);
    assert!(wait_until(Duration::from_secs(1), || {
        pool.idle_connections() == 1
    }));

    let connections = driver.connections.lock().unwrap();
    let state = &connections[0];
    assert!(state.auto_commit.load(Ordering::SeqCst), "自动提交应复位");
    assert!(!state.read_only.load(Ordering::SeqCst), "只读应复位");
    assert_eq!(state.catalog.lock().unwrap().as_deref(), Some("app"));
    drop(connections);

    pool.close().unwrap();
}

// 连接级致命错误把条目标记为驱逐
#[test]
fn test_fatal_driver_error_marks_eviction() {
    let driver = TestDriver::new();
    let pool = Pool::new(base_config(&driver)).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();
    driver.fail_validation.store(true, Ordering::SeqCst);
    assert!(conn.execute("SELECT 1").is_err());
    driver.fail_validation.store(false, Ordering::SeqCst);
    drop(conn);

    // 归还路径回收被标记的连接
    assert!(wait_until(Duration::from_secs(1), || driver.closed() == 1));
    assert_eq!(pool.idle_connections(), 0);

    pool.close().unwrap();
}

// 借出路径的有效性探测：失活的空闲连接被更换
#[test]
fn test_dead_idle_connection_replaced_on_borrow() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.maximum_pool_size = 2;
    config.alive_bypass_window = Duration::ZERO;
    let pool = Pool::new(config).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();
    drop(conn);
    assert_eq!(driver.created(), 1);

    thread::sleep(Duration::from_millis(50));
    driver.fail_validation.store(true, Ordering::SeqCst);
    let clearer = {
        let driver = driver.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(400));
            driver.fail_validation.store(false, Ordering::SeqCst);
        })
    };

    let conn = pool.get_connection_timeout(Duration::from_secs(5)).unwrap();
    conn.execute("SELECT 1").unwrap();
    drop(conn);
    clearer.join().unwrap();

    assert!(driver.created() >= 2, "失活连接应被更换");
    assert!(driver.closed() >= 1);
    assert!(pool.stats().validation_failures >= 1);

    pool.close().unwrap();
}

// 驱动缺失 is_valid 时回退到 connection_test_query
#[test]
fn test_is_valid_unsupported_falls_back_to_test_query() {
    let driver = TestDriver::new();
    driver.supports_is_valid.store(false, Ordering::SeqCst);
    let mut config = base_config(&driver);
    config.connection_test_query = Some("SELECT 1".to_string());
    config.alive_bypass_window = Duration::ZERO;
    let pool = Pool::new(config).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(2)).unwrap();
    drop(conn);
    thread::sleep(Duration::from_millis(50));
    let conn = pool.get_connection_timeout(Duration::from_secs(2)).unwrap();
    drop(conn);

    let connections = driver.connections.lock().unwrap();
    let executed = connections[0].executed.lock().unwrap();
    assert!(
        executed.iter().any(|sql| sql == "SELECT 1"),
        "应通过测试语句探测: {:?}",
        executed
    );
    drop(executed);
    drop(connections);

    pool.close().unwrap();
}

// minimum_idle=0 允许池缩到零，按需创建仍在期限内完成
#[test]
fn test_minimum_idle_zero_creates_on_demand() {
    let driver = TestDriver::new();
    let pool = Pool::new(base_config(&driver)).unwrap();

    assert_eq!(pool.total_connections(), 0);
    let conn = pool.get_connection_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(pool.total_connections(), 1);
    drop(conn);

    pool.close().unwrap();
}

// 时钟异常跳变触发全量软驱逐
#[test]
fn test_clock_jump_soft_evicts_idle_entries() {
    let driver = TestDriver::new();
    let clock = Arc::new(ManualClock::new(0));
    let mut config = base_config(&driver);
    config.minimum_idle = Some(2);
    config.housekeeping_period = Duration::from_millis(200);
    config.clock = Some(clock.clone() as Arc<dyn ClockSource>);
    let pool = Pool::new(config).unwrap();

    assert!(wait_until(Duration::from_secs(1), || {
        pool.idle_connections() == 2
    }));

    // 前跳超过维护周期加容忍度
    clock.advance(20_000);

    assert!(
        wait_until(Duration::from_secs(2), || driver.closed() >= 2),
        "时钟跳变后旧连接应被软驱逐"
    );
    // 池随后补足空闲下限
    assert!(wait_until(Duration::from_secs(2), || {
        pool.idle_connections() == 2
    }));

    pool.close().unwrap();
}

// 连接初始化语句与会话默认值在创建时生效
#[test]
fn test_connection_setup_applies_defaults() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.connection_init_sql = Some("SET NAMES utf8mb4".to_string());
    config.read_only = true;
    config.catalog = Some("app".to_string());
    let pool = Pool::new(config).unwrap();

    let conn = pool.get_connection_timeout(Duration::from_secs(1)).unwrap();
    drop(conn);

    let connections = driver.connections.lock().unwrap();
    let state = &connections[0];
    assert!(state
        .executed
        .lock()
        .unwrap()
        .iter()
        .any(|sql| sql == "SET NAMES utf8mb4"));
    assert!(state.read_only.load(Ordering::SeqCst));
    assert_eq!(state.catalog.lock().unwrap().as_deref(), Some("app"));
    drop(connections);

    pool.close().unwrap();
}

#[test]
fn test_registered_pool_name_lifecycle() {
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.pool_name = "registered-pool".to_string();
    config.register_mbeans = true;
    let pool = Pool::new(config).unwrap();
    pool.close().unwrap();

    // 注销后同名池可以再次注册
    let driver = TestDriver::new();
    let mut config = base_config(&driver);
    config.pool_name = "registered-pool".to_string();
    config.register_mbeans = true;
    let pool = Pool::new(config).unwrap();
    pool.close().unwrap();
}
