//! 跨线程释放与并发分配测试。
//!
//! # 教案级导览
//!
//! - **Why**：驱动常在中断/接收线程中释放缓冲，而协议线程在另一侧分配；池的自由链表与统计
//!   必须在这种竞争下保持守恒，回调也必须在释放方线程上可靠触发。
//! - **How**：多个线程同时对同一个管理器执行“分配 -> 写入 -> 释放”循环，结束后断言单元全部回到池中；
//!   另一组测试把节点移交给其他线程释放，观察回调计数。
//! - **What**：测试只依赖公开 API，不使用任何内部钩子。

use std::sync::{
    Arc, Barrier,
    atomic::{AtomicUsize, Ordering},
};
use std::thread;

use spark_netbuf::{MemoryManager, MemoryManagerConfig, NetStackMemoryManager, PoolConfig};

/// ## 测试一：并发分配与释放后单元守恒
///
/// - **意图 (Why)**：自由链表若丢失或重复归还单元，池容量会悄然漂移。
/// - **契约 (What)**：所有线程结束后，空闲单元数回到初始值，活跃单元为 0，堆预算全部归还。
#[test]
fn concurrent_churn_conserves_units() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 500;

    let manager = MemoryManager::new(
        MemoryManagerConfig::new()
            .with_pool(PoolConfig::new(256, 8))
            .with_heap_limit(Some(1 << 20)),
    )
    .expect("构建管理器失败");
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|worker| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for round in 0..ROUNDS {
                    let mut node = manager.alloc(200).expect("池或堆总能满足请求");
                    let stamp = [worker as u8, round as u8];
                    manager
                        .copy_from_buf(&mut node, &stamp, 0)
                        .expect("写入节点");
                    let mut check = [0u8; 2];
                    assert_eq!(manager.copy_to_buf(&node, &mut check, 0), 2);
                    assert_eq!(check, stamp);
                    manager.free(node);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("工作线程 panic");
    }

    let stats = manager.statistics();
    let pool = stats.pool.expect("已配置池");
    assert_eq!(pool.free_units, 8);
    assert_eq!(pool.active_units, 0);
    assert_eq!(stats.heap.outstanding_bytes, 0);
    assert_eq!(stats.heap.active_allocations, 0);
}

/// ## 测试二：在其他线程释放耗尽池中的节点
///
/// - **意图 (Why)**：回调运行在释放方上下文中，耗尽状态的观测必须跨线程可见。
/// - **契约 (What)**：每次“全部租出 -> 在工作线程释放一个”的周期恰好触发一次回调。
#[test]
fn release_on_other_thread_fires_callback() {
    let manager = MemoryManager::new(MemoryManagerConfig::new().with_pool(PoolConfig::new(64, 2)))
        .expect("构建管理器失败");
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        manager.set_on_pool_space_avail_cb(Arc::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }));
    }

    for cycle in 1..=3 {
        let first = manager.alloc_pool(64).expect("分配");
        let second = manager.alloc_pool(64).expect("分配");
        assert!(manager.alloc_pool(1).is_err());

        let releaser = {
            let manager = manager.clone();
            thread::spawn(move || {
                manager.free(first);
            })
        };
        releaser.join().expect("释放线程 panic");
        assert_eq!(fired.load(Ordering::SeqCst), cycle);
        drop(second);
    }
}
