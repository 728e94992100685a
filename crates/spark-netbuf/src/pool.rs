use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::BytesMut;
use spin::Mutex;
use tracing::{debug, trace};

use crate::{
    config::PoolConfig,
    error::{NetBufError, Result},
    lease::{Lease, ReclaimedStorage, StorageRecycler, allocate_aligned},
    lifetime::Lifetime,
    node::BufferNode,
};

/// 池空间重新可用时的回调。
pub type PoolSpaceAvailableCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// `UnitPool` 是固定单元大小的 slab 分配器，基于自由链表复用预分配的 `BytesMut`。
///
/// # 模块角色（Why）
/// - 链路层驱动在接收路径上需要 O(1)、不触碰通用堆的分配，以获得可预测的延迟并杜绝碎片；
/// - 单元在构造时一次性分配完毕，此后池的内存占用恒定，便于在受限设备上做容量规划。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<BytesMut>>` 作为自由链表，租借与归还均为一次 `pop`/`push`；
/// - 节点通过 [`Lease`] 持有指向池的回收句柄，节点被释放时单元自动回到链表；
/// - 归还时若链表原本为空（池已耗尽），在释放锁之后同步调用已注册的回调，
///   回调内再次向本池分配不会与归还路径争用同一把锁。
///
/// # 契约说明（What）
/// - **线程安全**：自由链表受自旋锁保护，统计使用原子计数；归还可以发生在其它线程，
///   对应驱动在接收中断上下文中释放缓冲的场景；
/// - **前置条件**：`alloc` 的 `requested_len` 不得超过单元大小，否则立即失败；
/// - **后置条件**：成功返回的节点容量等于单元大小，可见长度等于 `requested_len`，
///   生命周期标记为 [`Lifetime::PoolAllocated`]；
/// - 分配失败从不阻塞，也不回退到堆，由调用方决定后续策略。
///
/// # 设计权衡（Trade-offs）
/// - 使用自旋锁而非阻塞互斥量，以便在 `no_std` 与中断上下文中工作，临界区只包含一次链表操作；
/// - 只保留一个回调观察者，重复注册会覆盖旧回调。
#[derive(Clone)]
pub struct UnitPool {
    inner: Arc<PoolInner>,
}

impl UnitPool {
    /// 按配置预分配全部单元。
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let mut free_list = Vec::with_capacity(config.unit_count());
        for _ in 0..config.unit_count() {
            let (unit, _) = allocate_aligned(config.unit_size(), config.alignment()).ok_or(
                NetBufError::InvalidConfig {
                    field: "pool.unit_size",
                    reason: "unit storage could not be allocated",
                },
            )?;
            free_list.push(unit);
        }
        debug!(
            unit_size = config.unit_size(),
            unit_count = config.unit_count(),
            alignment = config.alignment(),
            "unit pool constructed"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                free_list: Mutex::new(free_list),
                on_space_available: Mutex::new(None),
                metrics: PoolMetrics::default(),
            }),
        })
    }

    /// 单元大小，调用方据此决定走池还是走堆。
    pub fn unit_size(&self) -> usize {
        self.inner.config.unit_size()
    }

    pub fn unit_count(&self) -> usize {
        self.inner.config.unit_count()
    }

    /// 池总容量（字节），即 `unit_size * unit_count`。
    pub fn pool_size(&self) -> usize {
        self.unit_size() * self.unit_count()
    }

    /// 当前空闲单元数。
    pub fn free_units(&self) -> usize {
        self.inner.free_list.lock().len()
    }

    /// 租借一个单元，单元内容全部为零。
    ///
    /// # 实现策略
    /// 1. 请求超过单元大小时直接失败，不触碰自由链表；
    /// 2. 弹出一个空闲单元；若弹出后链表为空，记录一次耗尽事件；
    /// 3. 链表本已为空时返回 [`NetBufError::AllocationFailed`]，同时累加失败计数。
    pub fn alloc(&self, requested_len: usize) -> Result<BufferNode> {
        let unit_size = self.unit_size();
        if requested_len > unit_size {
            self.inner.metrics.record_failure();
            debug!(requested_len, unit_size, "pool request exceeds unit size");
            return Err(NetBufError::pool_exhausted(requested_len));
        }

        let (unit, now_empty) = {
            let mut list = self.inner.free_list.lock();
            let unit = list.pop();
            let now_empty = unit.is_some() && list.is_empty();
            (unit, now_empty)
        };

        let Some(unit) = unit else {
            self.inner.metrics.record_failure();
            trace!(requested_len, "pool exhausted, allocation refused");
            return Err(NetBufError::pool_exhausted(requested_len));
        };
        if now_empty {
            self.inner
                .metrics
                .exhaustion_events
                .fetch_add(1, Ordering::Relaxed);
            debug!(unit_count = self.unit_count(), "pool exhausted");
        }

        self.inner.metrics.active_units.fetch_add(1, Ordering::Relaxed);
        let recycler: Arc<dyn StorageRecycler> = self.inner.clone();
        Ok(BufferNode::leased(
            unit,
            self.inner.config.alignment(),
            unit_size,
            requested_len,
            Lifetime::PoolAllocated,
            Lease::new(unit_size, recycler),
        ))
    }

    /// 注册池空间可用回调，替换此前注册的回调。
    ///
    /// 回调在“池耗尽 -> 至少一个单元空闲”的转换点同步执行，运行在释放缓冲的调用方上下文中。
    /// 回调内可以再次分配，但应避免在同一调用栈中无界地分配/释放，以免递归过深。
    pub fn set_on_pool_space_avail_cb<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.install_callback(Arc::new(callback));
    }

    pub(crate) fn install_callback(&self, callback: PoolSpaceAvailableCallback) {
        let previous = self.inner.on_space_available.lock().replace(callback);
        // 旧回调可能持有节点，必须在锁外析构。
        drop(previous);
    }

    /// 移除已注册的回调。
    pub fn clear_on_pool_space_avail_cb(&self) {
        let previous = self.inner.on_space_available.lock().take();
        drop(previous);
    }

    /// 读取统计快照。
    pub fn statistics(&self) -> PoolStats {
        PoolStats {
            unit_size: self.unit_size(),
            unit_count: self.unit_count(),
            free_units: self.free_units(),
            active_units: self.inner.metrics.active_units.load(Ordering::Relaxed),
            failed_acquisitions: self
                .inner
                .metrics
                .failed_acquisitions
                .load(Ordering::Relaxed),
            exhaustion_events: self.inner.metrics.exhaustion_events.load(Ordering::Relaxed),
            callbacks_dispatched: self
                .inner
                .metrics
                .callbacks_dispatched
                .load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for UnitPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnitPool")
            .field("config", &self.inner.config)
            .field("free_units", &self.free_units())
            .finish()
    }
}

/// 池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub unit_size: usize,
    pub unit_count: usize,
    pub free_units: usize,
    pub active_units: usize,
    pub failed_acquisitions: u64,
    pub exhaustion_events: u64,
    pub callbacks_dispatched: u64,
}

struct PoolInner {
    config: PoolConfig,
    free_list: Mutex<Vec<BytesMut>>,
    on_space_available: Mutex<Option<PoolSpaceAvailableCallback>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn notify_space_available(&self) {
        let callback = self.on_space_available.lock().clone();
        if let Some(callback) = callback {
            self.metrics
                .callbacks_dispatched
                .fetch_add(1, Ordering::Relaxed);
            trace!("pool space available, dispatching callback");
            callback();
        }
    }
}

impl StorageRecycler for PoolInner {
    fn reclaim(&self, reclaimed: ReclaimedStorage) {
        decrement(&self.metrics.active_units);
        let buffer = reclaimed.into_buffer();
        debug_assert!(buffer.is_some(), "pool units are always owned storage");
        let Some(mut unit) = buffer else {
            return;
        };
        // 上一个报文的内容不得泄漏给下一次租借。
        unit.fill(0);
        let was_empty = {
            let mut list = self.free_list.lock();
            let was_empty = list.is_empty();
            list.push(unit);
            was_empty
        };
        if was_empty {
            self.notify_space_available();
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    active_units: AtomicUsize,
    failed_acquisitions: AtomicU64,
    exhaustion_events: AtomicU64,
    callbacks_dispatched: AtomicU64,
}

impl PoolMetrics {
    fn record_failure(&self) {
        self.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
    }
}

fn decrement(target: &AtomicUsize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(1))
    });
}
