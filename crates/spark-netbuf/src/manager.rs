//! # manager 模块说明
//!
//! ## 角色定位（Why）
//! - 协议栈各层只面向一个内存管理入口：池分配、堆分配、堆重分配、释放与链操作；
//! - 通过 [`NetStackMemoryManager`] trait 把入口抽象出来，驱动与协议实现可以在测试中替换为
//!   计数桩或故障注入实现，而无需感知池与堆的具体形态。
//!
//! ## 组成（How）
//! - [`MemoryManager`] 组合一个可选的 [`UnitPool`] 与一个 [`HeapAllocator`]；
//! - 链相关操作（拼接、总长、跨节点复制）在 trait 中提供默认实现，直接转发到 [`BufferNode`]；
//! - `free` 迭代地摘下每个节点并交由其租约归还，同时输出一条汇总日志。

use tracing::{debug, trace};

use crate::{
    config::MemoryManagerConfig,
    error::{NetBufError, Result},
    heap::{HeapAllocator, HeapStats},
    node::BufferNode,
    pool::{PoolSpaceAvailableCallback, PoolStats, UnitPool},
};

/// 网络协议栈使用的内存管理接口。
///
/// # 契约说明（What）
/// - 所有分配失败都以 [`NetBufError::AllocationFailed`] 返回，调用方据此丢包或背压；
/// - `free` 释放整条链：池节点回到池，堆节点与 `Volatile` 节点释放存储，`Constant` 节点保持原样；
/// - trait 为对象安全，可以 `Arc<dyn NetStackMemoryManager>` 的形式在驱动间共享。
///
/// # 默认实现
/// - 链操作（`cat`、`total_len`、`copy_to_buf`、`copy_from_buf`、`count_buffers`）与具体后端无关，
///   实现者通常无需覆写。
pub trait NetStackMemoryManager: Send + Sync {
    /// 分配容量与长度均为 `len` 的堆节点。
    fn alloc_heap(&self, len: usize) -> Result<BufferNode>;

    /// 分配数据起始地址按 `alignment` 对齐的堆节点。
    fn alloc_heap_aligned(&self, len: usize, alignment: usize) -> Result<BufferNode>;

    /// 从池中租借一个单元，可见长度为 `len`。
    fn alloc_pool(&self, len: usize) -> Result<BufferNode>;

    /// 调整堆节点容量，失败时节点保持原状。
    fn realloc_heap(&self, node: &mut BufferNode, new_len: usize) -> Result<()>;

    /// 把整条链的可见负载复制为一个连续的堆节点，常用于需要 DMA 连续帧的驱动。
    ///
    /// # 契约
    /// - 新节点按 `alignment` 对齐，前方隐藏 `header_skip` 字节供外层协议写入头部；
    /// - 可见长度为 `len`，缺省时等于链总长；链较短时其余字节为零，链较长时截断；
    /// - 原链只被读取，不论成功与否都由调用方继续持有并自行释放；
    /// - 分配失败返回 [`NetBufError::AllocationFailed`]。
    fn flatten_to_heap(
        &self,
        chain: &BufferNode,
        alignment: usize,
        len: Option<usize>,
        header_skip: usize,
    ) -> Result<BufferNode> {
        let payload_len = len.unwrap_or_else(|| chain.total_len());
        let capacity = payload_len
            .checked_add(header_skip)
            .ok_or(NetBufError::heap_rejected(usize::MAX))?;
        let mut flat = self.alloc_heap_aligned(capacity, alignment)?;
        flat.skip_header_space(header_skip)?;
        chain.copy_to_buf(flat.data_mut()?, 0);
        Ok(flat)
    }

    /// 池单元大小；未配置池时为 0。
    fn pool_alloc_unit(&self) -> usize;

    /// 池总容量（字节）；未配置池时为 0。
    fn pool_size(&self) -> usize;

    /// 注册池空间可用回调，替换此前的回调。
    fn set_on_pool_space_avail_cb(&self, callback: PoolSpaceAvailableCallback);

    /// 释放整条链并返回处置汇总。
    fn free(&self, chain: BufferNode) -> FreeSummary;

    /// 把 `tail` 整条链追加到 `head` 尾部。
    fn cat(&self, head: &mut BufferNode, tail: BufferNode) {
        head.cat(tail);
    }

    fn count_buffers(&self, chain: &BufferNode) -> usize {
        chain.count_buffers()
    }

    fn total_len(&self, chain: &BufferNode) -> usize {
        chain.total_len()
    }

    fn copy_to_buf(&self, chain: &BufferNode, dst: &mut [u8], offset: usize) -> usize {
        chain.copy_to_buf(dst, offset)
    }

    fn copy_from_buf(&self, chain: &mut BufferNode, src: &[u8], offset: usize) -> Result<()> {
        chain.copy_from_buf(src, offset)
    }
}

/// 一次 `free` 调用的处置结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeSummary {
    /// 存储被归还或释放的节点数（池、堆、`Volatile`）。
    pub released: usize,
    /// 未被释放的 `Constant` 节点数。
    pub retained: usize,
}

/// 管理器统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub pool: Option<PoolStats>,
    pub heap: HeapStats,
}

/// 池 + 堆的默认内存管理器实现。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 接收路径优先使用池获得确定的分配延迟，超长报文或池耗尽时由调用方显式改走堆；
/// - 每个实例拥有独立的池与堆预算，多个网络接口可以互不干扰地并存。
///
/// ## 契约（What）
/// - `alloc_pool` 在未配置池、请求超过单元大小或池耗尽时失败，不会回退到堆；
/// - [`alloc`](Self::alloc) 提供“先池后堆”的便捷策略；
/// - 克隆句柄共享同一组后端。
///
/// ## 风险提示（Trade-offs）
/// - 节点在释放时直接归还到创建它的后端，即便管理器句柄已全部丢弃，
///   后端也会一直存活到最后一个节点被释放为止。
#[derive(Clone, Debug)]
pub struct MemoryManager {
    pool: Option<UnitPool>,
    heap: HeapAllocator,
    heap_alignment: usize,
}

impl MemoryManager {
    /// 校验配置并构建后端；池单元在此处一次性分配。
    pub fn new(config: MemoryManagerConfig) -> Result<Self> {
        config.validate()?;
        let pool = config.pool().copied().map(UnitPool::new).transpose()?;
        let heap = HeapAllocator::new(config.heap_limit());
        debug!(
            pool_unit = pool.as_ref().map_or(0, UnitPool::unit_size),
            pool_units = pool.as_ref().map_or(0, UnitPool::unit_count),
            heap_limit = ?config.heap_limit(),
            "memory manager initialised"
        );
        Ok(Self {
            pool,
            heap,
            heap_alignment: config.heap_alignment(),
        })
    }

    pub fn pool(&self) -> Option<&UnitPool> {
        self.pool.as_ref()
    }

    pub fn heap(&self) -> &HeapAllocator {
        &self.heap
    }

    /// 先尝试池，失败（含请求超过单元大小）后改用堆。
    ///
    /// 两者都失败时返回堆侧的错误。
    pub fn alloc(&self, len: usize) -> Result<BufferNode> {
        if let Some(pool) = &self.pool {
            match pool.alloc(len) {
                Ok(node) => return Ok(node),
                Err(err) => trace!(len, code = err.code(), "pool declined, falling back to heap"),
            }
        }
        self.alloc_heap(len)
    }

    /// 移除池空间可用回调。
    pub fn clear_on_pool_space_avail_cb(&self) {
        if let Some(pool) = &self.pool {
            pool.clear_on_pool_space_avail_cb();
        }
    }

    pub fn statistics(&self) -> ManagerStats {
        ManagerStats {
            pool: self.pool.as_ref().map(UnitPool::statistics),
            heap: self.heap.statistics(),
        }
    }
}

impl NetStackMemoryManager for MemoryManager {
    fn alloc_heap(&self, len: usize) -> Result<BufferNode> {
        self.heap.alloc(len, self.heap_alignment)
    }

    fn alloc_heap_aligned(&self, len: usize, alignment: usize) -> Result<BufferNode> {
        self.heap.alloc(len, alignment)
    }

    fn alloc_pool(&self, len: usize) -> Result<BufferNode> {
        match &self.pool {
            Some(pool) => pool.alloc(len),
            None => {
                debug!(len, "pool allocation requested but no pool is configured");
                Err(NetBufError::pool_exhausted(len))
            }
        }
    }

    fn realloc_heap(&self, node: &mut BufferNode, new_len: usize) -> Result<()> {
        self.heap.realloc(node, new_len)
    }

    fn pool_alloc_unit(&self) -> usize {
        self.pool.as_ref().map_or(0, UnitPool::unit_size)
    }

    fn pool_size(&self) -> usize {
        self.pool.as_ref().map_or(0, UnitPool::pool_size)
    }

    fn set_on_pool_space_avail_cb(&self, callback: PoolSpaceAvailableCallback) {
        match &self.pool {
            Some(pool) => pool.install_callback(callback),
            None => trace!("no pool configured, space-available callback ignored"),
        }
    }

    fn free(&self, chain: BufferNode) -> FreeSummary {
        let mut summary = FreeSummary::default();
        let mut cursor = Some(chain);
        while let Some(mut node) = cursor {
            cursor = node.take_next();
            if node.lifetime().is_released_by_manager() {
                summary.released += 1;
            } else {
                summary.retained += 1;
            }
            drop(node);
        }
        debug!(
            released = summary.released,
            retained = summary.retained,
            "buffer chain freed"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PoolConfig, lifetime::Lifetime};
    use alloc::{sync::Arc, vec::Vec};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn manager(unit_size: usize, unit_count: usize) -> MemoryManager {
        MemoryManager::new(
            MemoryManagerConfig::new().with_pool(PoolConfig::new(unit_size, unit_count)),
        )
        .expect("有效配置")
    }

    #[test]
    fn reports_pool_geometry() {
        let manager = manager(128, 4);
        assert_eq!(manager.pool_alloc_unit(), 128);
        assert_eq!(manager.pool_size(), 512);

        let heap_only = MemoryManager::new(MemoryManagerConfig::new()).expect("有效配置");
        assert_eq!(heap_only.pool_alloc_unit(), 0);
        assert_eq!(heap_only.pool_size(), 0);
        assert!(heap_only.alloc_pool(1).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = MemoryManager::new(
            MemoryManagerConfig::new().with_pool(PoolConfig::new(0, 4)),
        )
        .expect_err("单元大小为 0");
        assert_eq!(err.code(), crate::error::codes::INVALID_CONFIG);
    }

    #[test]
    fn alloc_falls_back_to_heap() {
        let manager = manager(64, 1);
        let pooled = manager.alloc(32).expect("池内分配");
        assert_eq!(pooled.lifetime(), Lifetime::PoolAllocated);
        let spilled = manager.alloc(32).expect("池耗尽后走堆");
        assert_eq!(spilled.lifetime(), Lifetime::HeapAllocated);
        let large = manager.alloc(4096).expect("超出单元大小走堆");
        assert_eq!(large.lifetime(), Lifetime::HeapAllocated);
        assert_eq!(large.capacity(), 4096);
    }

    #[traced_test]
    #[test]
    fn free_releases_mixed_chain_and_keeps_constants() {
        let manager = manager(128, 2);
        let mut chain = manager.alloc_pool(10).expect("池分配");
        manager.cat(&mut chain, BufferNode::from_static(b"trailer"));
        manager.cat(&mut chain, manager.alloc_heap(300).expect("堆分配"));
        assert_eq!(manager.count_buffers(&chain), 3);
        assert_eq!(manager.total_len(&chain), 10 + 7 + 300);

        let summary = manager.free(chain);
        assert_eq!(
            summary,
            FreeSummary {
                released: 2,
                retained: 1
            }
        );
        let stats = manager.statistics();
        assert_eq!(stats.pool.expect("已配置池").free_units, 2);
        assert_eq!(stats.heap.outstanding_bytes, 0);
        assert!(logs_contain("buffer chain freed"));
    }

    #[test]
    fn callback_fires_once_per_exhaustion() {
        let manager = manager(128, 4);
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            manager.set_on_pool_space_avail_cb(Arc::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let mut held: Vec<_> =
            (0..4).map(|_| manager.alloc_pool(128).expect("池内分配")).collect();
        assert!(manager.alloc_pool(1).is_err());

        manager.free(held.pop().expect("持有四个节点"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        manager.free(held.pop().expect("持有三个节点"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        manager.clear_on_pool_space_avail_cb();
        drop(held);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn usable_as_trait_object() {
        let manager: Arc<dyn NetStackMemoryManager> = Arc::new(manager(32, 1));
        let mut node = manager.alloc_heap_aligned(16, 16).expect("堆分配");
        assert_eq!(node.as_ptr() as usize % 16, 0);
        manager.realloc_heap(&mut node, 64).expect("扩容");
        assert_eq!(node.capacity(), 64);
        let mut pooled = manager.alloc_pool(8).expect("池分配");
        assert_eq!(
            manager.realloc_heap(&mut pooled, 16),
            Err(NetBufError::invalid_operation(
                "realloc_heap",
                Lifetime::PoolAllocated
            ))
        );
    }

    #[test]
    fn flatten_copies_visible_payload_of_mixed_chain() {
        let manager = manager(16, 2);
        let mut chain = manager.alloc_pool(6).expect("池分配");
        chain
            .data_mut()
            .expect("可写")
            .copy_from_slice(b"ETHabc");
        chain.skip_header_space(3).expect("跳过链路层头部");
        manager.cat(&mut chain, BufferNode::from_static(b"def"));
        let mut heap = manager.alloc_heap(3).expect("堆分配");
        heap.data_mut().expect("可写").copy_from_slice(b"ghi");
        manager.cat(&mut chain, heap);

        let flat = manager
            .flatten_to_heap(&chain, 32, None, 14)
            .expect("展平");
        assert_eq!(flat.lifetime(), Lifetime::HeapAllocated);
        assert!(flat.next().is_none());
        assert_eq!(flat.data(), b"abcdefghi");
        assert_eq!(flat.header_skip_size(), 14);
        assert_eq!(flat.capacity(), 14 + 9);
        assert_eq!((flat.as_ptr() as usize - 14) % 32, 0);

        let padded = manager
            .flatten_to_heap(&chain, 1, Some(12), 0)
            .expect("补零展平");
        assert_eq!(padded.data(), b"abcdefghi\0\0\0");
        let truncated = manager
            .flatten_to_heap(&chain, 1, Some(4), 0)
            .expect("截断展平");
        assert_eq!(truncated.data(), b"abcd");

        manager.free(chain);
        assert_eq!(manager.statistics().pool.expect("已配置池").free_units, 2);
    }
}
