use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::debug;

use crate::{
    error::{NetBufError, Result},
    lease::{Lease, ReclaimedStorage, Storage, StorageRecycler, align_pad, allocate_aligned},
    lifetime::Lifetime,
    node::BufferNode,
};

/// `HeapAllocator` 服务超过池单元大小、或池已耗尽时的变长分配。
///
/// # 设计背景（Why）
/// - 池只能提供固定大小的单元，协议栈仍需要为大报文或重组缓冲申请任意长度的内存；
/// - 通过可选的字节预算限制同时存活的堆缓冲总量，使“堆分配失败”成为可预测、
///   可测试的返回值，而不是进程级的内存耗尽。
///
/// # 契约说明（What）
/// - `alloc` 返回容量与可见长度都恰好等于请求长度的节点，标记为 [`Lifetime::HeapAllocated`]；
/// - 失败时返回 [`NetBufError::AllocationFailed`]，不会部分成功；
/// - `realloc` 仅接受堆节点，失败时原节点保持有效且内容不变。
///
/// # 风险提示（Trade-offs）
/// - 预算按节点容量记账，不包含对齐填充与分配器元数据，实际驻留内存略高于统计值。
#[derive(Clone)]
pub struct HeapAllocator {
    inner: Arc<HeapInner>,
}

impl HeapAllocator {
    /// 创建堆分配器，`limit` 为 `None` 时不设预算。
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(HeapInner {
                limit,
                outstanding_bytes: AtomicUsize::new(0),
                active_allocations: AtomicUsize::new(0),
                failed_allocations: AtomicU64::new(0),
            }),
        }
    }

    /// 分配 `len` 字节、数据起始地址按 `alignment` 对齐的堆节点。
    pub fn alloc(&self, len: usize, alignment: usize) -> Result<BufferNode> {
        if !alignment.is_power_of_two() {
            return Err(NetBufError::InvalidAlignment { alignment });
        }
        self.inner.reserve(len)?;
        let Some((storage, _)) = allocate_aligned(len, alignment) else {
            self.inner.release(len);
            self.inner.record_failure();
            debug!(len, alignment, "system allocator refused heap buffer");
            return Err(NetBufError::heap_rejected(len));
        };
        self.inner
            .active_allocations
            .fetch_add(1, Ordering::Relaxed);
        let recycler: Arc<dyn StorageRecycler> = self.inner.clone();
        Ok(BufferNode::leased(
            storage,
            alignment,
            len,
            len,
            Lifetime::HeapAllocated,
            Lease::new(len, recycler),
        ))
    }

    /// 将堆节点的容量调整为 `new_len`。
    ///
    /// # 契约
    /// - 非堆节点、或由其它分配器发放的堆节点返回 [`NetBufError::InvalidOperation`]，
    ///   预算始终记在发放节点的分配器上；
    /// - `new_len` 小于当前头部跳过量时返回 [`NetBufError::InvalidLength`]；
    /// - 缩容原地完成，可见长度被截断到新容量以内；
    /// - 扩容在底层存储尚有余量时原地完成，否则重新分配并复制头部与负载，对齐保持不变；
    /// - 预算不足时返回 [`NetBufError::AllocationFailed`]，节点不受影响。
    pub fn realloc(&self, node: &mut BufferNode, new_len: usize) -> Result<()> {
        if node.lifetime != Lifetime::HeapAllocated {
            return Err(NetBufError::invalid_operation("realloc_heap", node.lifetime));
        }
        if new_len < node.header_skip {
            return Err(NetBufError::InvalidLength {
                requested: new_len,
                limit: node.header_skip,
            });
        }
        let Some(lease) = node.lease.as_mut() else {
            return Err(NetBufError::invalid_operation("realloc_heap", node.lifetime));
        };
        if !lease.is_issued_by(&self.inner) {
            debug!(
                capacity = node.capacity,
                new_len, "heap node belongs to another allocator, realloc refused"
            );
            return Err(NetBufError::invalid_operation("realloc_heap", node.lifetime));
        }

        let old_len = node.capacity;
        if new_len <= old_len {
            self.inner.release(old_len - new_len);
            lease.update_capacity(new_len);
            node.capacity = new_len;
            node.len = node.len.min(new_len - node.header_skip);
            return Ok(());
        }

        self.inner.reserve(new_len - old_len)?;
        let in_place = node.pad + new_len <= node.storage.as_slice().len();
        if !in_place {
            let Some((mut storage, _)) = allocate_aligned(new_len, node.alignment) else {
                self.inner.release(new_len - old_len);
                self.inner.record_failure();
                return Err(NetBufError::heap_rejected(new_len));
            };
            let pad = align_pad(storage.as_ptr(), node.alignment);
            let used = node.header_skip + node.len;
            let old = &node.storage.as_slice()[node.pad..node.pad + used];
            storage[pad..pad + used].copy_from_slice(old);
            node.storage = Storage::Owned(storage);
            node.pad = pad;
            debug!(old_len, new_len, "heap buffer relocated");
        }
        lease.update_capacity(new_len);
        node.capacity = new_len;
        Ok(())
    }

    /// 读取统计快照。
    pub fn statistics(&self) -> HeapStats {
        HeapStats {
            outstanding_bytes: self.inner.outstanding_bytes.load(Ordering::Relaxed),
            limit: self.inner.limit,
            active_allocations: self.inner.active_allocations.load(Ordering::Relaxed),
            failed_allocations: self.inner.failed_allocations.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("stats", &self.statistics())
            .finish()
    }
}

/// 堆统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub outstanding_bytes: usize,
    pub limit: Option<usize>,
    pub active_allocations: usize,
    pub failed_allocations: u64,
}

struct HeapInner {
    limit: Option<usize>,
    outstanding_bytes: AtomicUsize,
    active_allocations: AtomicUsize,
    failed_allocations: AtomicU64,
}

impl HeapInner {
    /// 在预算内登记 `bytes`；超出预算时不做任何修改并返回错误。
    fn reserve(&self, bytes: usize) -> Result<()> {
        let limit = self.limit;
        let granted = self
            .outstanding_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(bytes)?;
                match limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            });
        match granted {
            Ok(_) => Ok(()),
            Err(current) => {
                self.record_failure();
                debug!(
                    requested = bytes,
                    outstanding = current,
                    limit = ?limit,
                    "heap budget exceeded"
                );
                Err(NetBufError::heap_rejected(bytes))
            }
        }
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .outstanding_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    fn record_failure(&self) {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }
}

impl StorageRecycler for HeapInner {
    fn reclaim(&self, reclaimed: ReclaimedStorage) {
        self.release(reclaimed.capacity());
        let _ = self
            .active_allocations
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(prev.saturating_sub(1))
            });
        drop(reclaimed.into_buffer());
    }
}
