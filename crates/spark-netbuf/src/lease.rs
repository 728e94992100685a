use alloc::{sync::Arc, vec::Vec};

use bytes::{Bytes, BytesMut};

/// `StorageRecycler` 描述节点存储在生命周期结束时的归还入口。
///
/// # 设计初衷（Why）
/// - 池节点需要把单元送回自由链表，堆节点需要扣减预算统计；
///   两类后端的差异只体现在“归还时做什么”，因此抽象为单一回调接口，
///   节点本身无需区分后端即可在 `Drop` 阶段完成处置。
///
/// # 契约定义（What）
/// - **前置条件**：实现必须线程安全，且调用过程中不得 panic，
///   否则 `Drop` 路径上的 panic 将导致进程异常终止；
/// - **后置条件**：`reclaim` 返回后，后端已记录该容量的可用性。
///   池实现可能在此处同步触发空间可用回调。
pub(crate) trait StorageRecycler: Send + Sync + 'static {
    /// 通知后端回收一段存储。
    fn reclaim(&self, reclaimed: ReclaimedStorage);
}

/// 一次回收动作携带的上下文。
///
/// - `capacity`：租借时登记的容量，后端据此更新统计；
/// - `buffer`：原始 `BytesMut`；池实现会把它放回自由链表复用，
///   堆实现直接丢弃以释放内存。
#[derive(Debug)]
pub(crate) struct ReclaimedStorage {
    capacity: usize,
    buffer: Option<BytesMut>,
}

impl ReclaimedStorage {
    pub(crate) fn new(capacity: usize, buffer: Option<BytesMut>) -> Self {
        Self { capacity, buffer }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// 消耗结构并返回可复用的 `BytesMut`，若不存在则为 `None`。
    pub(crate) fn into_buffer(self) -> Option<BytesMut> {
        self.buffer
    }
}

/// 节点与其后端之间的租约。
///
/// 只有池节点与堆节点持有租约；`Constant` 与 `Volatile` 节点的存储不属于任何后端。
pub(crate) struct Lease {
    recycler: Arc<dyn StorageRecycler>,
    capacity: usize,
}

impl Lease {
    pub(crate) fn new(capacity: usize, recycler: Arc<dyn StorageRecycler>) -> Self {
        Self { recycler, capacity }
    }

    /// 租约是否由 `owner` 发放。
    pub(crate) fn is_issued_by<R: StorageRecycler>(&self, owner: &Arc<R>) -> bool {
        core::ptr::addr_eq(Arc::as_ptr(&self.recycler), Arc::as_ptr(owner))
    }

    /// `realloc_heap` 调整容量后刷新登记值，保证归还时统计一致。
    pub(crate) fn update_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// 结束租约并把存储交还后端。
    pub(crate) fn release(self, buffer: Option<BytesMut>) {
        self.recycler
            .reclaim(ReclaimedStorage::new(self.capacity, buffer));
    }
}

impl core::fmt::Debug for Lease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lease")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// 节点底层存储的两种形态。
///
/// - `Owned`：可写的 `BytesMut`，长度恒等于原始分配大小（含对齐填充）；
/// - `Shared`：只读的 `Bytes`，用于 `Constant` 节点，克隆为引用计数操作，不复制数据。
#[derive(Debug)]
pub(crate) enum Storage {
    Owned(BytesMut),
    Shared(Bytes),
}

impl Storage {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(buf) => buf.as_ref(),
            Storage::Shared(bytes) => bytes.as_ref(),
        }
    }

    /// 只有 `Owned` 存储提供可写视图。
    pub(crate) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Storage::Owned(buf) => Some(buf.as_mut()),
            Storage::Shared(_) => None,
        }
    }

    pub(crate) fn into_owned(self) -> Option<BytesMut> {
        match self {
            Storage::Owned(buf) => Some(buf),
            Storage::Shared(_) => None,
        }
    }
}

/// 计算 `ptr` 向上对齐到 `align` 所需跳过的字节数。
///
/// `align` 必须为 2 的幂。
pub(crate) fn align_pad(ptr: *const u8, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    let misalignment = (ptr as usize) & (align - 1);
    if misalignment == 0 { 0 } else { align - misalignment }
}

/// 分配一段足以在任意起始地址上容纳 `len` 字节对齐数据的零初始化存储，
/// 返回存储与对齐填充长度。
///
/// 分配器拒绝请求或长度溢出时返回 `None`，不会中止进程。
pub(crate) fn allocate_aligned(len: usize, align: usize) -> Option<(BytesMut, usize)> {
    let raw = len.checked_add(align - 1)?;
    let mut storage = Vec::new();
    storage.try_reserve_exact(raw).ok()?;
    storage.resize(raw, 0);
    let buffer = BytesMut::from(Bytes::from(storage));
    let pad = align_pad(buffer.as_ptr(), align);
    Some((buffer, pad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRecycler {
        reclaimed: AtomicUsize,
        returned_buffers: AtomicUsize,
    }

    impl StorageRecycler for CountingRecycler {
        fn reclaim(&self, reclaimed: ReclaimedStorage) {
            self.reclaimed
                .fetch_add(reclaimed.capacity(), Ordering::Relaxed);
            if reclaimed.into_buffer().is_some() {
                self.returned_buffers.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn release_reports_updated_capacity() {
        let recycler = Arc::new(CountingRecycler::default());
        let mut lease = Lease::new(64, recycler.clone());
        lease.update_capacity(96);
        lease.release(Some(BytesMut::zeroed(96)));
        assert_eq!(recycler.reclaimed.load(Ordering::Relaxed), 96);
        assert_eq!(recycler.returned_buffers.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn lease_remembers_its_issuer() {
        let issuer = Arc::new(CountingRecycler::default());
        let stranger = Arc::new(CountingRecycler::default());
        let lease = Lease::new(8, issuer.clone());
        assert!(lease.is_issued_by(&issuer));
        assert!(!lease.is_issued_by(&stranger));
        lease.release(None);
    }

    #[test]
    fn impossible_sizes_are_refused_instead_of_aborting() {
        assert!(allocate_aligned(isize::MAX as usize - 16, 1).is_none());
        assert!(allocate_aligned(usize::MAX, 64).is_none());
    }

    #[test]
    fn aligned_allocation_yields_aligned_start() {
        for align in [1usize, 2, 8, 32, 64] {
            let (buffer, pad) = allocate_aligned(100, align).expect("容量不应溢出");
            assert!(pad < align);
            assert!(buffer.len() >= pad + 100);
            let start = buffer[pad..].as_ptr() as usize;
            assert_eq!(start % align, 0, "对齐 {align} 未满足");
        }
    }
}
