use core::fmt;

/// `Lifetime` 标记缓冲节点的内存来源，决定 `free` 时的处置策略。
///
/// # 契约说明（What）
/// - `PoolAllocated`：占用池中一个固定大小单元，释放时归还自由链表；
/// - `HeapAllocated`：来自通用堆，释放时交还分配器并扣减堆统计；
/// - `Constant`：引用只读静态数据，可被多个报文共享，管理器永远不会释放；
/// - `Volatile`：调用方提供的存储（如 DMA 可见区域），内容可能被外部异步改写，
///   处置方式与堆节点一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifetime {
    PoolAllocated,
    HeapAllocated,
    Constant,
    Volatile,
}

impl Lifetime {
    /// 是否需要由管理器回收底层存储。
    pub const fn is_released_by_manager(self) -> bool {
        !matches!(self, Lifetime::Constant)
    }

    /// 节点内容是否允许写入。
    pub const fn is_writable(self) -> bool {
        !matches!(self, Lifetime::Constant)
    }

    /// 稳定的小写标识，用于日志字段与错误描述。
    pub const fn as_str(self) -> &'static str {
        match self {
            Lifetime::PoolAllocated => "pool_allocated",
            Lifetime::HeapAllocated => "heap_allocated",
            Lifetime::Constant => "constant",
            Lifetime::Volatile => "volatile",
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
