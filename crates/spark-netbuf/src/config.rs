use serde::Deserialize;

use crate::error::{NetBufError, Result};

/// 固定单元池的构造参数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 池在管理器初始化时一次性构建，此后单元大小不可变；将参数集中到配置结构中，
///   便于按网络接口分别声明（例如以太网 MTU 对应 1536 字节单元）；
/// - 支持从宿主配置文件反序列化，避免在驱动代码中硬编码常量。
///
/// ## 契约（What）
/// - `unit_size`：单元可见容量，必须大于 0；
/// - `unit_count`：单元数量，必须大于 0，且 `unit_size * unit_count` 不得溢出；
/// - `alignment`：单元数据起始地址的对齐要求，必须为 2 的幂，默认 1（不额外对齐）。
///   DMA 场景通常设为缓存行大小，使外设回写后的失效操作不会波及相邻数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    unit_size: usize,
    unit_count: usize,
    alignment: usize,
}

impl PoolConfig {
    /// 以给定单元大小与数量构造配置，对齐默认为 1。
    pub const fn new(unit_size: usize, unit_count: usize) -> Self {
        Self {
            unit_size,
            unit_count,
            alignment: 1,
        }
    }

    /// 设置单元对齐。
    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub const fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub const fn unit_count(&self) -> usize {
        self.unit_count
    }

    pub const fn alignment(&self) -> usize {
        self.alignment
    }

    /// 池的总容量（字节）；溢出时返回 `None`。
    pub const fn total_size(&self) -> Option<usize> {
        self.unit_size.checked_mul(self.unit_count)
    }

    /// 校验配置；失败时返回 [`NetBufError::InvalidConfig`]。
    pub fn validate(&self) -> Result<()> {
        if self.unit_size == 0 {
            return Err(NetBufError::InvalidConfig {
                field: "pool.unit_size",
                reason: "must be greater than zero",
            });
        }
        if self.unit_count == 0 {
            return Err(NetBufError::InvalidConfig {
                field: "pool.unit_count",
                reason: "must be greater than zero",
            });
        }
        if !self.alignment.is_power_of_two() {
            return Err(NetBufError::InvalidConfig {
                field: "pool.alignment",
                reason: "must be a power of two",
            });
        }
        if self.total_size().is_none() {
            return Err(NetBufError::InvalidConfig {
                field: "pool.unit_count",
                reason: "unit_size * unit_count overflows usize",
            });
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    /// 默认值对应一个以太网帧大小的单元，共 16 个。
    fn default() -> Self {
        Self::new(1536, 16)
    }
}

/// 内存管理器的整体配置。
///
/// ## 意图（Why）
/// - 允许同一进程为不同网络接口构造相互独立的管理器，每个实例拥有自己的池与堆预算；
/// - 堆预算让“堆分配失败”在宿主内存之外也能被确定性地触发，
///   使背压路径在测试与受限部署中都可验证。
///
/// ## 契约（What）
/// - `pool`：可选的固定单元池，`None` 表示所有 `alloc_pool` 请求都会失败；
/// - `heap_limit`：堆上同时存活的最大字节数（按节点容量计），`None` 表示不设上限；
/// - `heap_alignment`：`alloc_heap` 默认使用的对齐，必须为 2 的幂；
/// - 默认值：无池、无堆上限、对齐为 1。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryManagerConfig {
    pool: Option<PoolConfig>,
    heap_limit: Option<usize>,
    heap_alignment: usize,
}

impl MemoryManagerConfig {
    pub const fn new() -> Self {
        Self {
            pool: None,
            heap_limit: None,
            heap_alignment: 1,
        }
    }

    pub const fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    pub const fn with_heap_limit(mut self, limit: Option<usize>) -> Self {
        self.heap_limit = limit;
        self
    }

    pub const fn with_heap_alignment(mut self, alignment: usize) -> Self {
        self.heap_alignment = alignment;
        self
    }

    pub const fn pool(&self) -> Option<&PoolConfig> {
        self.pool.as_ref()
    }

    pub const fn heap_limit(&self) -> Option<usize> {
        self.heap_limit
    }

    pub const fn heap_alignment(&self) -> usize {
        self.heap_alignment
    }

    /// 递归校验池配置与堆参数。
    pub fn validate(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.validate()?;
        }
        if !self.heap_alignment.is_power_of_two() {
            return Err(NetBufError::InvalidConfig {
                field: "heap_alignment",
                reason: "must be a power of two",
            });
        }
        Ok(())
    }
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}
