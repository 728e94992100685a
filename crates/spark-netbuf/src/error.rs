//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为缓冲管理器对外暴露的全部失败语义提供集中定义，协议栈上层只需匹配一个枚举；
//! - 区分“可恢复的分配失败”与“调用方编程错误”，前者驱动丢包/背压，后者应尽早暴露。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，在 `no_std` 下同样实现 `core::error::Error`；
//! - 每个变体携带足够的数值上下文（请求长度、可用上限），且绝不静默截断；
//! - 稳定错误码遵循 `<域>.<语义>` 约定，便于日志聚合。

use thiserror::Error;

use crate::lifetime::Lifetime;

/// 分配请求落在哪一类后端。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationSource {
    Pool,
    Heap,
}

impl core::fmt::Display for AllocationSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AllocationSource::Pool => f.write_str("pool"),
            AllocationSource::Heap => f.write_str("heap"),
        }
    }
}

/// 网络缓冲管理器的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：受限内存系统必须允许优雅降级，因此分配失败始终以返回值表达，
///   由调用方决定重试、切换策略或丢弃报文；
/// - **契约 (What)**：
///   - `AllocationFailed` 是唯一可恢复的变体，[`is_recoverable`](Self::is_recoverable) 据此返回 `true`；
///   - 其余变体表示长度、偏移或生命周期与节点状态不一致，属于调用方缺陷；
/// - **设计权衡 (Trade-offs)**：字段全部为 `Copy` 数值或 `'static` 字符串，
///   构造错误不触发堆分配，可在池耗尽等内存紧张路径上安全返回。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NetBufError {
    /// 池已耗尽、请求超过池单元大小，或堆预算/分配器拒绝了请求。
    #[error("{backend} allocation of {requested} bytes failed")]
    AllocationFailed {
        backend: AllocationSource,
        requested: usize,
    },

    /// 长度与节点容量或头部跳过量不相容。
    #[error("length {requested} violates the permitted limit {limit}")]
    InvalidLength { requested: usize, limit: usize },

    /// 对齐参数不是 2 的幂。
    #[error("alignment {alignment} is not a power of two")]
    InvalidAlignment { alignment: usize },

    /// 头部跳过/恢复的字节数超过当前可调整的余量。
    #[error("header space adjustment of {requested} bytes exceeds the available {available} bytes")]
    InsufficientReservedSpace { requested: usize, available: usize },

    /// 逻辑偏移与长度超出链总长度。
    #[error("range {offset}..{offset}+{len} is outside a chain of {total} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        total: usize,
    },

    /// 操作与节点生命周期不匹配，例如对池节点调用 `realloc_heap`。
    #[error("operation `{operation}` is not valid for a {lifetime} buffer")]
    InvalidOperation {
        operation: &'static str,
        lifetime: Lifetime,
    },

    /// 配置未通过校验。
    #[error("invalid configuration `{field}`: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },
}

/// 稳定错误码。
pub mod codes {
    pub const ALLOCATION_FAILED: &str = "netbuf.allocation_failed";
    pub const INVALID_LENGTH: &str = "netbuf.invalid_length";
    pub const INVALID_ALIGNMENT: &str = "netbuf.invalid_alignment";
    pub const INSUFFICIENT_RESERVED_SPACE: &str = "netbuf.insufficient_reserved_space";
    pub const OUT_OF_RANGE: &str = "netbuf.out_of_range";
    pub const INVALID_OPERATION: &str = "netbuf.invalid_operation";
    pub const INVALID_CONFIG: &str = "netbuf.invalid_config";
}

impl NetBufError {
    /// 返回稳定错误码，供日志与指标维度使用。
    pub const fn code(&self) -> &'static str {
        match self {
            NetBufError::AllocationFailed { .. } => codes::ALLOCATION_FAILED,
            NetBufError::InvalidLength { .. } => codes::INVALID_LENGTH,
            NetBufError::InvalidAlignment { .. } => codes::INVALID_ALIGNMENT,
            NetBufError::InsufficientReservedSpace { .. } => codes::INSUFFICIENT_RESERVED_SPACE,
            NetBufError::OutOfRange { .. } => codes::OUT_OF_RANGE,
            NetBufError::InvalidOperation { .. } => codes::INVALID_OPERATION,
            NetBufError::InvalidConfig { .. } => codes::INVALID_CONFIG,
        }
    }

    /// 调用方能否通过重试、退避或改用其它分配策略恢复。
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, NetBufError::AllocationFailed { .. })
    }

    pub(crate) const fn pool_exhausted(requested: usize) -> Self {
        NetBufError::AllocationFailed {
            backend: AllocationSource::Pool,
            requested,
        }
    }

    pub(crate) const fn heap_rejected(requested: usize) -> Self {
        NetBufError::AllocationFailed {
            backend: AllocationSource::Heap,
            requested,
        }
    }

    pub(crate) const fn invalid_operation(operation: &'static str, lifetime: Lifetime) -> Self {
        NetBufError::InvalidOperation {
            operation,
            lifetime,
        }
    }
}

/// crate 内统一的结果别名。
pub type Result<T, E = NetBufError> = core::result::Result<T, E>;
