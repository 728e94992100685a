#![cfg_attr(not(feature = "std"), no_std)]

//! `spark-netbuf` 为嵌入式网络协议栈提供缓冲链内存管理。
//!
//! # 模块定位（Why）
//! - 链路层驱动与上层协议共享同一套报文缓冲：接收路径需要确定延迟的固定单元池，
//!   发送与重组路径需要任意长度的堆缓冲，只读常量（如固定报文模板）则应零拷贝挂接；
//! - 报文以单向链表表示，协议层通过“头部跳过”在不复制负载的前提下剥离或预留头部。
//!
//! # 设计概要（How）
//! - [`BufferNode`] 是链中的一个分段，独占后继节点，拼接只能转移所有权；
//! - [`UnitPool`] 以 `spin::Mutex` 保护的自由链表复用预分配的 `bytes::BytesMut` 单元，
//!   在“耗尽 -> 可用”转换时同步通知注册的回调；
//! - [`HeapAllocator`] 提供带可选字节预算的变长分配与重分配；
//! - 节点通过内部租约在 `Drop` 时把存储交还所属后端，[`MemoryManager::free`](NetStackMemoryManager::free)
//!   只是显式、可观测的释放入口；
//! - [`MemoryManager`] 组合两类后端并实现 [`NetStackMemoryManager`]。
//!
//! # 命名约定（Consistency）
//! - 与协议栈既有术语保持一致：`alloc_pool`、`alloc_heap`、`realloc_heap`、`pool_alloc_unit`、
//!   `set_on_pool_space_avail_cb`；节点访问器采用 Rust 惯用名（`len`、`set_len`、`total_len`、`next`）。

extern crate alloc;

mod config;
mod error;
mod heap;
mod lease;
mod lifetime;
mod manager;
mod node;
mod pool;

pub use config::{MemoryManagerConfig, PoolConfig};
pub use error::{AllocationSource, NetBufError, Result, codes};
pub use heap::{HeapAllocator, HeapStats};
pub use lifetime::Lifetime;
pub use manager::{FreeSummary, ManagerStats, MemoryManager, NetStackMemoryManager};
pub use node::{BufferNode, Iter};
pub use pool::{PoolSpaceAvailableCallback, PoolStats, UnitPool};
