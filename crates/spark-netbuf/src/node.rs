use alloc::{boxed::Box, vec, vec::Vec};
use core::{fmt, mem};

use bytes::{Bytes, BytesMut};

use crate::{
    error::{NetBufError, Result},
    lease::{Lease, Storage, align_pad},
    lifetime::Lifetime,
};

/// `BufferNode` 是缓冲链中的一个分段，链整体表示一个（可能分片的）报文。
///
/// # 设计动机（Why）
/// - 链路层驱动常把一帧接收进多个池单元，上层协议又需要在负载前方追加头部；
///   单向链表 + 头部跳过计数可以在不复制负载的情况下满足这两类需求；
/// - 每个节点独占其后继（`Option<Box<BufferNode>>`），拼接只能转移所有权，
///   因而链在类型层面无法成环，也无法把链拼接到自身。
///
/// # 内存布局（How）
/// ```text
/// storage: | pad | header_skip | len (可见负载) | 余量 |
///                ^-- capacity 从这里开始计算 ------------^
/// ```
/// - `pad` 为满足对齐而跳过的字节，对调用方不可见，也不计入 `capacity`；
/// - `header_skip` 为当前隐藏在前方的字节，由 `skip_header_space`/`restore_header_space` 调整；
/// - 不变量：`len + header_skip <= capacity`。
///
/// # 契约说明（What）
/// - 丢弃节点会沿链依次归还每个节点的存储（池单元回到自由链表、堆预算被扣减），
///   该过程是迭代的，链长不会导致栈深度增长；
/// - `Constant` 节点只读，任何写入都返回 [`NetBufError::InvalidOperation`]；
/// - `Volatile` 节点的内容可能被外设在两次访问之间改写，读取方需自行同步。
pub struct BufferNode {
    pub(crate) storage: Storage,
    pub(crate) pad: usize,
    pub(crate) alignment: usize,
    pub(crate) capacity: usize,
    pub(crate) len: usize,
    pub(crate) header_skip: usize,
    pub(crate) lifetime: Lifetime,
    pub(crate) lease: Option<Lease>,
    pub(crate) next: Option<Box<BufferNode>>,
}

impl BufferNode {
    /// 由分配器构造带租约的可写节点。
    pub(crate) fn leased(
        storage: BytesMut,
        alignment: usize,
        capacity: usize,
        len: usize,
        lifetime: Lifetime,
        lease: Lease,
    ) -> Self {
        let pad = align_pad(storage.as_ptr(), alignment);
        debug_assert!(len <= capacity);
        debug_assert!(pad + capacity <= storage.len());
        Self {
            storage: Storage::Owned(storage),
            pad,
            alignment,
            capacity,
            len,
            header_skip: 0,
            lifetime,
            lease: Some(lease),
            next: None,
        }
    }

    /// 以静态只读数据构造 `Constant` 节点，不复制数据。
    pub fn from_static(data: &'static [u8]) -> Self {
        Self::from_shared(Bytes::from_static(data))
    }

    /// 以共享只读字节构造 `Constant` 节点；同一份数据可挂接到多个报文。
    pub fn from_shared(data: Bytes) -> Self {
        let len = data.len();
        Self {
            storage: Storage::Shared(data),
            pad: 0,
            alignment: 1,
            capacity: len,
            len,
            header_skip: 0,
            lifetime: Lifetime::Constant,
            lease: None,
            next: None,
        }
    }

    /// 以调用方提供的存储构造 `Volatile` 节点，容量与初始长度均为 `buffer.len()`。
    ///
    /// 典型来源是外设可直接写入的接收区；释放时按堆语义直接丢弃该存储。
    pub fn from_volatile(buffer: BytesMut) -> Self {
        let len = buffer.len();
        Self {
            storage: Storage::Owned(buffer),
            pad: 0,
            alignment: 1,
            capacity: len,
            len,
            header_skip: 0,
            lifetime: Lifetime::Volatile,
            lease: None,
            next: None,
        }
    }

    /// 节点的生命周期标记。
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// 当前可见负载长度。
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 节点容量（不含对齐填充）。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 头部跳过量为 0 时数据起始地址满足的对齐。
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// 设置可见负载长度。
    ///
    /// # 契约
    /// - `len` 不得超过 `capacity - header_skip`，否则返回 [`NetBufError::InvalidLength`]，
    ///   绝不静默截断。
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        let limit = self.capacity - self.header_skip;
        if len > limit {
            return Err(NetBufError::InvalidLength {
                requested: len,
                limit,
            });
        }
        self.len = len;
        Ok(())
    }

    fn visible_start(&self) -> usize {
        self.pad + self.header_skip
    }

    /// 可见负载的只读视图。
    pub fn data(&self) -> &[u8] {
        let start = self.visible_start();
        &self.storage.as_slice()[start..start + self.len]
    }

    /// 可见负载的可写视图；`Constant` 节点返回错误。
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let start = self.visible_start();
        let end = start + self.len;
        let lifetime = self.lifetime;
        match self.storage.as_mut_slice() {
            Some(slice) => Ok(&mut slice[start..end]),
            None => Err(NetBufError::invalid_operation("data_mut", lifetime)),
        }
    }

    /// 指向首个可见字节的指针。
    pub fn as_ptr(&self) -> *const u8 {
        self.storage.as_slice()[self.visible_start()..].as_ptr()
    }

    /// 将前 `len` 个可见字节隐藏为头部空间。
    ///
    /// # 契约
    /// - 可跳过的上限是当前可见长度；超出时返回
    ///   [`NetBufError::InsufficientReservedSpace`]，节点保持不变；
    /// - 成功后可见指针前移 `len`，可见长度减少 `len`。
    pub fn skip_header_space(&mut self, len: usize) -> Result<()> {
        if len > self.len {
            return Err(NetBufError::InsufficientReservedSpace {
                requested: len,
                available: self.len,
            });
        }
        self.header_skip += len;
        self.len -= len;
        Ok(())
    }

    /// 重新暴露 `len` 个此前隐藏的字节，是 [`skip_header_space`](Self::skip_header_space) 的逆操作。
    pub fn restore_header_space(&mut self, len: usize) -> Result<()> {
        if len > self.header_skip {
            return Err(NetBufError::InsufficientReservedSpace {
                requested: len,
                available: self.header_skip,
            });
        }
        self.header_skip -= len;
        self.len += len;
        Ok(())
    }

    /// 当前隐藏在前方的字节数。
    pub fn header_skip_size(&self) -> usize {
        self.header_skip
    }

    /// 链中的下一个节点。
    pub fn next(&self) -> Option<&BufferNode> {
        self.next.as_deref()
    }

    pub fn next_mut(&mut self) -> Option<&mut BufferNode> {
        self.next.as_deref_mut()
    }

    /// 从当前节点处断开链，返回原后继链。
    pub fn take_next(&mut self) -> Option<BufferNode> {
        self.next.take().map(|node| *node)
    }

    /// 把 `other` 整条链追加到本链尾部，`other` 的所有权随之转移。
    ///
    /// 需遍历到尾节点，复杂度为本链长度。
    pub fn cat(&mut self, other: BufferNode) {
        let mut tail = self;
        while let Some(ref mut next) = tail.next {
            tail = &mut **next;
        }
        tail.next = Some(Box::new(other));
    }

    /// 从当前节点起的节点数量。
    pub fn count_buffers(&self) -> usize {
        self.iter().count()
    }

    /// 从当前节点起所有节点可见长度之和。
    pub fn total_len(&self) -> usize {
        self.iter().map(BufferNode::len).sum()
    }

    /// 依次遍历从当前节点起的每个分段。
    pub fn iter(&self) -> Iter<'_> {
        Iter { next: Some(self) }
    }

    /// 从扁平化负载的 `offset` 处起，复制至多 `dst.len()` 个字节到 `dst`。
    ///
    /// 返回实际复制的字节数；链不足时少于 `dst.len()`，`offset` 越过链尾时为 0。
    /// 该操作只读，不会越界读取。
    pub fn copy_to_buf(&self, dst: &mut [u8], offset: usize) -> usize {
        let mut skip = offset;
        let mut copied = 0;
        for node in self.iter() {
            if copied == dst.len() {
                break;
            }
            let data = node.data();
            if skip >= data.len() {
                skip -= data.len();
                continue;
            }
            let src = &data[skip..];
            skip = 0;
            let n = src.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
        }
        copied
    }

    /// 把 `src` 写入扁平化负载的 `offset` 处，透明跨越节点边界。
    ///
    /// # 契约
    /// - `offset + src.len()` 超过 [`total_len`](Self::total_len) 时返回 [`NetBufError::OutOfRange`]；
    /// - 写入区间覆盖 `Constant` 节点时返回 [`NetBufError::InvalidOperation`]；
    /// - 两类检查都在写入前完成，失败时链内容不变。
    pub fn copy_from_buf(&mut self, src: &[u8], offset: usize) -> Result<()> {
        let total = self.total_len();
        let end = offset.checked_add(src.len()).filter(|end| *end <= total);
        let Some(end) = end else {
            return Err(NetBufError::OutOfRange {
                offset,
                len: src.len(),
                total,
            });
        };
        if src.is_empty() {
            return Ok(());
        }

        let mut start = 0;
        for node in self.iter() {
            let node_end = start + node.len;
            if node_end > offset && start < end && !node.lifetime.is_writable() {
                return Err(NetBufError::invalid_operation("copy_from_buf", node.lifetime));
            }
            start = node_end;
        }

        let mut skip = offset;
        let mut written = 0;
        let mut cursor = Some(self);
        while let Some(node) = cursor {
            if written == src.len() {
                break;
            }
            let len = node.len;
            if skip >= len {
                skip -= len;
            } else {
                let data = node.data_mut()?;
                let n = (len - skip).min(src.len() - written);
                data[skip..skip + n].copy_from_slice(&src[written..written + n]);
                written += n;
                skip = 0;
            }
            cursor = node.next.as_deref_mut();
        }
        Ok(())
    }

    /// 将整条链的可见负载拼接为连续字节。
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_len()];
        let copied = self.copy_to_buf(&mut out, 0);
        debug_assert_eq!(copied, out.len());
        out
    }
}

impl Drop for BufferNode {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let storage = mem::replace(&mut self.storage, Storage::Shared(Bytes::new()));
            lease.release(storage.into_owned());
        }
        // 逐个摘下后继，避免 Box 递归析构。
        let mut next = self.next.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

impl fmt::Debug for BufferNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferNode")
            .field("lifetime", &self.lifetime)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("header_skip", &self.header_skip)
            .field("has_next", &self.next.is_some())
            .finish()
    }
}

/// [`BufferNode::iter`] 返回的分段迭代器。
pub struct Iter<'a> {
    next: Option<&'a BufferNode>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a BufferNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(node)
    }
}
