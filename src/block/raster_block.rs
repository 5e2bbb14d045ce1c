//! 内存块结构
//!
//! 一个 [`RasterBlock`] 是某个波段的一个块在内存中的副本：
//! 块坐标、像素缓冲区、脏标志和引用状态。
//!
//! # 引用状态
//!
//! `lock_count` 用一个原子整数同时表示三种状态：
//!
//! | 值    | 含义                         |
//! |-------|------------------------------|
//! | `0`   | 未锁定                       |
//! | `n>0` | 被 n 个持有者锁定使用        |
//! | `-1`  | 锁定待移除（正在驱逐/刷新）  |
//!
//! [`acquire_lock`](RasterBlock::acquire_lock) 和
//! [`take_for_removal`](RasterBlock::take_for_removal) 都是单次 CAS，
//! 两者竞争时只有一方成功。

use crate::error::{Error, ErrorKind, Result};
use crate::types::BlockKey;
use bitflags::bitflags;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

bitflags! {
    /// 块状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// 数据已修改（脏）
        const DIRTY            = 0x01;
        /// 已从索引移除，等待持有者释放后完成拆除
        const REMOVAL_PENDING  = 0x02;
        /// 延迟拆除时需要写回脏数据
        const WRITE_ON_REMOVAL = 0x04;
        /// 已拆除（已写回并交出缓冲区）
        const TORN_DOWN        = 0x08;
    }
}

/// 块的所属者（波段）
///
/// 块只持有所属者的弱引用；读、写和驱逐都经由这里回到波段。
pub trait BlockOwner: Send + Sync {
    /// 从后备存储读取一个块
    fn read_block(&self, key: BlockKey, buf: &mut [u8]) -> Result<()>;

    /// 把一个块写入后备存储
    fn write_block(&self, key: BlockKey, buf: &[u8]) -> Result<()>;

    /// 完成一个已被注册表选中驱逐的块
    ///
    /// 调用时块已锁定待移除并已离开 LRU 链表。实现负责从索引中摘除块、
    /// 写回脏数据并拆除块，返回可回收的像素缓冲区。
    fn evict(&self, block: &Arc<RasterBlock>) -> Vec<u8>;

    /// 回收一个像素缓冲区
    fn recycle_payload(&self, payload: Vec<u8>) {
        drop(payload);
    }
}

/// [`RasterBlock::take_for_removal`] 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalLock {
    /// 成功锁定待移除，调用者负责拆除
    Taken,
    /// 仍有持有者
    InUse,
    /// 已被其他线程锁定待移除
    AlreadyRemoving,
}

/// 内存中的一个块
pub struct RasterBlock {
    /// 注册表中的唯一句柄
    serial: u64,
    key: BlockKey,
    /// 像素缓冲区字节数（计入预算的大小）
    size: usize,
    owner: Weak<dyn BlockOwner>,
    lock_count: AtomicI32,
    flags: AtomicU8,
    data: RwLock<Vec<u8>>,
}

impl RasterBlock {
    /// 创建块
    ///
    /// # 参数
    ///
    /// * `serial` - 注册表分配的句柄
    /// * `key` - 块坐标
    /// * `payload` - 像素缓冲区（长度即块字节数）
    /// * `owner` - 所属波段
    pub fn new(serial: u64, key: BlockKey, payload: Vec<u8>, owner: Weak<dyn BlockOwner>) -> Self {
        Self {
            serial,
            key,
            size: payload.len(),
            owner,
            lock_count: AtomicI32::new(0),
            flags: AtomicU8::new(0),
            data: RwLock::new(payload),
        }
    }

    /// 注册表句柄
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// 块坐标
    pub fn key(&self) -> BlockKey {
        self.key
    }

    /// 像素缓冲区字节数
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    /// 所属波段（已销毁时返回 `None`）
    pub fn owner(&self) -> Option<Arc<dyn BlockOwner>> {
        self.owner.upgrade()
    }

    /// 当前状态标志
    pub fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub(crate) fn set_flags(&self, flags: BlockFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// 当前持有者数量，锁定待移除时为 -1
    pub fn lock_count(&self) -> i32 {
        self.lock_count.load(Ordering::SeqCst)
    }

    //=========================================================================
    // 脏标志
    //=========================================================================

    /// 标记为脏
    ///
    /// 外部只能经由后端的 `mark_dirty` 修改，以保持脏块计数一致
    ///
    /// # 返回
    ///
    /// 之前是否为干净块
    pub(crate) fn mark_dirty(&self) -> bool {
        let prev = self.flags.fetch_or(BlockFlags::DIRTY.bits(), Ordering::SeqCst);
        prev & BlockFlags::DIRTY.bits() == 0
    }

    /// 是否为脏块
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(BlockFlags::DIRTY)
    }

    /// 清除脏标志，返回之前是否为脏
    pub(crate) fn clear_dirty(&self) -> bool {
        let prev = self.flags.fetch_and(!BlockFlags::DIRTY.bits(), Ordering::SeqCst);
        prev & BlockFlags::DIRTY.bits() != 0
    }

    /// 是否已拆除
    pub fn is_torn_down(&self) -> bool {
        self.flags().contains(BlockFlags::TORN_DOWN)
    }

    //=========================================================================
    // 引用状态
    //=========================================================================

    /// 锁定使用
    ///
    /// 块已锁定待移除时返回 `false`
    pub fn acquire_lock(&self) -> bool {
        let mut current = self.lock_count.load(Ordering::SeqCst);
        loop {
            if current < 0 {
                return false;
            }
            match self.lock_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 释放一次锁定使用
    ///
    /// # 返回
    ///
    /// 剩余持有者数量
    ///
    /// # 错误
    ///
    /// 块未被锁定使用时返回 `InvalidState`
    pub fn release_lock(&self) -> Result<i32> {
        let mut current = self.lock_count.load(Ordering::SeqCst);
        loop {
            if current <= 0 {
                log::error!(
                    "[BANDCACHE] Unreferencing block ({}, {}) that is not held (lock count {})",
                    self.key.x,
                    self.key.y,
                    current
                );
                return Err(Error::new(ErrorKind::InvalidState, "Block is not locked for use"));
            }
            match self.lock_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(current - 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// 尝试锁定待移除（0 → -1）
    pub fn take_for_removal(&self) -> RemovalLock {
        match self
            .lock_count
            .compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => RemovalLock::Taken,
            Err(-1) => RemovalLock::AlreadyRemoving,
            Err(_) => RemovalLock::InUse,
        }
    }

    //=========================================================================
    // 数据
    //=========================================================================

    /// 只读访问像素缓冲区
    pub fn with_data<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let data = self.data.read();
        f(&data)
    }

    /// 可写访问像素缓冲区（不标记脏）
    pub(crate) fn with_data_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut data = self.data.write();
        f(&mut data)
    }

    /// 由所属波段填充像素缓冲区
    pub fn fill(&self) -> Result<()> {
        let owner = self
            .owner()
            .ok_or(Error::new(ErrorKind::InvalidState, "Owning band is gone"))?;
        let mut data = self.data.write();
        owner.read_block(self.key, &mut data)
    }

    /// 写回脏数据
    ///
    /// 干净块不做任何 I/O。脏标志在写之前清除，写失败时数据视为丢失，
    /// 错误返回给调用者。
    pub fn write_back(&self) -> Result<()> {
        if !self.clear_dirty() {
            return Ok(());
        }
        let owner = self
            .owner()
            .ok_or(Error::new(ErrorKind::InvalidState, "Owning band is gone"))?;
        log::debug!("[BANDCACHE] write back block ({}, {})", self.key.x, self.key.y);
        let data = self.data.read();
        owner.write_block(self.key, &data)
    }

    /// 交出像素缓冲区，块之后不再持有数据
    pub(crate) fn take_payload(&self) -> Vec<u8> {
        core::mem::take(&mut *self.data.write())
    }
}

impl core::fmt::Debug for RasterBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RasterBlock")
            .field("serial", &self.serial)
            .field("key", &self.key)
            .field("size", &self.size)
            .field("lock_count", &self.lock_count())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingOwner {
        writes: Mutex<Vec<BlockKey>>,
    }

    impl BlockOwner for RecordingOwner {
        fn read_block(&self, key: BlockKey, buf: &mut [u8]) -> Result<()> {
            buf.fill(key.x as u8 + 1);
            Ok(())
        }

        fn write_block(&self, key: BlockKey, _buf: &[u8]) -> Result<()> {
            self.writes.lock().push(key);
            Ok(())
        }

        fn evict(&self, block: &Arc<RasterBlock>) -> Vec<u8> {
            block.take_payload()
        }
    }

    fn owned_block(owner: &Arc<RecordingOwner>, key: BlockKey) -> RasterBlock {
        let weak: Weak<dyn BlockOwner> = Arc::downgrade(owner) as Weak<RecordingOwner>;
        RasterBlock::new(1, key, vec![0u8; 16], weak)
    }

    #[test]
    fn test_lock_states() {
        let block = RasterBlock::new(1, BlockKey::new(0, 0), vec![0u8; 4], Weak::<RecordingOwner>::new());

        assert!(block.acquire_lock());
        assert!(block.acquire_lock());
        assert_eq!(block.take_for_removal(), RemovalLock::InUse);
        assert_eq!(block.release_lock().unwrap(), 1);
        assert_eq!(block.release_lock().unwrap(), 0);

        assert_eq!(block.take_for_removal(), RemovalLock::Taken);
        assert_eq!(block.take_for_removal(), RemovalLock::AlreadyRemoving);
        assert!(!block.acquire_lock());
        assert_eq!(block.lock_count(), -1);
    }

    #[test]
    fn test_release_unheld_block() {
        let block = RasterBlock::new(1, BlockKey::new(0, 0), vec![0u8; 4], Weak::<RecordingOwner>::new());
        let err = block.release_lock().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(block.lock_count(), 0);
    }

    #[test]
    fn test_write_back_idempotent() {
        let owner = Arc::new(RecordingOwner {
            writes: Mutex::new(Vec::new()),
        });
        let block = owned_block(&owner, BlockKey::new(3, 1));

        block.write_back().unwrap();
        assert!(owner.writes.lock().is_empty());

        assert!(block.mark_dirty());
        assert!(!block.mark_dirty());
        block.write_back().unwrap();
        block.write_back().unwrap();
        assert_eq!(*owner.writes.lock(), vec![BlockKey::new(3, 1)]);
        assert!(!block.is_dirty());
    }

    #[test]
    fn test_fill_from_owner() {
        let owner = Arc::new(RecordingOwner {
            writes: Mutex::new(Vec::new()),
        });
        let block = owned_block(&owner, BlockKey::new(4, 0));
        block.fill().unwrap();
        block.with_data(|data| assert!(data.iter().all(|&b| b == 5)));

        let orphan = RasterBlock::new(2, BlockKey::new(0, 0), vec![0u8; 4], Weak::<RecordingOwner>::new());
        assert_eq!(orphan.fill().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_take_payload() {
        let block = RasterBlock::new(1, BlockKey::new(0, 0), vec![9u8; 8], Weak::<RecordingOwner>::new());
        let payload = block.take_payload();
        assert_eq!(payload, vec![9u8; 8]);
        assert_eq!(block.size_bytes(), 8);
        block.with_data(|data| assert!(data.is_empty()));
    }
}
