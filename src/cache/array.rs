//! 稠密数组后端

use super::backend::{retire_all, BandBlockCache, ProgressFn};
use super::core::{CacheCore, FlushProgress};
use crate::block::RasterBlock;
use crate::config::BlockCacheStrategy;
use crate::error::{Error, ErrorKind, Result};
use crate::types::BlockKey;
use parking_lot::Mutex;
use std::sync::Arc;

/// 槽位数组后端
///
/// 预分配 `blocks_per_row * blocks_per_column` 个槽位，所有操作 O(1)。
/// 一把互斥锁串行化槽位修改，不在持锁时做 I/O。
pub struct ArrayBandBlockCache {
    core: CacheCore,
    slots: Mutex<Vec<Option<Arc<RasterBlock>>>>,
}

impl ArrayBandBlockCache {
    /// 创建（需要调用 `init` 后才能使用）
    pub fn new(core: CacheCore) -> Self {
        Self {
            core,
            slots: Mutex::new(Vec::new()),
        }
    }

    fn slot_index(&self, key: BlockKey) -> usize {
        key.x as usize + key.y as usize * self.core.geometry().blocks_per_row as usize
    }

    /// 摘除一个槽位中的块（持锁登记为悬挂）
    fn take_slot(&self, index: usize) -> Option<Arc<RasterBlock>> {
        let mut slots = self.slots.lock();
        let block = slots.get_mut(index)?.take()?;
        self.core.begin_removal(&block);
        Some(block)
    }
}

impl BandBlockCache for ArrayBandBlockCache {
    fn init(&mut self) -> Result<()> {
        let count = usize::try_from(self.core.geometry().block_count())
            .map_err(|_| Error::new(ErrorKind::NoMemory, "Block grid too large for array cache"))?;

        let mut slots = Vec::new();
        slots.try_reserve_exact(count).map_err(|e| {
            Error::with_cause(ErrorKind::NoMemory, "Out of memory in array block cache", e)
        })?;
        slots.resize(count, None);
        *self.slots.get_mut() = slots;
        Ok(())
    }

    fn core(&self) -> &CacheCore {
        &self.core
    }

    fn strategy(&self) -> BlockCacheStrategy {
        BlockCacheStrategy::Array
    }

    fn adopt(&self, block: Arc<RasterBlock>) -> Result<()> {
        let key = block.key();
        self.core.geometry().check_key(key)?;
        let index = self.slot_index(key);

        let mut slots = self.slots.lock();
        if let Some(existing) = slots[index].take() {
            if existing.lock_count() >= 0 {
                slots[index] = Some(existing);
            } else {
                // 被驱逐中的旧块可能还没写回，新块的内容已经过期
                self.core.begin_removal(&existing);
            }
            log::debug!("[BANDCACHE] block ({}, {}) already resident", key.x, key.y);
            return Err(Error::new(ErrorKind::AlreadyExists, "Block already resident"));
        }
        self.core.registry().register_new(&block);
        slots[index] = Some(block);
        Ok(())
    }

    fn try_get_locked(&self, key: BlockKey) -> Result<Option<Arc<RasterBlock>>> {
        self.core.geometry().check_key(key)?;
        let index = self.slot_index(key);

        let block = {
            let mut slots = self.slots.lock();
            let Some(block) = slots[index].clone() else {
                return Ok(None);
            };
            if !block.acquire_lock() {
                // 注册表已选中它驱逐，先摘除以便未命中等待写回
                slots[index] = None;
                self.core.begin_removal(&block);
                return Ok(None);
            }
            block
        };

        self.core.registry().touch(&block);
        log::trace!("[BANDCACHE] hit block ({}, {})", key.x, key.y);
        Ok(Some(block))
    }

    fn flush_block(&self, key: BlockKey, write_dirty: bool) -> Result<()> {
        self.core.geometry().check_key(key)?;
        match self.take_slot(self.slot_index(key)) {
            Some(block) => self.core.retire(&block, write_dirty),
            None => Ok(()),
        }
    }

    fn flush_cache(&self, progress: Option<ProgressFn<'_>>) -> Result<()> {
        let count = self.slots.lock().len();
        let mut progress = FlushProgress::new(self.core.dirty_block_count(), progress);
        retire_all(
            &self.core,
            (0..count).filter_map(|index| self.take_slot(index)),
            &mut progress,
        )
    }

    fn detach_evicted(&self, block: &Arc<RasterBlock>) {
        let index = self.slot_index(block.key());
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(index) {
            if slot.as_ref().is_some_and(|b| Arc::ptr_eq(b, block)) {
                *slot = None;
                self.core.begin_removal(block);
            }
        }
    }

    fn resident_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }
}
