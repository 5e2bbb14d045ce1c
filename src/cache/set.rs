//! 稀疏有序集合后端

use super::backend::{retire_all, BandBlockCache, ProgressFn};
use super::core::{CacheCore, FlushProgress};
use crate::block::RasterBlock;
use crate::config::BlockCacheStrategy;
use crate::error::{Error, ErrorKind, Result};
use crate::types::BlockKey;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// 有序集合后端
///
/// 以 `(y, x)` 为键，整体刷新按行优先（从上到下、从左到右）写回。
/// 所有操作 O(log n)，只占用实际访问过的块。
pub struct SetBandBlockCache {
    core: CacheCore,
    blocks: Mutex<BTreeMap<(u32, u32), Arc<RasterBlock>>>,
}

impl SetBandBlockCache {
    /// 创建
    pub fn new(core: CacheCore) -> Self {
        Self {
            core,
            blocks: Mutex::new(BTreeMap::new()),
        }
    }
}

impl BandBlockCache for SetBandBlockCache {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn core(&self) -> &CacheCore {
        &self.core
    }

    fn strategy(&self) -> BlockCacheStrategy {
        BlockCacheStrategy::Set
    }

    fn adopt(&self, block: Arc<RasterBlock>) -> Result<()> {
        let key = block.key();
        self.core.geometry().check_key(key)?;

        let mut blocks = self.blocks.lock();
        if let Some(existing) = blocks.get(&key.row_major()).cloned() {
            if existing.lock_count() < 0 {
                // 被驱逐中的旧块可能还没写回，新块的内容已经过期
                blocks.remove(&key.row_major());
                self.core.begin_removal(&existing);
            }
            log::debug!("[BANDCACHE] block ({}, {}) already resident", key.x, key.y);
            return Err(Error::new(ErrorKind::AlreadyExists, "Block already resident"));
        }
        self.core.registry().register_new(&block);
        blocks.insert(key.row_major(), block);
        Ok(())
    }

    fn try_get_locked(&self, key: BlockKey) -> Result<Option<Arc<RasterBlock>>> {
        self.core.geometry().check_key(key)?;

        let block = {
            let mut blocks = self.blocks.lock();
            let Some(block) = blocks.get(&key.row_major()).cloned() else {
                return Ok(None);
            };
            if !block.acquire_lock() {
                blocks.remove(&key.row_major());
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
        let block = {
            let mut blocks = self.blocks.lock();
            let Some(block) = blocks.remove(&key.row_major()) else {
                return Ok(());
            };
            self.core.begin_removal(&block);
            block
        };
        self.core.retire(&block, write_dirty)
    }

    fn flush_cache(&self, progress: Option<ProgressFn<'_>>) -> Result<()> {
        // 整体移出后解锁写回，期间新的访问可以继续
        let snapshot = {
            let mut blocks = self.blocks.lock();
            let snapshot = std::mem::take(&mut *blocks);
            for block in snapshot.values() {
                self.core.begin_removal(block);
            }
            snapshot
        };

        let mut progress = FlushProgress::new(self.core.dirty_block_count(), progress);
        retire_all(&self.core, snapshot.into_values(), &mut progress)
    }

    fn detach_evicted(&self, block: &Arc<RasterBlock>) {
        let key = block.key().row_major();
        let mut blocks = self.blocks.lock();
        if blocks.get(&key).is_some_and(|b| Arc::ptr_eq(b, block)) {
            blocks.remove(&key);
            self.core.begin_removal(block);
        }
    }

    fn resident_count(&self) -> usize {
        self.blocks.lock().len()
    }
}
