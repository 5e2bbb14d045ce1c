//! 后端共享的块生命周期协议
//!
//! 块从波段索引摘除后、拆除完成前处于"悬挂"状态。悬挂列表记录这些块：
//!
//! - `InFlight`：某个线程正在（或即将）写回并拆除它
//! - `AwaitingRelease`：仍有持有者，由最后一个持有者的 `unreference` 完成拆除
//!
//! 每次从索引摘除块都必须在持有索引锁时调用 [`CacheCore::begin_removal`]，
//! 这样同一坐标的未命中可以通过 [`CacheCore::wait_for_in_flight`]
//! 等待旧块写回完成，不会从后备存储读到过期数据。
//!
//! 加锁顺序：索引锁 → 悬挂列表锁。

use super::registry::BlockRegistry;
use crate::block::{BlockFlags, BlockOwner, RasterBlock, RemovalLock};
use crate::consts::MAX_RECYCLED_PAYLOADS;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockGeometry, BlockKey};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    InFlight,
    AwaitingRelease,
}

struct Dangling {
    block: Arc<RasterBlock>,
    stage: Stage,
}

/// 单个波段后端共享的状态：悬挂列表、空闲缓冲区、脏块计数
pub struct CacheCore {
    registry: Arc<BlockRegistry>,
    geometry: BlockGeometry,
    dangling: Mutex<Vec<Dangling>>,
    dangling_cond: Condvar,
    /// 悬挂块数量
    keep_alive: AtomicUsize,
    free_payloads: Mutex<Vec<Vec<u8>>>,
    dirty_count: AtomicUsize,
}

impl CacheCore {
    /// 创建
    pub(crate) fn new(registry: Arc<BlockRegistry>, geometry: BlockGeometry) -> Self {
        Self {
            registry,
            geometry,
            dangling: Mutex::new(Vec::new()),
            dangling_cond: Condvar::new(),
            keep_alive: AtomicUsize::new(0),
            free_payloads: Mutex::new(Vec::new()),
            dirty_count: AtomicUsize::new(0),
        }
    }

    /// 全局注册表
    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    /// 块几何
    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    /// 尚未拆除完成的悬挂块数量
    pub fn keep_alive(&self) -> usize {
        self.keep_alive.load(Ordering::SeqCst)
    }

    /// 悬挂列表长度
    pub fn dangling_count(&self) -> usize {
        self.dangling.lock().len()
    }

    /// 空闲列表中等待复用的缓冲区数量
    pub fn free_payload_count(&self) -> usize {
        self.free_payloads.lock().len()
    }

    /// 当前脏块数量
    pub fn dirty_block_count(&self) -> usize {
        self.dirty_count.load(Ordering::SeqCst)
    }

    pub(crate) fn note_dirtied(&self) {
        self.dirty_count.fetch_add(1, Ordering::SeqCst);
    }

    //=========================================================================
    // 分配与回收
    //=========================================================================

    /// 创建新块，优先复用缓冲区
    ///
    /// # 错误
    ///
    /// 缓冲区分配失败时返回 `NoMemory`
    pub(crate) fn create_block(
        &self,
        key: BlockKey,
        owner: Weak<dyn BlockOwner>,
        recycled: Option<Vec<u8>>,
    ) -> Result<Arc<RasterBlock>> {
        let bytes = self.geometry.block_bytes();
        let payload = match recycled.or_else(|| self.take_free_payload()) {
            Some(payload) => payload,
            None => {
                let mut payload = Vec::new();
                payload.try_reserve_exact(bytes).map_err(|e| {
                    Error::with_cause(ErrorKind::NoMemory, "Out of memory allocating block", e)
                })?;
                payload.resize(bytes, 0);
                payload
            }
        };
        Ok(Arc::new(RasterBlock::new(
            self.registry.next_serial(),
            key,
            payload,
            owner,
        )))
    }

    fn take_free_payload(&self) -> Option<Vec<u8>> {
        let payload = self.free_payloads.lock().pop()?;
        log::trace!("[BANDCACHE] reusing freed payload of {} bytes", payload.len());
        Some(payload)
    }

    /// 把缓冲区放回空闲列表（大小不符或列表已满时直接释放）
    pub(crate) fn recycle(&self, payload: Vec<u8>) {
        if payload.len() != self.geometry.block_bytes() {
            return;
        }
        let mut free = self.free_payloads.lock();
        if free.len() < MAX_RECYCLED_PAYLOADS {
            free.push(payload);
        }
    }

    //=========================================================================
    // 悬挂块协议
    //=========================================================================

    /// 登记一个刚从索引摘除的块
    ///
    /// 必须在持有索引锁时调用
    pub(crate) fn begin_removal(&self, block: &Arc<RasterBlock>) {
        let mut dangling = self.dangling.lock();
        dangling.push(Dangling {
            block: block.clone(),
            stage: Stage::InFlight,
        });
        self.keep_alive.fetch_add(1, Ordering::SeqCst);
    }

    fn set_stage(&self, block: &Arc<RasterBlock>, stage: Stage) {
        let mut dangling = self.dangling.lock();
        if let Some(entry) = dangling.iter_mut().find(|e| Arc::ptr_eq(&e.block, block)) {
            entry.stage = stage;
        }
        drop(dangling);
        self.dangling_cond.notify_all();
    }

    /// 移除一个已从索引摘除的块
    ///
    /// 没有持有者时立即写回并拆除；仍有持有者时标记待移除并返回，
    /// 由最后一个持有者完成；已被其他线程锁定待移除时等待其完成。
    pub(crate) fn retire(&self, block: &Arc<RasterBlock>, write_dirty: bool) -> Result<()> {
        self.registry.detach(block);

        match block.take_for_removal() {
            RemovalLock::Taken => self.finish(block, write_dirty),
            RemovalLock::InUse => {
                let mut flags = BlockFlags::REMOVAL_PENDING;
                if write_dirty {
                    flags |= BlockFlags::WRITE_ON_REMOVAL;
                }
                block.set_flags(flags);
                self.set_stage(block, Stage::AwaitingRelease);
                log::debug!(
                    "[BANDCACHE] block ({}, {}) still referenced, deferring removal",
                    block.key().x,
                    block.key().y
                );

                // 持有者可能在标志设置之前已经释放
                if block.take_for_removal() == RemovalLock::Taken {
                    self.finish(block, write_dirty)
                } else {
                    Ok(())
                }
            }
            RemovalLock::AlreadyRemoving => {
                self.wait_torn_down(block);
                Ok(())
            }
        }
    }

    fn finish(&self, block: &Arc<RasterBlock>, write_dirty: bool) -> Result<()> {
        let (result, payload) = self.tear_down(block, write_dirty);
        self.recycle(payload);
        result
    }

    /// 写回并拆除一个已锁定待移除的块
    ///
    /// 返回写回结果和块的缓冲区
    pub(crate) fn tear_down(&self, block: &Arc<RasterBlock>, write_dirty: bool) -> (Result<()>, Vec<u8>) {
        self.set_stage(block, Stage::InFlight);

        let was_dirty = block.is_dirty();
        let result = if write_dirty && was_dirty {
            self.registry.record_writeback();
            block.write_back()
        } else {
            block.clear_dirty();
            Ok(())
        };
        if was_dirty {
            let updated = self
                .dirty_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if updated.is_err() {
                log::error!(
                    "[BANDCACHE] dirty block counter underflow at block ({}, {})",
                    block.key().x,
                    block.key().y
                );
                debug_assert!(false, "dirty block counter underflow");
            }
        }
        if let Err(e) = &result {
            log::error!(
                "[BANDCACHE] write back of block ({}, {}) failed: {}",
                block.key().x,
                block.key().y,
                e
            );
        }

        let payload = block.take_payload();

        let mut dangling = self.dangling.lock();
        if let Some(pos) = dangling.iter().position(|e| Arc::ptr_eq(&e.block, block)) {
            dangling.swap_remove(pos);
            self.keep_alive.fetch_sub(1, Ordering::SeqCst);
        }
        block.set_flags(BlockFlags::TORN_DOWN);
        drop(dangling);
        self.dangling_cond.notify_all();

        (result, payload)
    }

    fn wait_torn_down(&self, block: &RasterBlock) {
        let mut dangling = self.dangling.lock();
        while !block.is_torn_down() {
            self.dangling_cond.wait(&mut dangling);
        }
    }

    /// 释放一次锁定使用
    ///
    /// 块已待移除且这是最后一个持有者时，在这里完成写回和拆除
    ///
    /// # 错误
    ///
    /// - 块未被锁定使用时返回 `InvalidState`
    /// - 延迟写回失败时返回写回错误
    pub(crate) fn unreference(&self, block: &Arc<RasterBlock>) -> Result<()> {
        let remaining = block.release_lock()?;
        if remaining == 0 && block.flags().contains(BlockFlags::REMOVAL_PENDING) {
            if block.take_for_removal() == RemovalLock::Taken {
                let write_dirty = block.flags().contains(BlockFlags::WRITE_ON_REMOVAL);
                return self.finish(block, write_dirty);
            }
        }
        Ok(())
    }

    /// 尽力清理已无持有者的悬挂块
    ///
    /// 返回遇到的第一个写回错误
    pub(crate) fn free_dangling_blocks(&self) -> Result<()> {
        if self.keep_alive() == 0 {
            return Ok(());
        }
        let candidates: Vec<Arc<RasterBlock>> = self
            .dangling
            .lock()
            .iter()
            .filter(|e| e.stage == Stage::AwaitingRelease)
            .map(|e| e.block.clone())
            .collect();

        let mut first_error = None;
        for block in candidates {
            if block.take_for_removal() == RemovalLock::Taken {
                let write_dirty = block.flags().contains(BlockFlags::WRITE_ON_REMOVAL);
                if let Err(e) = self.finish(&block, write_dirty) {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// 等待同一坐标上正在写回的旧块完成
    pub(crate) fn wait_for_in_flight(&self, key: BlockKey) {
        let mut dangling = self.dangling.lock();
        while dangling
            .iter()
            .any(|e| e.stage == Stage::InFlight && e.block.key() == key)
        {
            self.dangling_cond.wait(&mut dangling);
        }
    }

    /// 等待所有悬挂块拆除完成
    pub fn wait_for_pending_work(&self) {
        if let Err(e) = self.free_dangling_blocks() {
            log::error!("[BANDCACHE] freeing dangling blocks failed: {}", e);
        }
        let mut dangling = self.dangling.lock();
        while !dangling.is_empty() {
            self.dangling_cond.wait(&mut dangling);
        }
    }
}

/// 整体刷新时的进度跟踪
///
/// 脏块较多时每完成 10% 输出一次日志；提供回调时每写回一个脏块调用一次。
pub(crate) struct FlushProgress<'p> {
    total: usize,
    done: usize,
    last_step: usize,
    log: bool,
    hook: Option<&'p mut dyn FnMut(f64, &str)>,
}

impl<'p> FlushProgress<'p> {
    pub(crate) fn new(total: usize, hook: Option<&'p mut dyn FnMut(f64, &str)>) -> Self {
        let log = total > crate::consts::DIRTY_FLUSH_LOG_THRESHOLD;
        if log {
            log::debug!("[BANDCACHE] flushing {} dirty blocks", total);
        }
        Self {
            total,
            done: 0,
            last_step: 0,
            log,
            hook,
        }
    }

    pub(crate) fn block_written(&mut self) {
        if self.total == 0 {
            return;
        }
        self.done = (self.done + 1).min(self.total);
        let fraction = self.done as f64 / self.total as f64;

        let step = self.done * 10 / self.total;
        if self.log && step > self.last_step {
            self.last_step = step;
            log::debug!("[BANDCACHE] flushing dirty blocks: {}%", step * 10);
        }
        if let Some(hook) = self.hook.as_deref_mut() {
            hook(fraction, "Flushing dirty blocks");
        }
    }
}
