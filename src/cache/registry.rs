//! 全局块注册表
//!
//! 所有波段的常驻块共享一个 LRU 顺序和一个字节预算。注册表是唯一的
//! 驱逐触发点：分配新块前调用 [`BlockRegistry::make_room`]，超出预算时
//! 从最久未访问的一端开始驱逐。
//!
//! # 锁
//!
//! 一把 `parking_lot::Mutex` 保护 LRU 链表和计数器，临界区都是 O(1)
//! （驱逐选块时线性跳过被锁定的块）。驱逐回调到波段之前先释放这把锁，
//! 所以持有注册表锁时绝不会去拿波段索引锁。

use crate::block::{RasterBlock, RemovalLock};
use crate::config::{BlockCacheStrategy, CacheConfig};
use crate::error::{Error, ErrorKind, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// 缓存统计信息
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// 总访问次数
    pub total_accesses: u64,
    /// 缓存命中次数
    pub hits: u64,
    /// 缓存未命中次数
    pub misses: u64,
    /// 驱逐次数
    pub evictions: u64,
    /// 脏块写回次数
    pub writebacks: u64,
}

impl CacheStats {
    /// 计算命中率
    pub fn hit_rate(&self) -> f64 {
        if self.total_accesses == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_accesses as f64
        }
    }
}

struct RegistryState {
    /// serial -> 块，按访问顺序排列
    lru: LruCache<u64, Arc<RasterBlock>>,
    bytes_in_use: usize,
    budget: usize,
    stats: CacheStats,
}

impl RegistryState {
    fn remove(&mut self, serial: u64) -> Option<Arc<RasterBlock>> {
        let block = self.lru.pop(&serial)?;
        self.bytes_in_use = match self.bytes_in_use.checked_sub(block.size_bytes()) {
            Some(bytes) => bytes,
            None => panic!(
                "block cache accounting underflow: {} bytes in use, removing {}",
                self.bytes_in_use,
                block.size_bytes()
            ),
        };
        Some(block)
    }
}

/// 驱逐时选块的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Victim {
    Any,
    DirtyOnly,
}

/// 全局块注册表
///
/// 显式构造，以 `Arc` 共享给所有波段。
///
/// # 示例
///
/// ```rust,ignore
/// let registry = Arc::new(BlockRegistry::new(64 * 1024 * 1024));
/// let band = RasterBand::new(source, &registry, BlockCacheStrategy::Auto)?;
/// println!("{} / {}", registry.bytes_in_use(), registry.budget());
/// ```
pub struct BlockRegistry {
    state: Mutex<RegistryState>,
    next_serial: AtomicU64,
    /// > 0 时禁止写回脏块
    dirty_flush_disabled: AtomicUsize,
    /// 未显式指定策略的波段使用的后端
    default_strategy: BlockCacheStrategy,
}

impl BlockRegistry {
    /// 以给定字节预算创建注册表
    pub fn new(budget: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
                budget,
                stats: CacheStats::default(),
            }),
            next_serial: AtomicU64::new(1),
            dirty_flush_disabled: AtomicUsize::new(0),
            default_strategy: BlockCacheStrategy::Auto,
        }
    }

    /// 按配置创建注册表
    ///
    /// 预算取 `cache_max`，`strategy` 作为新建波段的默认后端
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            default_strategy: config.strategy,
            ..Self::new(config.cache_max)
        }
    }

    /// 新建波段的默认后端策略
    pub fn default_strategy(&self) -> BlockCacheStrategy {
        self.default_strategy
    }

    /// 分配新块句柄
    pub(crate) fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    //=========================================================================
    // 查询
    //=========================================================================

    /// 字节预算
    pub fn budget(&self) -> usize {
        self.state.lock().budget
    }

    /// 常驻块占用的字节数
    pub fn bytes_in_use(&self) -> usize {
        self.state.lock().bytes_in_use
    }

    /// 常驻块数量
    pub fn resident_count(&self) -> usize {
        self.state.lock().lru.len()
    }

    /// 块是否在 LRU 链表中
    pub fn contains(&self, block: &RasterBlock) -> bool {
        self.state.lock().lru.contains(&block.serial())
    }

    /// 统计信息快照
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats.clone()
    }

    //=========================================================================
    // LRU 维护
    //=========================================================================

    /// 插入新块到最近端，并计入预算
    pub fn register_new(&self, block: &Arc<RasterBlock>) {
        let mut state = self.state.lock();
        if state.lru.put(block.serial(), block.clone()).is_none() {
            state.bytes_in_use += block.size_bytes();
        }
        log::trace!(
            "[BCACHE] register block ({}, {}) serial={}, {} bytes in use",
            block.key().x,
            block.key().y,
            block.serial(),
            state.bytes_in_use
        );
    }

    /// 把块移到最近端（命中时调用）
    pub fn touch(&self, block: &RasterBlock) {
        let mut state = self.state.lock();
        state.lru.promote(&block.serial());
        state.stats.total_accesses += 1;
        state.stats.hits += 1;
    }

    /// 记录一次未命中
    pub fn record_miss(&self) {
        let mut state = self.state.lock();
        state.stats.total_accesses += 1;
        state.stats.misses += 1;
    }

    pub(crate) fn record_writeback(&self) {
        self.state.lock().stats.writebacks += 1;
    }

    /// 从 LRU 链表摘除块并扣除字节数
    ///
    /// 块不在链表中时返回 `false`
    pub fn detach(&self, block: &RasterBlock) -> bool {
        self.state.lock().remove(block.serial()).is_some()
    }

    //=========================================================================
    // 驱逐
    //=========================================================================

    /// 选中并锁定一个驱逐对象，从链表摘除后释放锁
    fn take_victim(&self, victim: Victim) -> Option<Arc<RasterBlock>> {
        let skip_dirty = self.dirty_flush_disabled();
        let mut state = self.state.lock();

        let mut chosen = None;
        for (serial, block) in state.lru.iter().rev() {
            let dirty = block.is_dirty();
            if (skip_dirty && dirty) || (victim == Victim::DirtyOnly && !dirty) {
                continue;
            }
            if block.take_for_removal() == RemovalLock::Taken {
                chosen = Some(*serial);
                break;
            }
        }

        let block = state.remove(chosen?)?;
        state.stats.evictions += 1;
        Some(block)
    }

    /// 驱逐一个块
    ///
    /// 缓冲区大小等于 `keep_size` 时交给调用者，否则回收到所属波段。
    /// 没有可驱逐的块时返回 `None`。调用时不持有注册表锁
    fn evict_victim(&self, victim: Victim, keep_size: Option<usize>) -> Option<Option<Vec<u8>>> {
        let block = self.take_victim(victim)?;
        log::debug!(
            "[BCACHE] evict block ({}, {}) serial={} dirty={}",
            block.key().x,
            block.key().y,
            block.serial(),
            block.is_dirty()
        );

        let Some(owner) = block.owner() else {
            log::warn!("[BCACHE] evicted block ({}, {}) has no owner", block.key().x, block.key().y);
            let payload = block.take_payload();
            return Some((keep_size == Some(payload.len())).then_some(payload));
        };

        let payload = owner.evict(&block);
        if keep_size == Some(payload.len()) {
            return Some(Some(payload));
        }
        owner.recycle_payload(payload);
        Some(None)
    }

    /// 驱逐最久未访问的一个未锁定块
    ///
    /// 没有可驱逐的块时返回 `false`
    pub fn evict_one(&self) -> bool {
        self.evict_victim(Victim::Any, None).is_some()
    }

    /// 为即将分配的 `bytes` 字节腾出空间
    ///
    /// # 返回
    ///
    /// 驱逐过程中得到的、大小恰好等于 `bytes` 的可复用缓冲区
    ///
    /// # 错误
    ///
    /// 超出预算但所有常驻块都被锁定时返回 `ResourceExhausted`
    pub fn make_room(&self, bytes: usize) -> Result<Option<Vec<u8>>> {
        let mut recycled = None;
        loop {
            {
                let state = self.state.lock();
                if state.bytes_in_use.saturating_add(bytes) <= state.budget {
                    break;
                }
                if state.lru.is_empty() {
                    log::warn!(
                        "[BCACHE] block of {} bytes exceeds budget {}, caching it anyway",
                        bytes,
                        state.budget
                    );
                    break;
                }
            }

            let keep_size = if recycled.is_none() { Some(bytes) } else { None };
            match self.evict_victim(Victim::Any, keep_size) {
                Some(payload) => {
                    if payload.is_some() {
                        recycled = payload;
                    }
                }
                None => {
                    log::warn!(
                        "[BCACHE] cannot make room for {} bytes: every resident block is pinned",
                        bytes
                    );
                    return Err(Error::new(
                        ErrorKind::ResourceExhausted,
                        "Every resident block is pinned, cannot satisfy the cache budget",
                    ));
                }
            }
        }
        Ok(recycled)
    }

    /// 设置字节预算，超出时同步驱逐
    ///
    /// # 错误
    ///
    /// 无法驱逐到预算以内时返回 `ResourceExhausted`，预算仍然更新
    pub fn set_budget(&self, budget: usize) -> Result<()> {
        self.state.lock().budget = budget;
        log::debug!("[BCACHE] budget set to {} bytes", budget);

        loop {
            {
                let state = self.state.lock();
                if state.bytes_in_use <= state.budget {
                    return Ok(());
                }
            }
            if self.evict_victim(Victim::Any, None).is_none() {
                let state = self.state.lock();
                log::warn!(
                    "[BCACHE] budget {} not reachable: {} bytes pinned in {} blocks",
                    state.budget,
                    state.bytes_in_use,
                    state.lru.len()
                );
                return Err(Error::new(
                    ErrorKind::ResourceExhausted,
                    "Every resident block is pinned, cannot satisfy the cache budget",
                ));
            }
        }
    }

    /// 驱逐一个块
    ///
    /// `dirty_only` 为真时只考虑脏块
    pub fn flush_cache_block(&self, dirty_only: bool) -> bool {
        let victim = if dirty_only { Victim::DirtyOnly } else { Victim::Any };
        self.evict_victim(victim, None).is_some()
    }

    /// 写回并驱逐所有未锁定的脏块
    pub fn flush_dirty_blocks(&self) {
        let mut flushed = 0usize;
        while self.flush_cache_block(true) {
            flushed += 1;
        }
        log::debug!("[BCACHE] flushed {} dirty blocks", flushed);
    }

    //=========================================================================
    // 禁止写回
    //=========================================================================

    /// 禁止写回脏块，直到返回的守卫被丢弃
    ///
    /// 期间驱逐会跳过脏块，波段 `flush_cache` 直接丢弃块而不写回
    pub fn disable_dirty_flush(&self) -> DirtyFlushGuard<'_> {
        self.dirty_flush_disabled.fetch_add(1, Ordering::SeqCst);
        DirtyFlushGuard { registry: self }
    }

    /// 当前是否禁止写回
    pub fn dirty_flush_disabled(&self) -> bool {
        self.dirty_flush_disabled.load(Ordering::SeqCst) > 0
    }
}

/// 禁止写回守卫
pub struct DirtyFlushGuard<'a> {
    registry: &'a BlockRegistry,
}

impl Drop for DirtyFlushGuard<'_> {
    fn drop(&mut self) {
        self.registry.dirty_flush_disabled.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockOwner;
    use crate::types::BlockKey;
    use std::sync::Weak;

    /// 驱逐时只交出缓冲区，记录回收次数
    #[derive(Default)]
    struct DropOwner {
        recycled: AtomicUsize,
    }

    impl BlockOwner for DropOwner {
        fn read_block(&self, _key: BlockKey, _buf: &mut [u8]) -> crate::error::Result<()> {
            Ok(())
        }

        fn write_block(&self, _key: BlockKey, _buf: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }

        fn evict(&self, block: &Arc<RasterBlock>) -> Vec<u8> {
            block.take_payload()
        }

        fn recycle_payload(&self, _payload: Vec<u8>) {
            self.recycled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn new_block(registry: &BlockRegistry, owner: &Arc<DropOwner>, x: u32) -> Arc<RasterBlock> {
        let weak: Weak<dyn BlockOwner> = Arc::downgrade(owner) as Weak<DropOwner>;
        Arc::new(RasterBlock::new(
            registry.next_serial(),
            BlockKey::new(x, 0),
            vec![0u8; 100],
            weak,
        ))
    }

    #[test]
    fn test_register_and_detach() {
        let registry = BlockRegistry::new(1000);
        let owner = Arc::new(DropOwner::default());
        let a = new_block(&registry, &owner, 0);
        let b = new_block(&registry, &owner, 1);

        registry.register_new(&a);
        registry.register_new(&b);
        registry.register_new(&b);
        assert_eq!(registry.bytes_in_use(), 200);
        assert_eq!(registry.resident_count(), 2);

        assert!(registry.detach(&a));
        assert!(!registry.detach(&a));
        assert_eq!(registry.bytes_in_use(), 100);
        assert!(!registry.contains(&a));
        assert!(registry.contains(&b));
    }

    #[test]
    fn test_evict_least_recent_unpinned() {
        let registry = BlockRegistry::new(1000);
        let owner = Arc::new(DropOwner::default());
        let blocks: Vec<_> = (0..3).map(|x| new_block(&registry, &owner, x)).collect();
        for block in &blocks {
            registry.register_new(block);
        }

        // 0 最旧但被锁定，1 次之
        assert!(blocks[0].acquire_lock());
        assert!(registry.evict_one());
        assert!(registry.contains(&blocks[0]));
        assert!(!registry.contains(&blocks[1]));
        assert_eq!(blocks[1].lock_count(), -1);

        registry.touch(&blocks[2]);
        assert!(blocks[2].acquire_lock());
        assert!(!registry.evict_one());
        assert_eq!(registry.stats().evictions, 1);
        assert_eq!(registry.stats().hits, 1);

        blocks[0].release_lock().unwrap();
        assert!(registry.evict_one());
        assert!(!registry.contains(&blocks[0]));
        assert_eq!(registry.bytes_in_use(), 100);
    }

    #[test]
    fn test_set_budget_all_pinned() {
        let registry = BlockRegistry::new(1000);
        let owner = Arc::new(DropOwner::default());
        let a = new_block(&registry, &owner, 0);
        let b = new_block(&registry, &owner, 1);
        registry.register_new(&a);
        registry.register_new(&b);
        assert!(a.acquire_lock());
        assert!(b.acquire_lock());

        let err = registry.set_budget(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(registry.budget(), 0);
        assert_eq!(registry.bytes_in_use(), 200);

        a.release_lock().unwrap();
        b.release_lock().unwrap();
        registry.set_budget(0).unwrap();
        assert_eq!(registry.bytes_in_use(), 0);
    }

    #[test]
    fn test_make_room_recycles_payload() {
        let registry = BlockRegistry::new(200);
        let owner = Arc::new(DropOwner::default());
        let a = new_block(&registry, &owner, 0);
        let b = new_block(&registry, &owner, 1);
        registry.register_new(&a);
        registry.register_new(&b);

        let recycled = registry.make_room(100).unwrap();
        assert_eq!(recycled.map(|p| p.len()), Some(100));
        assert!(!registry.contains(&a));
        assert_eq!(registry.bytes_in_use(), 100);

        // 空链表时允许超出预算
        let empty = BlockRegistry::new(10);
        assert!(empty.make_room(100).unwrap().is_none());
    }

    #[test]
    fn test_unkept_payloads_recycled_to_owner() {
        let registry = BlockRegistry::new(100);
        let owner = Arc::new(DropOwner::default());
        for x in 0..3 {
            registry.register_new(&new_block(&registry, &owner, x));
        }

        // 驱逐三个块，只保留第一个缓冲区
        let kept = registry.make_room(100).unwrap();
        assert_eq!(kept.map(|p| p.len()), Some(100));
        assert_eq!(owner.recycled.load(Ordering::SeqCst), 2);
        assert_eq!(registry.bytes_in_use(), 0);

        // 大小不符的缓冲区不交给调用者
        registry.register_new(&new_block(&registry, &owner, 3));
        assert!(registry.make_room(50).unwrap().is_none());
        assert_eq!(owner.recycled.load(Ordering::SeqCst), 3);

        registry.register_new(&new_block(&registry, &owner, 4));
        assert!(registry.evict_one());
        assert_eq!(owner.recycled.load(Ordering::SeqCst), 4);
        assert_eq!(registry.resident_count(), 0);
    }

    #[test]
    fn test_disable_dirty_flush_skips_dirty() {
        let registry = BlockRegistry::new(1000);
        let owner = Arc::new(DropOwner::default());
        let a = new_block(&registry, &owner, 0);
        registry.register_new(&a);
        a.mark_dirty();

        {
            let _guard = registry.disable_dirty_flush();
            assert!(registry.dirty_flush_disabled());
            assert!(!registry.evict_one());
        }
        assert!(!registry.dirty_flush_disabled());
        assert!(registry.flush_cache_block(true));
        assert_eq!(registry.resident_count(), 0);
    }
}
