//! 波段块缓存后端接口
//!
//! 两种后端实现同一套约定：
//!
//! | 后端                      | 索引                               | 适用               |
//! |---------------------------|------------------------------------|--------------------|
//! | [`ArrayBandBlockCache`]   | `x + y * blocks_per_row` 槽位数组   | 块网格不大         |
//! | [`SetBandBlockCache`]     | 按 `(y, x)` 排序的集合              | 块网格巨大且稀疏   |
//!
//! 悬挂块协议、脏块计数和缓冲区回收由两者共享的 [`CacheCore`] 完成，
//! 后端只负责自己的索引。

use super::array::ArrayBandBlockCache;
use super::core::{CacheCore, FlushProgress};
use super::registry::BlockRegistry;
use super::set::SetBandBlockCache;
use crate::block::RasterBlock;
use crate::config::BlockCacheStrategy;
use crate::error::Result;
use crate::types::{BlockGeometry, BlockKey};
use std::sync::Arc;

/// 刷新进度回调：完成比例和阶段说明
pub type ProgressFn<'p> = &'p mut dyn FnMut(f64, &str);

/// 波段块缓存后端
pub trait BandBlockCache: Send + Sync {
    /// 分配后端内部结构
    ///
    /// # 错误
    ///
    /// 内存不足时返回 `NoMemory`
    fn init(&mut self) -> Result<()>;

    /// 共享的生命周期状态
    fn core(&self) -> &CacheCore;

    /// 后端类型（`Array` 或 `Set`）
    fn strategy(&self) -> BlockCacheStrategy;

    /// 登记一个已填充并已锁定使用的新块，同时注册到全局 LRU
    ///
    /// # 错误
    ///
    /// - 坐标越界时返回 `InvalidInput`
    /// - 该坐标已有常驻块时返回 `AlreadyExists`，调用者应重新定位。
    ///   旧块正在被驱逐时先把它移入悬挂列表，重新定位的未命中会等待它写回
    fn adopt(&self, block: Arc<RasterBlock>) -> Result<()>;

    /// 查找常驻块并锁定使用，命中时更新 LRU
    ///
    /// 未命中（或命中的块正在被移除）时返回 `Ok(None)`
    ///
    /// # 错误
    ///
    /// 坐标越界时返回 `InvalidInput`
    fn try_get_locked(&self, key: BlockKey) -> Result<Option<Arc<RasterBlock>>>;

    /// 从索引移除一个块，`write_dirty` 时写回脏数据
    ///
    /// 块仍被持有时移除延迟到最后一个持有者释放
    fn flush_block(&self, key: BlockKey, write_dirty: bool) -> Result<()>;

    /// 移除所有常驻块
    ///
    /// 未禁止写回时写回所有脏块；遇到错误继续处理其余块，返回第一个错误
    fn flush_cache(&self, progress: Option<ProgressFn<'_>>) -> Result<()>;

    /// 从索引摘除一个已被注册表选中驱逐的块
    ///
    /// 索引中该坐标已是别的块时不做修改
    fn detach_evicted(&self, block: &Arc<RasterBlock>);

    /// 索引中的常驻块数量
    fn resident_count(&self) -> usize;

    /// 释放一次锁定使用
    fn unreference(&self, block: &Arc<RasterBlock>) -> Result<()> {
        self.core().unreference(block)
    }

    /// 标记块为脏并更新脏块计数
    fn mark_dirty(&self, block: &RasterBlock) {
        if block.mark_dirty() {
            self.core().note_dirtied();
        }
    }

    /// 等待所有悬挂块拆除完成
    fn wait_for_pending_work(&self) {
        self.core().wait_for_pending_work();
    }
}

/// 按策略创建并初始化后端
///
/// # 参数
///
/// * `strategy` - 后端策略，`Auto` 按块总数选择
/// * `geometry` - 波段块几何
/// * `registry` - 全局注册表
pub fn create_band_block_cache(
    strategy: BlockCacheStrategy,
    geometry: BlockGeometry,
    registry: Arc<BlockRegistry>,
) -> Result<Box<dyn BandBlockCache>> {
    let core = CacheCore::new(registry, geometry);
    let mut cache: Box<dyn BandBlockCache> = match strategy.resolve(geometry.block_count()) {
        BlockCacheStrategy::Set => Box::new(SetBandBlockCache::new(core)),
        _ => Box::new(ArrayBandBlockCache::new(core)),
    };
    cache.init()?;

    log::debug!(
        "[BANDCACHE] {:?} strategy for {} x {} block grid",
        cache.strategy(),
        geometry.blocks_per_row,
        geometry.blocks_per_column
    );
    Ok(cache)
}

/// 依次移除已从索引摘除的块，统计进度并保留第一个错误
pub(crate) fn retire_all<I>(core: &CacheCore, blocks: I, progress: &mut FlushProgress<'_>) -> Result<()>
where
    I: IntoIterator<Item = Arc<RasterBlock>>,
{
    let write_dirty = !core.registry().dirty_flush_disabled();
    let mut first_error = None;

    for block in blocks {
        let was_dirty = block.is_dirty();
        if let Err(e) = core.retire(&block, write_dirty) {
            first_error.get_or_insert(e);
        }
        if was_dirty && write_dirty {
            progress.block_written();
        }
    }

    first_error.map_or(Ok(()), Err)
}
