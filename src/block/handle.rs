//! 块句柄 - RAII 风格的块访问

use super::RasterBlock;
use crate::cache::BandBlockCache;
use crate::error::Result;
use crate::types::BlockKey;
use std::sync::Arc;

/// 锁定使用中的块引用
///
/// 由 `locate`/`get_locked_block` 返回，持有期间块不会被驱逐：
/// - 读取通过 [`with_data`](Self::with_data)
/// - 修改通过 [`with_data_mut`](Self::with_data_mut)，自动标记为脏
/// - [`release`](Self::release) 或丢弃时释放锁定；如果块在持有期间已被
///   刷新移除，释放时由持有者完成写回和拆除
///
/// 句柄借用所属的块缓存，因此不能比波段活得更久。
///
/// # 示例
///
/// ```rust,ignore
/// let mut block = band.get_locked_block(0, 0, false)?;
/// block.with_data_mut(|data| data[0] = 0x42);
/// block.release()?;
/// ```
pub struct LockedBlockRef<'a> {
    cache: &'a dyn BandBlockCache,
    block: Arc<RasterBlock>,
    /// 是否仍持有锁定（需要在 drop 时释放）
    held: bool,
}

impl<'a> LockedBlockRef<'a> {
    /// 包装一个已锁定使用的块
    pub(crate) fn new(cache: &'a dyn BandBlockCache, block: Arc<RasterBlock>) -> Self {
        Self {
            cache,
            block,
            held: true,
        }
    }

    /// 块坐标
    pub fn key(&self) -> BlockKey {
        self.block.key()
    }

    /// 是否为脏块
    pub fn is_dirty(&self) -> bool {
        self.block.is_dirty()
    }

    /// 底层块
    pub fn block(&self) -> &Arc<RasterBlock> {
        &self.block
    }

    /// 使用闭包读取块数据
    pub fn with_data<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.block.with_data(f)
    }

    /// 使用闭包修改块数据（自动标记为脏）
    pub fn with_data_mut<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let result = self.block.with_data_mut(f);
        self.cache.mark_dirty(&self.block);
        result
    }

    /// 释放锁定
    ///
    /// 返回延迟拆除时写回产生的错误
    pub fn release(mut self) -> Result<()> {
        self.do_release()
    }

    fn do_release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        self.cache.unreference(&self.block)
    }
}

impl Drop for LockedBlockRef<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.do_release() {
            log::warn!(
                "[BANDCACHE] Releasing block ({}, {}) failed: {}",
                self.block.key().x,
                self.block.key().y,
                e
            );
        }
    }
}

impl core::fmt::Debug for LockedBlockRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockedBlockRef")
            .field("block", &self.block)
            .field("held", &self.held)
            .finish()
    }
}
