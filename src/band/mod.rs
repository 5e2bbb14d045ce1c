//! 波段集成层
//!
//! [`RasterBand`] 把像素窗口读写翻译为块访问：
//!
//! ```text
//! read_window / write_window
//!        │  blocks_for_window
//!        ▼
//! get_locked_block ── try_get_locked ──► 命中：touch + 返回
//!        │ 未命中
//!        ▼
//! make_room（可能驱逐其他波段的块）→ create_block → fill → adopt
//! ```
//!
//! 驱逐发生在任意线程上，写回失败记录为延迟错误，由本波段下一次
//! 读写或 `flush_cache` 报告。

mod io;

use crate::block::{BlockOwner, LockedBlockRef, RasterBlock};
use crate::cache::{create_band_block_cache, BandBlockCache, BlockRegistry};
use crate::config::BlockCacheStrategy;
use crate::consts::MAX_ADOPT_RETRIES;
use crate::error::{Error, ErrorKind, Result};
use crate::source::RasterSource;
use crate::types::{BlockGeometry, BlockKey};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// 波段共享状态（块的所属者）
struct BandShared {
    geometry: BlockGeometry,
    read_only: bool,
    source: Mutex<Box<dyn RasterSource>>,
    cache: Box<dyn BandBlockCache>,
    registry: Arc<BlockRegistry>,
    /// 驱逐时的写回错误，下次操作报告
    flush_error: Mutex<Option<Error>>,
    block_reads: AtomicU64,
}

impl BandShared {
    fn record_flush_error(&self, err: Error) {
        let mut slot = self.flush_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_flush_error(&self) -> Result<()> {
        match self.flush_error.lock().take() {
            Some(err) => {
                log::error!("[BAND] reporting deferred write-back failure: {}", err);
                Err(err)
            }
            None => Ok(()),
        }
    }
}

impl BlockOwner for BandShared {
    fn read_block(&self, key: BlockKey, buf: &mut [u8]) -> Result<()> {
        self.source.lock().read_block(key, buf)
    }

    fn write_block(&self, key: BlockKey, buf: &[u8]) -> Result<()> {
        self.source.lock().write_block(key, buf)
    }

    fn evict(&self, block: &Arc<RasterBlock>) -> Vec<u8> {
        self.cache.detach_evicted(block);
        let (result, payload) = self.cache.core().tear_down(block, true);
        if let Err(e) = result {
            self.record_flush_error(e);
        }
        payload
    }

    fn recycle_payload(&self, payload: Vec<u8>) {
        self.cache.core().recycle(payload);
    }
}

/// 栅格波段
///
/// 通过全局注册表共享预算，通过自己的后端索引常驻块。
/// 丢弃时写回所有脏块并等待悬挂块拆除完成；需要拿到错误时使用
/// [`close`](Self::close)。
///
/// # 示例
///
/// ```rust,ignore
/// let registry = Arc::new(BlockRegistry::new(64 * 1024 * 1024));
/// let source = RawFileSource::open("band.rbc", false)?;
/// let band = RasterBand::new(source, &registry, BlockCacheStrategy::Auto)?;
///
/// let mut buf = vec![0u8; 100 * 100];
/// band.read_window(Window::new(0, 0, 100, 100), &mut buf, 100)?;
/// band.close()?;
/// ```
pub struct RasterBand {
    shared: Arc<BandShared>,
    closed: bool,
}

impl RasterBand {
    /// 创建波段
    ///
    /// # 参数
    ///
    /// * `source` - 后备存储
    /// * `registry` - 全局注册表
    /// * `strategy` - 后端策略
    ///
    /// # 错误
    ///
    /// - 尺寸非法时返回 `InvalidInput`
    /// - 后端结构分配失败时返回 `NoMemory`
    pub fn new<S: RasterSource + 'static>(
        source: S,
        registry: &Arc<BlockRegistry>,
        strategy: BlockCacheStrategy,
    ) -> Result<Self> {
        let (raster_x, raster_y) = source.raster_size();
        let (block_x, block_y) = source.block_size();
        let geometry = BlockGeometry::new(raster_x, raster_y, block_x, block_y, source.data_type())?;
        let cache = create_band_block_cache(strategy, geometry, registry.clone())?;

        log::debug!(
            "[BAND] new band {} x {}, blocks {} x {} {:?}",
            raster_x,
            raster_y,
            block_x,
            block_y,
            geometry.data_type
        );

        Ok(Self {
            shared: Arc::new(BandShared {
                geometry,
                read_only: source.is_read_only(),
                source: Mutex::new(Box::new(source)),
                cache,
                registry: registry.clone(),
                flush_error: Mutex::new(None),
                block_reads: AtomicU64::new(0),
            }),
            closed: false,
        })
    }

    /// 创建波段，后端策略取注册表配置的默认值
    ///
    /// 见 [`BlockRegistry::from_config`]
    pub fn with_registry<S: RasterSource + 'static>(
        source: S,
        registry: &Arc<BlockRegistry>,
    ) -> Result<Self> {
        Self::new(source, registry, registry.default_strategy())
    }

    /// 块几何
    pub fn geometry(&self) -> &BlockGeometry {
        &self.shared.geometry
    }

    /// 是否只读
    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    /// 块缓存后端
    pub fn cache(&self) -> &dyn BandBlockCache {
        self.shared.cache.as_ref()
    }

    /// 全局注册表
    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.shared.registry
    }

    /// 从后备存储读取过的块数
    pub fn block_reads(&self) -> u64 {
        self.shared.block_reads.load(Ordering::Relaxed)
    }

    fn owner(&self) -> Weak<dyn BlockOwner> {
        let weak: Weak<BandShared> = Arc::downgrade(&self.shared);
        weak
    }

    fn check_writable(&self) -> Result<()> {
        if self.shared.read_only {
            log::error!("[BAND] write attempt on read-only band");
            return Err(Error::new(ErrorKind::PermissionDenied, "Band is read-only"));
        }
        Ok(())
    }

    //=========================================================================
    // 块访问
    //=========================================================================

    /// 查找常驻块（不会读取后备存储）
    pub fn try_get_locked_block(&self, x: u32, y: u32) -> Result<Option<LockedBlockRef<'_>>> {
        let cache = self.cache();
        Ok(cache
            .try_get_locked(BlockKey::new(x, y))?
            .map(|block| LockedBlockRef::new(cache, block)))
    }

    /// 获取锁定的块，未命中时分配并填充
    ///
    /// # 参数
    ///
    /// * `x`, `y` - 块坐标
    /// * `just_initialize` - 为真时不读取后备存储，块内容为全零
    ///   （调用者将覆盖整个块）
    ///
    /// # 错误
    ///
    /// - 坐标越界时返回 `InvalidInput`
    /// - 无法腾出预算时返回 `ResourceExhausted`
    /// - 填充失败时返回数据源错误，块不会常驻
    pub fn get_locked_block(&self, x: u32, y: u32, just_initialize: bool) -> Result<LockedBlockRef<'_>> {
        let key = BlockKey::new(x, y);
        let geometry = &self.shared.geometry;
        geometry.check_key(key)?;
        let cache = self.cache();
        let core = cache.core();

        for _ in 0..MAX_ADOPT_RETRIES {
            if let Some(block) = cache.try_get_locked(key)? {
                return Ok(LockedBlockRef::new(cache, block));
            }

            self.shared.registry.record_miss();
            log::debug!("[BAND] miss block ({}, {})", x, y);

            if let Err(e) = core.free_dangling_blocks() {
                self.shared.record_flush_error(e);
            }
            core.wait_for_in_flight(key);

            let recycled = self.shared.registry.make_room(geometry.block_bytes())?;
            let block = core.create_block(key, self.owner(), recycled)?;

            if just_initialize {
                block.with_data_mut(|data| data.fill(0));
            } else {
                if let Err(e) = block.fill() {
                    log::error!("[BAND] fill of block ({}, {}) failed: {}", x, y, e);
                    core.recycle(block.take_payload());
                    return Err(e);
                }
                let reads = self.shared.block_reads.fetch_add(1, Ordering::Relaxed) + 1;
                if reads == geometry.block_count() + 1 {
                    log::debug!(
                        "[BAND] Potential thrashing: {} block reads on a {} block band",
                        reads,
                        geometry.block_count()
                    );
                }
            }

            // 先锁定再登记，登记后不会被立即驱逐
            block.acquire_lock();
            match cache.adopt(block.clone()) {
                Ok(()) => return Ok(LockedBlockRef::new(cache, block)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let _ = block.release_lock();
                    core.recycle(block.take_payload());
                }
                Err(e) => {
                    let _ = block.release_lock();
                    return Err(e);
                }
            }
        }

        log::warn!("[BAND] block ({}, {}) adoption kept losing races", x, y);
        Err(Error::new(ErrorKind::Busy, "Block adoption kept losing races"))
    }

    //=========================================================================
    // 刷新
    //=========================================================================

    /// 移除一个块，脏块先写回
    ///
    /// 之前驱逐时记录的写回错误在刷新之后报告
    pub fn flush_block(&self, x: u32, y: u32) -> Result<()> {
        let deferred = self.shared.take_flush_error();
        let flushed = self.cache().flush_block(BlockKey::new(x, y), true);
        deferred.and(flushed)
    }

    /// 写回并移除所有常驻块，然后刷新后备存储
    ///
    /// 先报告之前驱逐时记录的写回错误
    pub fn flush_cache(&self) -> Result<()> {
        self.flush_cache_inner(None)
    }

    /// 同 [`flush_cache`](Self::flush_cache)，并报告写回进度
    pub fn flush_cache_with_progress(&self, progress: &mut dyn FnMut(f64, &str)) -> Result<()> {
        self.flush_cache_inner(Some(progress))
    }

    fn flush_cache_inner(&self, progress: Option<&mut dyn FnMut(f64, &str)>) -> Result<()> {
        let deferred = self.shared.take_flush_error();
        let flushed = self.cache().flush_cache(progress);
        let synced = if self.shared.read_only {
            Ok(())
        } else {
            self.shared.source.lock().flush()
        };
        deferred.and(flushed).and(synced)
    }

    /// 关闭波段：写回所有脏块，等待悬挂块拆除完成
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        let result = self.flush_cache();
        self.cache().wait_for_pending_work();
        debug_assert_eq!(self.cache().core().keep_alive(), 0);
        result
    }
}

impl Drop for RasterBand {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.shutdown() {
            log::error!("[BAND] flush on drop failed: {}", e);
        }
    }
}
