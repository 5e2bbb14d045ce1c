//! 块缓存模块
//!
//! # 主要组件
//!
//! - [`BlockRegistry`] - 全局 LRU 注册表和字节预算，使用 lru crate 维护访问顺序
//! - [`BandBlockCache`] - 波段块缓存后端接口
//! - [`ArrayBandBlockCache`] - 稠密槽位数组后端
//! - [`SetBandBlockCache`] - 按 `(y, x)` 排序的稀疏后端
//! - [`CacheCore`] - 后端共享的悬挂块协议、缓冲区回收和脏块计数
//! - [`CacheStats`] - 缓存统计信息
//!
//! # 锁
//!
//! | 锁                 | 保护                    | 持有期间         |
//! |--------------------|-------------------------|------------------|
//! | 注册表锁           | LRU 链表、字节计数       | O(1)，不做 I/O   |
//! | 后端索引锁         | 槽位数组 / 有序集合      | 只修改成员关系   |
//! | 悬挂列表锁 + 条件变量 | 悬挂块、keep-alive     | 只修改列表       |
//! | 块引用状态         | 原子整数                | 无锁 CAS         |
//!
//! 加锁顺序：后端索引锁 → 注册表锁，后端索引锁 → 悬挂列表锁。
//! 驱逐在释放注册表锁之后才回调波段。
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use rastercache_core::cache::{create_band_block_cache, BlockRegistry};
//!
//! let registry = Arc::new(BlockRegistry::new(64 * 1024 * 1024));
//! let cache = create_band_block_cache(BlockCacheStrategy::Auto, geometry, registry.clone())?;
//!
//! if let Some(block) = cache.try_get_locked(BlockKey::new(0, 0))? {
//!     // ...
//!     cache.unreference(&block)?;
//! }
//!
//! cache.flush_cache(None)?;
//! cache.wait_for_pending_work();
//! ```

mod array;
mod backend;
mod core;
mod registry;
mod set;

pub use self::array::ArrayBandBlockCache;
pub use self::backend::{create_band_block_cache, BandBlockCache, ProgressFn};
pub use self::core::CacheCore;
pub use self::registry::{BlockRegistry, CacheStats, DirtyFlushGuard};
pub use self::set::SetBandBlockCache;
