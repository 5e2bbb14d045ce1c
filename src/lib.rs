//! rastercache_core: 栅格块缓存引擎
//!
//! 这是一个纯 Rust 实现的栅格块缓存库，让很多逻辑上的二维波段通过固定大小的
//! 块读写，同时只在内存中保留有限数量的解码像素：
//! - **全局 LRU 预算**：所有波段共享一个字节预算和一条访问顺序链
//! - **两种后端**：稠密槽位数组和按行优先排序的稀疏集合
//! - **悬挂块协议**：块在被其他线程持有时也能安全地驱逐和写回
//! - **零 unsafe 代码**
//!
//! # 示例
//!
//! ```rust,ignore
//! use rastercache_core::{BlockRegistry, CacheConfig, RasterBand, RawFileSource, Window};
//! use std::sync::Arc;
//!
//! fn main() -> rastercache_core::Result<()> {
//!     let registry = Arc::new(BlockRegistry::from_config(&CacheConfig::from_env()));
//!     let source = RawFileSource::open("band.rbc", false)?;
//!     let band = RasterBand::with_registry(source, &registry)?;
//!
//!     // 读取窗口
//!     let mut buf = vec![0u8; 256 * 256];
//!     band.read_window(Window::new(0, 0, 256, 256), &mut buf, 256)?;
//!
//!     // 写入并刷新
//!     band.write_window(Window::new(0, 0, 256, 256), &buf, 256)?;
//!     band.close()?;
//!     Ok(())
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`consts`] - 常量定义
//! - [`types`] - 数据结构定义
//! - [`config`] - 缓存配置
//! - [`source`] - 栅格数据源抽象
//! - [`block`] - 内存块和块句柄
//! - [`cache`] - 全局注册表和波段块缓存后端
//! - [`band`] - 波段集成层

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 常量定义
pub mod consts;

/// 数据结构定义
pub mod types;

/// 缓存配置
pub mod config;

/// 栅格数据源
pub mod source;

/// 内存块
pub mod block;

/// 块缓存
pub mod cache;

/// 波段集成层
pub mod band;

/// CRC32 校验和计算
pub(crate) mod crc;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 数据结构
pub use types::{BlockGeometry, BlockKey, DataType, Window};

// 配置
pub use config::{parse_cache_max, BlockCacheStrategy, CacheConfig};

// 数据源
pub use source::{MemSource, RasterSource, RawFileSource};

// 块
pub use block::{BlockFlags, BlockOwner, LockedBlockRef, RasterBlock, RemovalLock};

// Cache
pub use cache::{
    create_band_block_cache, ArrayBandBlockCache, BandBlockCache, BlockRegistry, CacheCore,
    CacheStats, DirtyFlushGuard, SetBandBlockCache,
};

// 波段
pub use band::RasterBand;
