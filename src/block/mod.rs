//! 块抽象
//!
//! block/raster_block.rs 定义内存中的块：坐标、像素缓冲区、脏标志和原子引用状态，
//! 以及块回到所属波段的 [`BlockOwner`] 接口

//! block/handle.rs 提供对某个已锁定块的 RAII 引用，丢弃时自动释放锁定

mod handle;
mod raster_block;

pub use handle::LockedBlockRef;
pub use raster_block::{BlockFlags, BlockOwner, RasterBlock, RemovalLock};
