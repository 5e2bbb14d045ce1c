//! 栅格数据源抽象
//!
//! 波段通过 [`RasterSource`] 读写后备存储中的整块像素。
//! 缓存层只调用这里的块级接口，不关心具体存储格式。
//!
//! - [`MemSource`] - 内存后备存储
//! - [`RawFileSource`] - 磁盘上的 raw 分块文件

mod mem;
mod raw;

#[cfg(test)]
pub(crate) mod mock;

pub use mem::MemSource;
pub use raw::RawFileSource;

use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockKey, DataType};

/// 栅格数据源接口
///
/// 实现此 trait 以提供波段的块级访问。所有缓冲区都是完整块大小
/// (`block_x * block_y * size_bytes`)，右、下边缘块多出的部分内容未定义。
///
/// # 示例
///
/// ```rust,ignore
/// use rastercache_core::{RasterSource, BlockKey, DataType, Result};
///
/// struct MySource {
///     // ...
/// }
///
/// impl RasterSource for MySource {
///     fn raster_size(&self) -> (u32, u32) {
///         (4096, 4096)
///     }
///
///     fn block_size(&self) -> (u32, u32) {
///         (256, 256)
///     }
///
///     fn data_type(&self) -> DataType {
///         DataType::Byte
///     }
///
///     fn read_block(&mut self, key: BlockKey, buf: &mut [u8]) -> Result<()> {
///         // 解码一个块
///         Ok(())
///     }
/// }
/// ```
pub trait RasterSource: Send {
    /// 栅格大小（宽, 高），单位像素
    fn raster_size(&self) -> (u32, u32);

    /// 块大小（宽, 高），单位像素
    fn block_size(&self) -> (u32, u32);

    /// 像素类型
    fn data_type(&self) -> DataType;

    /// 读取一个块
    ///
    /// # 参数
    ///
    /// * `key` - 块坐标
    /// * `buf` - 目标缓冲区（完整块大小）
    fn read_block(&mut self, key: BlockKey, buf: &mut [u8]) -> Result<()>;

    /// 写入一个块
    ///
    /// 默认实现返回 `Unsupported`
    ///
    /// # 参数
    ///
    /// * `key` - 块坐标
    /// * `buf` - 源缓冲区（完整块大小）
    fn write_block(&mut self, key: BlockKey, buf: &[u8]) -> Result<()> {
        let _ = (key, buf);
        Err(Error::new(ErrorKind::Unsupported, "Source does not support writing"))
    }

    /// 刷新底层存储
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }
}

impl<S: RasterSource + ?Sized> RasterSource for Box<S> {
    fn raster_size(&self) -> (u32, u32) {
        (**self).raster_size()
    }

    fn block_size(&self) -> (u32, u32) {
        (**self).block_size()
    }

    fn data_type(&self) -> DataType {
        (**self).data_type()
    }

    fn read_block(&mut self, key: BlockKey, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(key, buf)
    }

    fn write_block(&mut self, key: BlockKey, buf: &[u8]) -> Result<()> {
        (**self).write_block(key, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}
