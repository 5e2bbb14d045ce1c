//! 窗口读写
//!
//! 窗口与块的重叠部分逐行复制，源和目标的行跨度可以不同。

use super::RasterBand;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockGeometry, BlockKey, Window};

/// 窗口与一个块的交集（像素坐标）
struct Overlap {
    /// 交集在块内的起点
    block_col: usize,
    block_row: usize,
    /// 交集在窗口内的起点
    window_col: usize,
    window_row: usize,
    width: usize,
    height: usize,
    /// 交集覆盖了块的全部有效像素
    covers_block: bool,
}

fn overlap(geometry: &BlockGeometry, key: BlockKey, window: &Window) -> Overlap {
    let bx0 = key.x * geometry.block_x;
    let by0 = key.y * geometry.block_y;
    let (valid_w, valid_h) = geometry.valid_extent(key);

    let x0 = window.x_off.max(bx0);
    let y0 = window.y_off.max(by0);
    let x1 = (window.x_off + window.x_size).min(bx0 + valid_w);
    let y1 = (window.y_off + window.y_size).min(by0 + valid_h);

    Overlap {
        block_col: (x0 - bx0) as usize,
        block_row: (y0 - by0) as usize,
        window_col: (x0 - window.x_off) as usize,
        window_row: (y0 - window.y_off) as usize,
        width: (x1 - x0) as usize,
        height: (y1 - y0) as usize,
        covers_block: x0 == bx0 && y0 == by0 && x1 - bx0 == valid_w && y1 - by0 == valid_h,
    }
}

impl RasterBand {
    fn check_buffer(&self, window: &Window, len: usize, line_stride: usize) -> Result<()> {
        self.geometry().check_window(window)?;
        let row_bytes = window.x_size as usize * self.geometry().data_type.size_bytes();
        if line_stride < row_bytes {
            return Err(Error::new(ErrorKind::InvalidInput, "Line stride smaller than window row"));
        }
        let needed = (window.y_size as usize - 1) * line_stride + row_bytes;
        if len < needed {
            log::error!("[BAND] buffer of {} bytes too small, {} needed", len, needed);
            return Err(Error::new(ErrorKind::InvalidInput, "Buffer too small for window"));
        }
        Ok(())
    }

    /// 读取像素窗口
    ///
    /// # 参数
    ///
    /// * `window` - 像素窗口（必须完全位于栅格内）
    /// * `buf` - 目标缓冲区
    /// * `line_stride` - 目标缓冲区的行跨度（字节）
    pub fn read_window(&self, window: Window, buf: &mut [u8], line_stride: usize) -> Result<()> {
        self.shared.take_flush_error()?;
        self.check_buffer(&window, buf.len(), line_stride)?;

        let geometry = *self.geometry();
        let px = geometry.data_type.size_bytes();
        let block_stride = geometry.block_x as usize * px;

        for key in geometry.blocks_for_window(&window) {
            let part = overlap(&geometry, key, &window);
            let block = self.get_locked_block(key.x, key.y, false)?;
            block.with_data(|data| {
                for row in 0..part.height {
                    let src = (part.block_row + row) * block_stride + part.block_col * px;
                    let dst = (part.window_row + row) * line_stride + part.window_col * px;
                    let len = part.width * px;
                    buf[dst..dst + len].copy_from_slice(&data[src..src + len]);
                }
            });
            block.release()?;
        }
        Ok(())
    }

    /// 写入像素窗口
    ///
    /// 完整覆盖的块不会从后备存储读取
    ///
    /// # 错误
    ///
    /// 只读波段返回 `PermissionDenied`
    pub fn write_window(&self, window: Window, buf: &[u8], line_stride: usize) -> Result<()> {
        self.check_writable()?;
        self.shared.take_flush_error()?;
        self.check_buffer(&window, buf.len(), line_stride)?;

        let geometry = *self.geometry();
        let px = geometry.data_type.size_bytes();
        let block_stride = geometry.block_x as usize * px;

        for key in geometry.blocks_for_window(&window) {
            let part = overlap(&geometry, key, &window);
            let mut block = self.get_locked_block(key.x, key.y, part.covers_block)?;
            block.with_data_mut(|data| {
                for row in 0..part.height {
                    let dst = (part.block_row + row) * block_stride + part.block_col * px;
                    let src = (part.window_row + row) * line_stride + part.window_col * px;
                    let len = part.width * px;
                    data[dst..dst + len].copy_from_slice(&buf[src..src + len]);
                }
            });
            block.release()?;
        }
        Ok(())
    }

    /// 把整个波段设置为同一个值
    ///
    /// 值按像素类型编码（整数类型四舍五入并饱和）
    pub fn fill(&self, value: f64) -> Result<()> {
        self.check_writable()?;
        self.shared.take_flush_error()?;

        let geometry = *self.geometry();
        let px = geometry.data_type.size_bytes();
        let mut pixel = [0u8; 8];
        geometry.data_type.encode(value, &mut pixel);
        let pixel = &pixel[..px];

        for y in 0..geometry.blocks_per_column {
            for x in 0..geometry.blocks_per_row {
                let mut block = self.get_locked_block(x, y, true)?;
                block.with_data_mut(|data| {
                    for chunk in data.chunks_exact_mut(px) {
                        chunk.copy_from_slice(pixel);
                    }
                });
                block.release()?;
            }
        }
        log::debug!("[BAND] filled {} blocks with {}", geometry.block_count(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_overlap_edge_block() {
        let geometry = BlockGeometry::new(10, 10, 4, 4, DataType::Byte).unwrap();

        let part = overlap(&geometry, BlockKey::new(2, 2), &Window::new(6, 6, 4, 4));
        assert_eq!((part.block_col, part.block_row), (0, 0));
        assert_eq!((part.window_col, part.window_row), (2, 2));
        assert_eq!((part.width, part.height), (2, 2));
        assert!(part.covers_block);

        let part = overlap(&geometry, BlockKey::new(0, 0), &Window::new(1, 0, 4, 4));
        assert_eq!((part.block_col, part.width), (1, 3));
        assert!(!part.covers_block);
    }
}
