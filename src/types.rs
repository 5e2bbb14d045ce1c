//! 数据结构定义
//!
//! 像素数据类型、块坐标、像素窗口和波段块几何。

use crate::consts::LARGE_BLOCK_DIMENSION;
use crate::error::{Error, ErrorKind, Result};
use byteorder::{ByteOrder, NativeEndian};

/// 像素数据类型
///
/// 数值与 raw 文件头中的类型码一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DataType {
    /// 8 位无符号整数
    Byte = 1,
    /// 16 位无符号整数
    UInt16 = 2,
    /// 16 位有符号整数
    Int16 = 3,
    /// 32 位无符号整数
    UInt32 = 4,
    /// 32 位有符号整数
    Int32 = 5,
    /// 32 位浮点数
    Float32 = 6,
    /// 64 位浮点数
    Float64 = 7,
}

impl DataType {
    /// 单个像素的字节数
    pub const fn size_bytes(self) -> usize {
        match self {
            DataType::Byte => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    /// 类型码
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// 从类型码解析
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(DataType::Byte),
            2 => Some(DataType::UInt16),
            3 => Some(DataType::Int16),
            4 => Some(DataType::UInt32),
            5 => Some(DataType::Int32),
            6 => Some(DataType::Float32),
            7 => Some(DataType::Float64),
            _ => None,
        }
    }

    /// 把一个 f64 值编码为本类型的本机字节序表示
    ///
    /// 整数类型先四舍五入再饱和到取值范围，NaN 编码为 0。
    /// `out` 的长度必须至少为 [`size_bytes`](Self::size_bytes)。
    pub fn encode(self, value: f64, out: &mut [u8]) {
        match self {
            DataType::Byte => out[0] = saturate(value, 0.0, u8::MAX as f64) as u8,
            DataType::UInt16 => {
                NativeEndian::write_u16(out, saturate(value, 0.0, u16::MAX as f64) as u16)
            }
            DataType::Int16 => NativeEndian::write_i16(
                out,
                saturate(value, i16::MIN as f64, i16::MAX as f64) as i16,
            ),
            DataType::UInt32 => {
                NativeEndian::write_u32(out, saturate(value, 0.0, u32::MAX as f64) as u32)
            }
            DataType::Int32 => NativeEndian::write_i32(
                out,
                saturate(value, i32::MIN as f64, i32::MAX as f64) as i32,
            ),
            DataType::Float32 => NativeEndian::write_f32(out, value as f32),
            DataType::Float64 => NativeEndian::write_f64(out, value),
        }
    }

    /// 把本机字节序表示解码为 f64
    pub fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            DataType::Byte => bytes[0] as f64,
            DataType::UInt16 => NativeEndian::read_u16(bytes) as f64,
            DataType::Int16 => NativeEndian::read_i16(bytes) as f64,
            DataType::UInt32 => NativeEndian::read_u32(bytes) as f64,
            DataType::Int32 => NativeEndian::read_i32(bytes) as f64,
            DataType::Float32 => NativeEndian::read_f32(bytes) as f64,
            DataType::Float64 => NativeEndian::read_f64(bytes),
        }
    }
}

fn saturate(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.round().clamp(lo, hi)
    }
}

/// 块坐标
///
/// `x` 为块列号，`y` 为块行号，左上角为 (0, 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    /// 块列号
    pub x: u32,
    /// 块行号
    pub y: u32,
}

impl BlockKey {
    /// 创建块坐标
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// 行优先排序键 (y, x)
    pub const fn row_major(&self) -> (u32, u32) {
        (self.y, self.x)
    }
}

/// 像素窗口（像素坐标）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// 左上角列
    pub x_off: u32,
    /// 左上角行
    pub y_off: u32,
    /// 宽度（像素）
    pub x_size: u32,
    /// 高度（像素）
    pub y_size: u32,
}

impl Window {
    /// 创建窗口
    pub const fn new(x_off: u32, y_off: u32, x_size: u32, y_size: u32) -> Self {
        Self {
            x_off,
            y_off,
            x_size,
            y_size,
        }
    }

    /// 窗口像素数
    pub fn pixel_count(&self) -> usize {
        self.x_size as usize * self.y_size as usize
    }
}

/// 波段的块几何信息
///
/// 描述栅格大小、块大小、像素类型以及由此得出的块网格
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    /// 栅格宽度（像素）
    pub raster_x: u32,
    /// 栅格高度（像素）
    pub raster_y: u32,
    /// 块宽度（像素）
    pub block_x: u32,
    /// 块高度（像素）
    pub block_y: u32,
    /// 像素类型
    pub data_type: DataType,
    /// 每行块数
    pub blocks_per_row: u32,
    /// 每列块数
    pub blocks_per_column: u32,
}

impl BlockGeometry {
    /// 校验尺寸并计算块网格
    ///
    /// # 错误
    ///
    /// 块尺寸或栅格尺寸为 0，或单块字节数超出 `i32` 范围时返回 `InvalidInput`
    pub fn new(
        raster_x: u32,
        raster_y: u32,
        block_x: u32,
        block_y: u32,
        data_type: DataType,
    ) -> Result<Self> {
        if block_x == 0 || block_y == 0 {
            log::error!("[BAND] Invalid block dimension: {} * {}", block_x, block_y);
            return Err(Error::new(ErrorKind::InvalidInput, "Invalid block dimension"));
        }
        if raster_x == 0 || raster_y == 0 {
            log::error!("[BAND] Invalid raster dimension: {} * {}", raster_x, raster_y);
            return Err(Error::new(ErrorKind::InvalidInput, "Invalid raster dimension"));
        }

        if block_x >= LARGE_BLOCK_DIMENSION || block_y >= LARGE_BLOCK_DIMENSION {
            let bytes = block_x as u64 * block_y as u64 * data_type.size_bytes() as u64;
            if bytes > i32::MAX as u64 {
                log::error!("[BAND] Too big block: {} * {}", block_x, block_y);
                return Err(Error::new(ErrorKind::InvalidInput, "Too big block"));
            }
        }

        Ok(Self {
            raster_x,
            raster_y,
            block_x,
            block_y,
            data_type,
            blocks_per_row: raster_x.div_ceil(block_x),
            blocks_per_column: raster_y.div_ceil(block_y),
        })
    }

    /// 单块像素缓冲区字节数
    pub fn block_bytes(&self) -> usize {
        self.block_x as usize * self.block_y as usize * self.data_type.size_bytes()
    }

    /// 块网格总块数
    pub fn block_count(&self) -> u64 {
        self.blocks_per_row as u64 * self.blocks_per_column as u64
    }

    /// 坐标是否落在块网格内
    pub fn contains(&self, key: BlockKey) -> bool {
        key.x < self.blocks_per_row && key.y < self.blocks_per_column
    }

    /// 检查坐标，越界时返回 `InvalidInput`
    pub fn check_key(&self, key: BlockKey) -> Result<()> {
        if key.x >= self.blocks_per_row {
            log::error!("[BAND] Illegal block x offset {} (blocks per row {})", key.x, self.blocks_per_row);
            return Err(Error::new(ErrorKind::InvalidInput, "Illegal block x offset"));
        }
        if key.y >= self.blocks_per_column {
            log::error!("[BAND] Illegal block y offset {} (blocks per column {})", key.y, self.blocks_per_column);
            return Err(Error::new(ErrorKind::InvalidInput, "Illegal block y offset"));
        }
        Ok(())
    }

    /// 块内有效像素范围（右、下边缘块可能不完整）
    ///
    /// 返回 `(有效宽度, 有效高度)`
    pub fn valid_extent(&self, key: BlockKey) -> (u32, u32) {
        let x_start = key.x * self.block_x;
        let y_start = key.y * self.block_y;
        (
            self.block_x.min(self.raster_x - x_start),
            self.block_y.min(self.raster_y - y_start),
        )
    }

    /// 窗口是否完全位于栅格内
    pub fn check_window(&self, window: &Window) -> Result<()> {
        if window.x_size == 0 || window.y_size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Empty window"));
        }
        let x_end = window.x_off as u64 + window.x_size as u64;
        let y_end = window.y_off as u64 + window.y_size as u64;
        if x_end > self.raster_x as u64 || y_end > self.raster_y as u64 {
            log::error!(
                "[BAND] Window ({}, {}, {}, {}) outside raster {} * {}",
                window.x_off,
                window.y_off,
                window.x_size,
                window.y_size,
                self.raster_x,
                self.raster_y
            );
            return Err(Error::new(ErrorKind::InvalidInput, "Window outside raster"));
        }
        Ok(())
    }

    /// 覆盖窗口的块坐标，按行优先顺序
    pub fn blocks_for_window(&self, window: &Window) -> Vec<BlockKey> {
        let x0 = window.x_off / self.block_x;
        let y0 = window.y_off / self.block_y;
        let x1 = (window.x_off + window.x_size - 1) / self.block_x;
        let y1 = (window.y_off + window.y_size - 1) / self.block_y;

        let mut keys = Vec::with_capacity(((x1 - x0 + 1) * (y1 - y0 + 1)) as usize);
        for y in y0..=y1 {
            for x in x0..=x1 {
                keys.push(BlockKey::new(x, y));
            }
        }
        keys
    }
}
