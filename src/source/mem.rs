//! 内存后备存储

use super::RasterSource;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockGeometry, BlockKey, DataType};
use parking_lot::Mutex;
use std::sync::Arc;

/// 内存数据源
///
/// 所有块连续存放在一块内存中。克隆得到的句柄共享同一份存储，
/// 因此把一个句柄交给波段后，仍可以通过另一个句柄检查存储内容和读写次数。
#[derive(Clone)]
pub struct MemSource {
    geometry: BlockGeometry,
    read_only: bool,
    state: Arc<Mutex<MemState>>,
}

struct MemState {
    data: Vec<u8>,
    reads: u64,
    writes: u64,
}

impl MemSource {
    /// 创建全零的内存数据源
    pub fn new(
        raster_x: u32,
        raster_y: u32,
        block_x: u32,
        block_y: u32,
        data_type: DataType,
    ) -> Result<Self> {
        let geometry = BlockGeometry::new(raster_x, raster_y, block_x, block_y, data_type)?;
        let total = (geometry.block_count() as usize)
            .checked_mul(geometry.block_bytes())
            .ok_or(Error::new(ErrorKind::NoMemory, "Raster too large for memory source"))?;

        let mut data = Vec::new();
        data.try_reserve_exact(total)
            .map_err(|e| Error::with_cause(ErrorKind::NoMemory, "Cannot allocate memory source", e))?;
        data.resize(total, 0);

        Ok(Self {
            geometry,
            read_only: false,
            state: Arc::new(Mutex::new(MemState {
                data,
                reads: 0,
                writes: 0,
            })),
        })
    }

    /// 返回只读句柄（共享同一份存储）
    pub fn read_only(&self) -> Self {
        Self {
            read_only: true,
            ..self.clone()
        }
    }

    /// 块几何
    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    /// 已执行的块读取次数
    pub fn read_count(&self) -> u64 {
        self.state.lock().reads
    }

    /// 已执行的块写入次数
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// 复制出一个块的存储内容（不计入读取次数）
    pub fn block_data(&self, key: BlockKey) -> Result<Vec<u8>> {
        let range = self.block_range(key)?;
        Ok(self.state.lock().data[range].to_vec())
    }

    fn block_range(&self, key: BlockKey) -> Result<core::ops::Range<usize>> {
        self.geometry.check_key(key)?;
        let block_bytes = self.geometry.block_bytes();
        let index = key.x as usize + key.y as usize * self.geometry.blocks_per_row as usize;
        Ok(index * block_bytes..(index + 1) * block_bytes)
    }
}

impl RasterSource for MemSource {
    fn raster_size(&self) -> (u32, u32) {
        (self.geometry.raster_x, self.geometry.raster_y)
    }

    fn block_size(&self) -> (u32, u32) {
        (self.geometry.block_x, self.geometry.block_y)
    }

    fn data_type(&self) -> DataType {
        self.geometry.data_type
    }

    fn read_block(&mut self, key: BlockKey, buf: &mut [u8]) -> Result<()> {
        let range = self.block_range(key)?;
        if buf.len() < range.len() {
            return Err(Error::new(ErrorKind::InvalidInput, "buffer too small for block"));
        }
        let mut state = self.state.lock();
        buf[..range.len()].copy_from_slice(&state.data[range]);
        state.reads += 1;
        Ok(())
    }

    fn write_block(&mut self, key: BlockKey, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::new(ErrorKind::PermissionDenied, "Memory source is read-only"));
        }
        let range = self.block_range(key)?;
        if buf.len() < range.len() {
            return Err(Error::new(ErrorKind::InvalidInput, "buffer too small for block"));
        }
        let len = range.len();
        let mut state = self.state.lock();
        state.data[range].copy_from_slice(&buf[..len]);
        state.writes += 1;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_source_roundtrip() {
        let mut src = MemSource::new(8, 8, 4, 4, DataType::Byte).unwrap();
        let observer = src.clone();

        let data = vec![7u8; 16];
        src.write_block(BlockKey::new(1, 1), &data).unwrap();

        let mut buf = vec![0u8; 16];
        src.read_block(BlockKey::new(1, 1), &mut buf).unwrap();
        assert_eq!(buf, data);

        assert_eq!(observer.read_count(), 1);
        assert_eq!(observer.write_count(), 1);
        assert_eq!(observer.block_data(BlockKey::new(1, 1)).unwrap(), data);
        assert_eq!(observer.block_data(BlockKey::new(0, 0)).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_mem_source_bounds() {
        let mut src = MemSource::new(8, 8, 4, 4, DataType::Byte).unwrap();
        let mut buf = vec![0u8; 16];
        assert!(src.read_block(BlockKey::new(2, 0), &mut buf).is_err());
        let mut small = vec![0u8; 4];
        assert!(src.read_block(BlockKey::new(0, 0), &mut small).is_err());
    }

    #[test]
    fn test_mem_source_read_only() {
        let src = MemSource::new(4, 4, 4, 4, DataType::Byte).unwrap();
        let mut ro = src.read_only();
        assert!(ro.is_read_only());
        let err = ro.write_block(BlockKey::new(0, 0), &[0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
}
