//! raw 分块文件数据源
//!
//! 文件布局：
//!
//! ```text
//! +--------------------+  0
//! | 文件头 (28 字节)    |
//! +--------------------+  RAW_HEADER_SIZE
//! | 块 (0, 0)          |
//! | 块 (1, 0)          |
//! | ...                |  行优先，每块 block_bytes 字节
//! +--------------------+
//! ```
//!
//! 文件头所有字段均为小端序，最后 4 字节是前 24 字节的 CRC32。

use super::RasterSource;
use crate::consts::{RAW_HEADER_SIZE, RAW_MAGIC, RAW_VERSION};
use crate::crc::crc32;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockGeometry, BlockKey, DataType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// raw 分块文件数据源
pub struct RawFileSource {
    file: File,
    geometry: BlockGeometry,
    read_only: bool,
}

impl RawFileSource {
    /// 创建新的 raw 文件（已存在则截断）
    ///
    /// 文件会被扩展到完整大小，未写入的块读出为全零
    pub fn create<P: AsRef<Path>>(
        path: P,
        raster_x: u32,
        raster_y: u32,
        block_x: u32,
        block_y: u32,
        data_type: DataType,
    ) -> Result<Self> {
        let geometry = BlockGeometry::new(raster_x, raster_y, block_x, block_y, data_type)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let header = encode_header(&geometry)?;
        file.write_all(&header)?;

        let total = RAW_HEADER_SIZE as u64 + geometry.block_count() * geometry.block_bytes() as u64;
        file.set_len(total)?;

        log::debug!(
            "[RAWSRC] created {:?}: {}x{} blocks of {}x{} {:?}",
            path.as_ref(),
            geometry.blocks_per_row,
            geometry.blocks_per_column,
            block_x,
            block_y,
            data_type
        );

        Ok(Self {
            file,
            geometry,
            read_only: false,
        })
    }

    /// 打开已有的 raw 文件
    ///
    /// # 错误
    ///
    /// 魔数、版本、类型码或校验和不正确时返回 `Corrupted`
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;

        let mut header = [0u8; RAW_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let geometry = decode_header(&header)?;

        let expected = RAW_HEADER_SIZE as u64 + geometry.block_count() * geometry.block_bytes() as u64;
        if file.metadata()?.len() < expected {
            return Err(Error::new(ErrorKind::Corrupted, "Raw file shorter than its header claims"));
        }

        Ok(Self {
            file,
            geometry,
            read_only,
        })
    }

    /// 块几何
    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    fn block_offset(&self, key: BlockKey) -> Result<u64> {
        self.geometry.check_key(key)?;
        let index = key.x as u64 + key.y as u64 * self.geometry.blocks_per_row as u64;
        Ok(RAW_HEADER_SIZE as u64 + index * self.geometry.block_bytes() as u64)
    }
}

fn encode_header(geometry: &BlockGeometry) -> Result<[u8; RAW_HEADER_SIZE]> {
    let mut header = [0u8; RAW_HEADER_SIZE];
    let mut cursor = Cursor::new(&mut header[..]);
    cursor.write_all(&RAW_MAGIC)?;
    cursor.write_u16::<LittleEndian>(RAW_VERSION)?;
    cursor.write_u16::<LittleEndian>(geometry.data_type.code())?;
    cursor.write_u32::<LittleEndian>(geometry.raster_x)?;
    cursor.write_u32::<LittleEndian>(geometry.raster_y)?;
    cursor.write_u32::<LittleEndian>(geometry.block_x)?;
    cursor.write_u32::<LittleEndian>(geometry.block_y)?;

    let crc = crc32(&header[..RAW_HEADER_SIZE - 4]);
    (&mut header[RAW_HEADER_SIZE - 4..]).write_u32::<LittleEndian>(crc)?;
    Ok(header)
}

fn decode_header(header: &[u8; RAW_HEADER_SIZE]) -> Result<BlockGeometry> {
    if header[..4] != RAW_MAGIC {
        return Err(Error::new(ErrorKind::Corrupted, "Invalid raw file magic"));
    }

    let stored_crc = (&header[RAW_HEADER_SIZE - 4..]).read_u32::<LittleEndian>()?;
    if crc32(&header[..RAW_HEADER_SIZE - 4]) != stored_crc {
        return Err(Error::new(ErrorKind::Corrupted, "Raw file header checksum mismatch"));
    }

    let mut cursor = Cursor::new(&header[4..RAW_HEADER_SIZE - 4]);
    let version = cursor.read_u16::<LittleEndian>()?;
    if version != RAW_VERSION {
        return Err(Error::new(ErrorKind::Unsupported, "Unsupported raw file version"));
    }
    let data_type = DataType::from_code(cursor.read_u16::<LittleEndian>()?)
        .ok_or(Error::new(ErrorKind::Corrupted, "Unknown data type code"))?;
    let raster_x = cursor.read_u32::<LittleEndian>()?;
    let raster_y = cursor.read_u32::<LittleEndian>()?;
    let block_x = cursor.read_u32::<LittleEndian>()?;
    let block_y = cursor.read_u32::<LittleEndian>()?;

    BlockGeometry::new(raster_x, raster_y, block_x, block_y, data_type)
        .map_err(|e| Error::with_cause(ErrorKind::Corrupted, "Invalid geometry in raw file header", e))
}

impl RasterSource for RawFileSource {
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
        let block_bytes = self.geometry.block_bytes();
        if buf.len() < block_bytes {
            return Err(Error::new(ErrorKind::InvalidInput, "buffer too small for block"));
        }
        let offset = self.block_offset(key)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf[..block_bytes])?;
        log::trace!("[RAWSRC] read block ({}, {})", key.x, key.y);
        Ok(())
    }

    fn write_block(&mut self, key: BlockKey, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::new(ErrorKind::PermissionDenied, "Raw file opened read-only"));
        }
        let block_bytes = self.geometry.block_bytes();
        if buf.len() < block_bytes {
            return Err(Error::new(ErrorKind::InvalidInput, "buffer too small for block"));
        }
        let offset = self.block_offset(key)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf[..block_bytes])?;
        log::trace!("[RAWSRC] wrote block ({}, {})", key.x, key.y);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.read_only {
            self.file.sync_data()?;
        }
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
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("band.rbc");

        {
            let mut src = RawFileSource::create(&path, 10, 6, 4, 4, DataType::UInt16).unwrap();
            assert_eq!(src.geometry().blocks_per_row, 3);
            assert_eq!(src.geometry().blocks_per_column, 2);
            let data: Vec<u8> = (0..32).collect();
            src.write_block(BlockKey::new(2, 1), &data).unwrap();
            src.flush().unwrap();
        }

        let mut src = RawFileSource::open(&path, true).unwrap();
        assert_eq!(src.raster_size(), (10, 6));
        assert_eq!(src.block_size(), (4, 4));
        assert_eq!(src.data_type(), DataType::UInt16);

        let mut buf = vec![0u8; 32];
        src.read_block(BlockKey::new(2, 1), &mut buf).unwrap();
        assert_eq!(buf, (0..32).collect::<Vec<u8>>());

        src.read_block(BlockKey::new(0, 0), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        let err = src.write_block(BlockKey::new(0, 0), &buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_corrupted_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.rbc");
        drop(RawFileSource::create(&path, 4, 4, 4, 4, DataType::Byte).unwrap());

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = RawFileSource::open(&path, true).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.rbc");
        std::fs::write(&path, [0u8; 64]).unwrap();

        let err = RawFileSource::open(&path, true).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }
}
