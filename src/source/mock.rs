//! 测试用数据源
//!
//! 在 [`MemSource`] 之上记录读写顺序，并可注入读写失败。

use super::{MemSource, RasterSource};
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockKey, DataType};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct MockLog {
    reads: Vec<BlockKey>,
    writes: Vec<BlockKey>,
    fail_reads: bool,
    fail_writes: bool,
}

/// 可观察、可注入失败的数据源，克隆共享同一份状态
#[derive(Clone)]
pub(crate) struct MockSource {
    inner: MemSource,
    log: Arc<Mutex<MockLog>>,
}

impl MockSource {
    pub(crate) fn new(raster_x: u32, raster_y: u32, block_x: u32, block_y: u32, data_type: DataType) -> Self {
        Self {
            inner: MemSource::new(raster_x, raster_y, block_x, block_y, data_type).unwrap(),
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }

    pub(crate) fn set_fail_reads(&self, fail: bool) {
        self.log.lock().fail_reads = fail;
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.log.lock().fail_writes = fail;
    }

    /// 已读取的块，按读取顺序
    pub(crate) fn reads(&self) -> Vec<BlockKey> {
        self.log.lock().reads.clone()
    }

    /// 已写入的块，按写入顺序
    pub(crate) fn writes(&self) -> Vec<BlockKey> {
        self.log.lock().writes.clone()
    }

    /// 后备存储中一个块的内容
    pub(crate) fn stored(&self, key: BlockKey) -> Vec<u8> {
        self.inner.block_data(key).unwrap()
    }
}

impl RasterSource for MockSource {
    fn raster_size(&self) -> (u32, u32) {
        self.inner.raster_size()
    }

    fn block_size(&self) -> (u32, u32) {
        self.inner.block_size()
    }

    fn data_type(&self) -> DataType {
        self.inner.data_type()
    }

    fn read_block(&mut self, key: BlockKey, buf: &mut [u8]) -> Result<()> {
        {
            let mut log = self.log.lock();
            if log.fail_reads {
                return Err(Error::new(ErrorKind::Io, "injected read failure"));
            }
            log.reads.push(key);
        }
        self.inner.read_block(key, buf)
    }

    fn write_block(&mut self, key: BlockKey, buf: &[u8]) -> Result<()> {
        {
            let mut log = self.log.lock();
            if log.fail_writes {
                return Err(Error::new(ErrorKind::Io, "injected write failure"));
            }
            log.writes.push(key);
        }
        self.inner.write_block(key, buf)
    }
}
