//! CRC32 校验和计算
//!
//! 为 raw 文件头提供校验和计算功能

/// 计算 CRC32 校验和（一次性计算）
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
