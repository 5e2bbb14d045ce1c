//! 块缓存常量定义
//!
//! 这个模块包含了块缓存子系统的常量定义，包括：
//! - 缓存预算默认值
//! - 后端选择阈值
//! - 配置环境变量名
//! - raw 文件布局常量

//=============================================================================
// 缓存预算
//=============================================================================

/// 默认缓存预算（64 MiB）
///
/// 进程启动时的全局字节预算，只有显式调用 `set_budget` 才会改变
pub const DEFAULT_CACHE_MAX: usize = 64 * 1024 * 1024;

/// 纯数字形式的 `RBCACHE_CACHEMAX` 小于该值时按 MB 解释
pub const CACHEMAX_MB_THRESHOLD: u64 = 100_000;

/// 每个波段空闲列表中最多保留的可回收像素缓冲区数量
pub const MAX_RECYCLED_PAYLOADS: usize = 4;

//=============================================================================
// 后端选择
//=============================================================================

/// 块网格总数小于该值时默认使用 Array 后端
pub const ARRAY_BACKEND_MAX_BLOCKS: u64 = 1024 * 1024;

/// 任一块边长达到该值时需要检查块字节数溢出
pub const LARGE_BLOCK_DIMENSION: u32 = 10_000;

//=============================================================================
// 刷新进度
//=============================================================================

/// 脏块数超过该值时 flush_cache 输出刷新进度日志
pub const DIRTY_FLUSH_LOG_THRESHOLD: usize = 1000;

/// adopt 竞争失败后重新定位的最大次数
pub const MAX_ADOPT_RETRIES: usize = 8;

//=============================================================================
// 配置项
//=============================================================================

/// 缓存预算环境变量
pub const ENV_CACHEMAX: &str = "RBCACHE_CACHEMAX";

/// 后端策略环境变量（ARRAY / HASHSET / AUTO）
pub const ENV_BAND_BLOCK_CACHE: &str = "RBCACHE_BAND_BLOCK_CACHE";

//=============================================================================
// raw 文件布局
//=============================================================================

/// raw 文件魔数 ("RBC1")
pub const RAW_MAGIC: [u8; 4] = *b"RBC1";

/// raw 文件格式版本
pub const RAW_VERSION: u16 = 1;

/// raw 文件头大小（字节）
///
/// magic(4) + version(2) + data_type(2) + raster_x(4) + raster_y(4)
/// + block_x(4) + block_y(4) + crc32(4)
pub const RAW_HEADER_SIZE: usize = 28;
