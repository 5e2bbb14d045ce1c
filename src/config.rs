//! 缓存配置
//!
//! [`CacheConfig`] 描述全局预算和后端选择策略，可以从环境变量加载。

use crate::consts::{
    ARRAY_BACKEND_MAX_BLOCKS, CACHEMAX_MB_THRESHOLD, DEFAULT_CACHE_MAX, ENV_BAND_BLOCK_CACHE,
    ENV_CACHEMAX,
};

/// 波段块缓存后端策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockCacheStrategy {
    /// 按块网格大小自动选择
    #[default]
    Auto,
    /// 稠密槽位数组
    Array,
    /// 稀疏有序集合
    Set,
}

impl BlockCacheStrategy {
    /// 解析策略名称（大小写不敏感）
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Some(Self::Auto),
            "ARRAY" => Some(Self::Array),
            "HASHSET" | "SET" => Some(Self::Set),
            _ => None,
        }
    }

    /// 对给定块总数给出实际使用的后端
    ///
    /// `Auto` 在块总数小于 [`ARRAY_BACKEND_MAX_BLOCKS`] 时选择 Array
    pub fn resolve(self, block_count: u64) -> Self {
        match self {
            Self::Auto if block_count < ARRAY_BACKEND_MAX_BLOCKS => Self::Array,
            Self::Auto => Self::Set,
            other => other,
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// 全局字节预算
    pub cache_max: usize,
    /// 新建波段使用的后端策略
    pub strategy: BlockCacheStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_max: DEFAULT_CACHE_MAX,
            strategy: BlockCacheStrategy::Auto,
        }
    }
}

impl CacheConfig {
    /// 从环境变量加载配置
    ///
    /// 读取 `RBCACHE_CACHEMAX` 和 `RBCACHE_BAND_BLOCK_CACHE`，
    /// 未设置或无法解析的项保留默认值
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(ENV_CACHEMAX) {
            match parse_cache_max(&value) {
                Some(bytes) => config.cache_max = bytes,
                None => log::warn!("[BCACHE] Ignoring invalid {}={:?}", ENV_CACHEMAX, value),
            }
        }

        if let Ok(value) = std::env::var(ENV_BAND_BLOCK_CACHE) {
            match BlockCacheStrategy::parse(&value) {
                Some(strategy) => config.strategy = strategy,
                None => log::warn!("[BCACHE] Ignoring invalid {}={:?}", ENV_BAND_BLOCK_CACHE, value),
            }
        }

        config
    }

    /// 设置字节预算
    pub fn with_cache_max(mut self, bytes: usize) -> Self {
        self.cache_max = bytes;
        self
    }

    /// 设置后端策略
    pub fn with_strategy(mut self, strategy: BlockCacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// 解析缓存预算
///
/// - 纯数字且小于 100000：单位为 MB
/// - 纯数字且不小于 100000：单位为字节
/// - 支持 `KB` / `MB` / `GB` 后缀（大小写不敏感）
pub fn parse_cache_max(value: &str) -> Option<usize> {
    let value = value.trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(n) = value.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("KB") {
        (n, 1024)
    } else {
        let n: u64 = value.parse().ok()?;
        let bytes = if n < CACHEMAX_MB_THRESHOLD { n.checked_mul(1024 * 1024)? } else { n };
        return usize::try_from(bytes).ok();
    };

    let n: u64 = digits.trim().parse().ok()?;
    usize::try_from(n.checked_mul(multiplier)?).ok()
}
