//! 错误类型定义
//!
//! 提供块缓存与波段读写操作的错误类型。

use core::fmt;

/// 块缓存操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误（数据源读写失败）
    Io,
    /// 无效参数（越界坐标、错误尺寸、缓冲区过小）
    InvalidInput,
    /// 后备文件损坏
    Corrupted,
    /// 权限错误（只读波段上写入）
    PermissionDenied,
    /// 不存在
    NotFound,
    /// 已存在（同一坐标重复 adopt）
    AlreadyExists,
    /// 内存分配失败
    NoMemory,
    /// 资源忙
    Busy,
    /// 无效状态（协议违规，例如释放未持有的块）
    InvalidState,
    /// 资源耗尽（所有常驻块都被锁定，无法满足预算）
    ResourceExhausted,
    /// 不支持的操作
    Unsupported,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 创建带原因的错误
    ///
    /// 原因只写入日志，不保存在错误值中
    pub fn with_cause(kind: ErrorKind, message: &'static str, cause: impl fmt::Debug) -> Self {
        log::debug!("{:?}: {} (cause: {:?})", kind, message, cause);
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                Error::with_cause(ErrorKind::NotFound, "File not found", err)
            }
            std::io::ErrorKind::PermissionDenied => {
                Error::with_cause(ErrorKind::PermissionDenied, "Permission denied", err)
            }
            std::io::ErrorKind::UnexpectedEof => {
                Error::with_cause(ErrorKind::Corrupted, "Unexpected end of file", err)
            }
            std::io::ErrorKind::OutOfMemory => {
                Error::with_cause(ErrorKind::NoMemory, "Out of memory", err)
            }
            _ => Error::with_cause(ErrorKind::Io, "I/O error", err),
        }
    }
}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
