//! 同步引擎错误类型定义.
//!
//! 串号不匹配 (过期数据) 与未定义时间戳 (NaN pts) 在各模块内部就地处理,
//! 不作为错误向上传播.

use thiserror::Error;

/// 同步引擎统一错误类型
#[derive(Debug, Error)]
pub enum AvSyncError {
    /// 队列已中止 (协作式退出, 不是故障)
    #[error("队列已中止")]
    QueueAborted,

    /// 输出设备无法接受请求的音频格式
    #[error("不支持的输出格式: {0}")]
    UnsupportedOutputFormat(String),

    /// 像素格式无法转换为显示格式
    #[error("不支持的像素格式: {0}")]
    UnsupportedPixelFormat(String),

    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 无效数据 (缓冲区长度不足等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 输出设备错误
    #[error("设备错误: {0}")]
    Device(String),

    /// 解码协作方错误
    #[error("解码错误: {0}")]
    Decode(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl AvSyncError {
    /// 是否为协作式中止
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::QueueAborted)
    }
}

/// 同步引擎统一 Result 类型
pub type AvSyncResult<T> = Result<T, AvSyncError>;
