//! 音视频格式描述.
//!
//! 由解码协作方提供一次, 用于配置音频重采样与像素格式转换.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 音频采样格式
///
/// - 交错 (Interleaved): 所有声道采样交替排列, 如 LRLRLR...
/// - 平面 (Planar): 每个声道独立一个平面, 如 LLL...RRR...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 未指定
    None,
    /// 无符号 8 位整数, 交错
    U8,
    /// 有符号 16 位整数, 交错
    S16,
    /// 有符号 32 位整数, 交错
    S32,
    /// 32 位浮点, 交错
    F32,
    /// 64 位浮点, 交错
    F64,
    /// 无符号 8 位整数, 平面
    U8p,
    /// 有符号 16 位整数, 平面
    S16p,
    /// 有符号 32 位整数, 平面
    S32p,
    /// 32 位浮点, 平面
    F32p,
    /// 64 位浮点, 平面
    F64p,
}

impl SampleFormat {
    /// 每个采样点占用的字节数
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            Self::None => 0,
            Self::U8 | Self::U8p => 1,
            Self::S16 | Self::S16p => 2,
            Self::S32 | Self::S32p | Self::F32 | Self::F32p => 4,
            Self::F64 | Self::F64p => 8,
        }
    }

    /// 是否为平面格式
    pub const fn is_planar(&self) -> bool {
        matches!(
            self,
            Self::U8p | Self::S16p | Self::S32p | Self::F32p | Self::F64p
        )
    }

    /// 获取对应的交错格式
    pub const fn to_interleaved(&self) -> Self {
        match self {
            Self::U8p => Self::U8,
            Self::S16p => Self::S16,
            Self::S32p => Self::S32,
            Self::F32p => Self::F32,
            Self::F64p => Self::F64,
            other => *other,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::F32 => "flt",
            Self::F64 => "dbl",
            Self::U8p => "u8p",
            Self::S16p => "s16p",
            Self::S32p => "s32p",
            Self::F32p => "fltp",
            Self::F64p => "dblp",
        };
        write!(f, "{name}")
    }
}

/// 声道布局
///
/// 同步引擎只关心声道数量, 扬声器位置由输出设备自行映射.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelLayout {
    /// 声道数量
    pub channels: u32,
}

impl ChannelLayout {
    /// 单声道
    pub const MONO: Self = Self { channels: 1 };
    /// 立体声
    pub const STEREO: Self = Self { channels: 2 };
    /// 5.1 环绕声
    pub const SURROUND_5_1: Self = Self { channels: 6 };

    /// 根据声道数创建布局
    pub const fn from_channels(channels: u32) -> Self {
        Self { channels }
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channels {
            1 => write!(f, "mono"),
            2 => write!(f, "stereo"),
            6 => write!(f, "5.1"),
            n => write!(f, "{n}ch"),
        }
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 未指定
    None,
    /// YUV 4:2:0 平面, 8 位
    Yuv420p,
    /// YUV 4:2:2 平面, 8 位
    Yuv422p,
    /// YUV 4:4:4 平面, 8 位
    Yuv444p,
    /// Y 平面 + UV 交错, 4:2:0
    Nv12,
    /// Y 平面 + VU 交错, 4:2:0
    Nv21,
    /// RGB 各 8 位, 打包
    Rgb24,
    /// BGR 各 8 位, 打包
    Bgr24,
    /// RGBA 各 8 位, 打包
    Rgba,
    /// BGRA 各 8 位, 打包
    Bgra,
    /// 灰度 8 位
    Gray8,
}

impl PixelFormat {
    /// 色度子采样 (log2 水平, log2 垂直)
    pub const fn chroma_subsampling(&self) -> (u32, u32) {
        match self {
            Self::Yuv420p | Self::Nv12 | Self::Nv21 => (1, 1),
            Self::Yuv422p => (1, 0),
            _ => (0, 0),
        }
    }

    /// 平面数量
    pub const fn plane_count(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Yuv420p | Self::Yuv422p | Self::Yuv444p => 3,
            Self::Nv12 | Self::Nv21 => 2,
            Self::Rgb24 | Self::Bgr24 | Self::Rgba | Self::Bgra | Self::Gray8 => 1,
        }
    }

    /// 指定平面每行有效像素的字节数 (不含对齐填充)
    pub fn plane_linesize(&self, plane: usize, width: u32) -> Option<usize> {
        if plane >= self.plane_count() {
            return None;
        }
        let w = width as usize;
        let chroma_w = w.div_ceil(1 << self.chroma_subsampling().0);
        Some(match self {
            Self::Yuv420p | Self::Yuv422p | Self::Yuv444p => {
                if plane == 0 {
                    w
                } else {
                    chroma_w
                }
            }
            // plane1 为 UV 交错, 每个色度样本 2 字节
            Self::Nv12 | Self::Nv21 => {
                if plane == 0 {
                    w
                } else {
                    chroma_w * 2
                }
            }
            Self::Rgb24 | Self::Bgr24 => w * 3,
            Self::Rgba | Self::Bgra => w * 4,
            Self::Gray8 => w,
            Self::None => return None,
        })
    }

    /// 指定平面的行数
    pub fn plane_height(&self, plane: usize, height: u32) -> Option<usize> {
        if plane >= self.plane_count() {
            return None;
        }
        let h = height as usize;
        if plane == 0 {
            return Some(h);
        }
        Some(h.div_ceil(1 << self.chroma_subsampling().1))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Yuv420p => "yuv420p",
            Self::Yuv422p => "yuv422p",
            Self::Yuv444p => "yuv444p",
            Self::Nv12 => "nv12",
            Self::Nv21 => "nv21",
            Self::Rgb24 => "rgb24",
            Self::Bgr24 => "bgr24",
            Self::Rgba => "rgba",
            Self::Bgra => "bgra",
            Self::Gray8 => "gray8",
        };
        write!(f, "{name}")
    }
}

/// 音频流参数 (声道布局, 采样格式, 采样率)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    /// 采样率 (Hz)
    pub sample_rate: u32,
    /// 声道布局
    pub channel_layout: ChannelLayout,
    /// 采样格式
    pub sample_format: SampleFormat,
}

impl AudioParams {
    /// 创建音频参数
    pub const fn new(sample_rate: u32, channels: u32, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channel_layout: ChannelLayout::from_channels(channels),
            sample_format,
        }
    }

    /// 相同采样率/声道的 S16 交错输出格式
    pub const fn s16_output(&self) -> Self {
        Self {
            sample_rate: self.sample_rate,
            channel_layout: self.channel_layout,
            sample_format: SampleFormat::S16,
        }
    }

    /// 每个采样时刻 (全部声道) 的字节数
    pub const fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channel_layout.channels as usize
    }

    /// 给定字节数对应的时长 (秒)
    pub fn bytes_to_seconds(&self, bytes: usize) -> f64 {
        let per_second = self.bytes_per_frame() * self.sample_rate as usize;
        if per_second == 0 {
            return 0.0;
        }
        bytes as f64 / per_second as f64
    }

    /// 参数是否可用于输出
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0
            && self.channel_layout.channels > 0
            && self.sample_format != SampleFormat::None
    }
}

impl fmt::Display for AudioParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}/{}",
            self.sample_rate, self.channel_layout, self.sample_format
        )
    }
}

/// 视频流参数 (宽, 高, 像素格式)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoParams {
    /// 宽度 (像素)
    pub width: u32,
    /// 高度 (像素)
    pub height: u32,
    /// 像素格式
    pub pixel_format: PixelFormat,
}

impl VideoParams {
    /// 创建视频参数
    pub const fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }
}
