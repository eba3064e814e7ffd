//! 解码后的帧数据.
//!
//! 由解码阶段产生, 在帧队列中保存直到被渲染端取走.
//! 时间戳统一使用秒 (f64), `NaN` 表示未定义.

use crate::format::{AudioParams, ChannelLayout, PixelFormat, SampleFormat, VideoParams};

/// 视频帧 (原始像素, 支持多平面)
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// 各平面数据
    pub data: Vec<Vec<u8>>,
    /// 各平面每行字节数 (stride, 可大于有效像素宽度)
    pub linesize: Vec<usize>,
    /// 宽度 (像素)
    pub width: u32,
    /// 高度 (像素)
    pub height: u32,
    /// 像素格式
    pub pixel_format: PixelFormat,
}

impl VideoFrame {
    /// 按紧凑行宽分配一帧 (内容全零)
    pub fn alloc(params: &VideoParams) -> Self {
        let planes = params.pixel_format.plane_count();
        let mut data = Vec::with_capacity(planes);
        let mut linesize = Vec::with_capacity(planes);
        for p in 0..planes {
            let ls = params
                .pixel_format
                .plane_linesize(p, params.width)
                .unwrap_or(0);
            let h = params
                .pixel_format
                .plane_height(p, params.height)
                .unwrap_or(0);
            data.push(vec![0u8; ls * h]);
            linesize.push(ls);
        }
        Self {
            data,
            linesize,
            width: params.width,
            height: params.height,
            pixel_format: params.pixel_format,
        }
    }

    /// 帧参数
    pub fn params(&self) -> VideoParams {
        VideoParams::new(self.width, self.height, self.pixel_format)
    }
}

/// 音频帧
///
/// 平面格式: data 中每个 Vec 对应一个声道.
/// 交错格式: data 中只有一个 Vec.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// 采样数据
    pub data: Vec<Vec<u8>>,
    /// 每声道采样数
    pub nb_samples: u32,
    /// 采样率 (Hz)
    pub sample_rate: u32,
    /// 采样格式
    pub sample_format: SampleFormat,
    /// 声道布局
    pub channel_layout: ChannelLayout,
}

impl AudioFrame {
    /// 帧参数
    pub fn params(&self) -> AudioParams {
        AudioParams {
            sample_rate: self.sample_rate,
            channel_layout: self.channel_layout,
            sample_format: self.sample_format,
        }
    }

    /// 本帧时长 (秒)
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        f64::from(self.nb_samples) / f64::from(self.sample_rate)
    }
}

/// 字幕帧
///
/// 显示窗口相对于帧 pts, 单位毫秒.
#[derive(Debug, Clone, Default)]
pub struct SubtitleFrame {
    /// 相对 pts 的开始显示时间 (毫秒)
    pub start_display_time: u32,
    /// 相对 pts 的结束显示时间 (毫秒)
    pub end_display_time: u32,
    /// 字幕文本
    pub text: String,
}

/// 帧载荷
#[derive(Debug, Clone)]
pub enum FrameData {
    /// 视频帧
    Video(VideoFrame),
    /// 音频帧
    Audio(AudioFrame),
    /// 字幕帧
    Subtitle(SubtitleFrame),
}

/// 队列中的解码帧
#[derive(Debug, Clone)]
pub struct Frame {
    /// 解码数据
    pub data: FrameData,
    /// 显示时间戳 (秒), NaN 表示未知
    pub pts: f64,
    /// 时长 (秒)
    pub duration: f64,
    /// 所属数据包串号
    pub serial: u32,
    /// 在输入中的字节位置 (-1 表示未知)
    pub pos: i64,
}

impl Frame {
    /// 创建视频帧
    pub fn video(frame: VideoFrame, pts: f64, duration: f64, serial: u32) -> Self {
        Self {
            data: FrameData::Video(frame),
            pts,
            duration,
            serial,
            pos: -1,
        }
    }

    /// 创建音频帧, 时长取自采样数
    pub fn audio(frame: AudioFrame, pts: f64, serial: u32) -> Self {
        let duration = frame.duration();
        Self {
            data: FrameData::Audio(frame),
            pts,
            duration,
            serial,
            pos: -1,
        }
    }

    /// 创建字幕帧
    pub fn subtitle(sub: SubtitleFrame, pts: f64, serial: u32) -> Self {
        let duration =
            f64::from(sub.end_display_time.saturating_sub(sub.start_display_time)) / 1000.0;
        Self {
            data: FrameData::Subtitle(sub),
            pts,
            duration,
            serial,
            pos: -1,
        }
    }

    /// 设置字节位置
    pub fn with_pos(mut self, pos: i64) -> Self {
        self.pos = pos;
        self
    }

    /// 视频载荷
    pub fn as_video(&self) -> Option<&VideoFrame> {
        match &self.data {
            FrameData::Video(v) => Some(v),
            _ => None,
        }
    }

    /// 音频载荷
    pub fn as_audio(&self) -> Option<&AudioFrame> {
        match &self.data {
            FrameData::Audio(a) => Some(a),
            _ => None,
        }
    }

    /// 字幕载荷
    pub fn as_subtitle(&self) -> Option<&SubtitleFrame> {
        match &self.data {
            FrameData::Subtitle(s) => Some(s),
            _ => None,
        }
    }
}
