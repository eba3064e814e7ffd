//! 像素格式转换.
//!
//! 解码帧先转换为 RGB24 写入按 32 字节对齐行宽的暂存缓冲,
//! 再逐行复制到紧凑排列的显示图像 (行宽 = width * 3).
//!
//! YUV 使用 BT.601 定点逆变换 (缩放 256 倍):
//! ```text
//! R = Y + 1.402 * V
//! G = Y - 0.344 * U - 0.714 * V
//! B = Y + 1.772 * U
//! ```

use crate::error::{AvSyncError, AvSyncResult};
use crate::format::{PixelFormat, VideoParams};
use crate::frame::VideoFrame;

/// 暂存缓冲行对齐 (字节)
const STAGING_ALIGN: usize = 32;

/// 紧凑排列的 RGB24 显示图像
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    /// 宽度 (像素)
    pub width: u32,
    /// 高度 (像素)
    pub height: u32,
    /// RGB 数据, 行宽 width * 3, 无填充
    pub data: Vec<u8>,
}

impl RgbImage {
    /// 指定像素的 (R, G, B)
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let off = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[off], self.data[off + 1], self.data[off + 2]])
    }
}

/// 像素格式是否可转换为 RGB24
pub fn is_supported(format: PixelFormat) -> bool {
    format != PixelFormat::None
}

/// 像素转换器
///
/// 为一路视频流创建一次, 复用暂存缓冲.
pub struct PixelConverter {
    params: VideoParams,
    staging: Vec<u8>,
    staging_stride: usize,
}

impl PixelConverter {
    /// 创建转换器
    pub fn new(params: VideoParams) -> AvSyncResult<Self> {
        if !is_supported(params.pixel_format) {
            return Err(AvSyncError::UnsupportedPixelFormat(
                params.pixel_format.to_string(),
            ));
        }
        if params.width == 0 || params.height == 0 {
            return Err(AvSyncError::InvalidArgument(format!(
                "无效的视频尺寸: {}x{}",
                params.width, params.height
            )));
        }
        let staging_stride = (params.width as usize * 3).next_multiple_of(STAGING_ALIGN);
        Ok(Self {
            params,
            staging: vec![0u8; staging_stride * params.height as usize],
            staging_stride,
        })
    }

    /// 输入参数
    pub fn params(&self) -> VideoParams {
        self.params
    }

    /// 暂存缓冲的行宽 (字节)
    pub fn staging_stride(&self) -> usize {
        self.staging_stride
    }

    /// 转换一帧
    pub fn convert(&mut self, frame: &VideoFrame) -> AvSyncResult<RgbImage> {
        if frame.params() != self.params {
            return Err(AvSyncError::InvalidArgument(format!(
                "视频帧 {}x{} {} 与转换器 {}x{} {} 不一致",
                frame.width,
                frame.height,
                frame.pixel_format,
                self.params.width,
                self.params.height,
                self.params.pixel_format
            )));
        }
        self.check_planes(frame)?;

        let w = self.params.width as usize;
        let h = self.params.height as usize;
        let stride = self.staging_stride;
        let planes: Vec<&[u8]> = frame.data.iter().map(Vec::as_slice).collect();
        let ls = &frame.linesize;

        match self.params.pixel_format {
            PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p => {
                let (sx, sy) = self.params.pixel_format.chroma_subsampling();
                for row in 0..h {
                    let out = &mut self.staging[row * stride..row * stride + w * 3];
                    let crow = row >> sy;
                    for (col, px) in out.chunks_exact_mut(3).enumerate() {
                        let y = planes[0][row * ls[0] + col];
                        let ccol = col >> sx;
                        let u = planes[1][crow * ls[1] + ccol];
                        let v = planes[2][crow * ls[2] + ccol];
                        px.copy_from_slice(&yuv_to_rgb(y, u, v));
                    }
                }
            }
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let (u_off, v_off) = if self.params.pixel_format == PixelFormat::Nv12 {
                    (0, 1)
                } else {
                    (1, 0)
                };
                for row in 0..h {
                    let out = &mut self.staging[row * stride..row * stride + w * 3];
                    let uv_row = &planes[1][(row >> 1) * ls[1]..];
                    for (col, px) in out.chunks_exact_mut(3).enumerate() {
                        let y = planes[0][row * ls[0] + col];
                        let pair = (col >> 1) * 2;
                        px.copy_from_slice(&yuv_to_rgb(
                            y,
                            uv_row[pair + u_off],
                            uv_row[pair + v_off],
                        ));
                    }
                }
            }
            PixelFormat::Gray8 => {
                for row in 0..h {
                    let out = &mut self.staging[row * stride..row * stride + w * 3];
                    let src = &planes[0][row * ls[0]..row * ls[0] + w];
                    for (px, &g) in out.chunks_exact_mut(3).zip(src) {
                        px.fill(g);
                    }
                }
            }
            PixelFormat::Rgb24 => {
                for row in 0..h {
                    let src = &planes[0][row * ls[0]..row * ls[0] + w * 3];
                    self.staging[row * stride..row * stride + w * 3].copy_from_slice(src);
                }
            }
            PixelFormat::Bgr24 | PixelFormat::Rgba | PixelFormat::Bgra => {
                let (bpp, swap) = match self.params.pixel_format {
                    PixelFormat::Bgr24 => (3, true),
                    PixelFormat::Rgba => (4, false),
                    _ => (4, true),
                };
                for row in 0..h {
                    let out = &mut self.staging[row * stride..row * stride + w * 3];
                    let src = &planes[0][row * ls[0]..row * ls[0] + w * bpp];
                    for (px, s) in out.chunks_exact_mut(3).zip(src.chunks_exact(bpp)) {
                        if swap {
                            px.copy_from_slice(&[s[2], s[1], s[0]]);
                        } else {
                            px.copy_from_slice(&s[..3]);
                        }
                    }
                }
            }
            PixelFormat::None => {
                return Err(AvSyncError::UnsupportedPixelFormat("none".into()));
            }
        }

        // 暂存行宽与显示行宽不同, 逐行复制
        let row_bytes = w * 3;
        let mut data = Vec::with_capacity(row_bytes * h);
        for row in self.staging.chunks_exact(stride).take(h) {
            data.extend_from_slice(&row[..row_bytes]);
        }
        Ok(RgbImage {
            width: self.params.width,
            height: self.params.height,
            data,
        })
    }

    /// 校验各平面的行宽与长度
    fn check_planes(&self, frame: &VideoFrame) -> AvSyncResult<()> {
        let format = self.params.pixel_format;
        let planes = format.plane_count();
        if frame.data.len() < planes || frame.linesize.len() < planes {
            return Err(AvSyncError::InvalidData(format!(
                "{format} 需要 {planes} 个平面, 实际 {}",
                frame.data.len().min(frame.linesize.len())
            )));
        }
        for p in 0..planes {
            let row_bytes = format.plane_linesize(p, self.params.width).unwrap_or(0);
            let rows = format.plane_height(p, self.params.height).unwrap_or(0);
            let linesize = frame.linesize[p];
            if linesize < row_bytes {
                return Err(AvSyncError::InvalidData(format!(
                    "平面 {p} 行宽 {linesize} 小于 {row_bytes}"
                )));
            }
            let needed = linesize * rows.saturating_sub(1) + row_bytes;
            if frame.data[p].len() < needed {
                return Err(AvSyncError::InvalidData(format!(
                    "平面 {p} 数据不足: 期望 {needed} 字节, 实际 {} 字节",
                    frame.data[p].len()
                )));
            }
        }
        Ok(())
    }
}

/// BT.601 YUV -> RGB (定点)
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = i32::from(y);
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;
    let r = (y + ((v * 359 + 128) >> 8)).clamp(0, 255);
    let g = (y - ((u * 88 + v * 183 + 128) >> 8)).clamp(0, 255);
    let b = (y + ((u * 454 + 128) >> 8)).clamp(0, 255);
    [r as u8, g as u8, b as u8]
}
