//! 视频输出.
//!
//! 只在同步控制器判定帧到期时被调用, 负责像素转换与送显, 不做任何计时决策.

use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::convert::{PixelConverter, RgbImage};
use crate::error::{AvSyncError, AvSyncResult};
use crate::frame::Frame;
use crate::state::{PlayerEvent, Stage};
use crate::sync::SyncController;

/// 送显的一帧
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    /// RGB24 图像
    pub image: RgbImage,
    /// 显示时间戳 (秒)
    pub pts: f64,
    /// 叠加的字幕文本
    pub subtitle: Option<String>,
}

/// 显示设备
pub trait VideoSink: Send {
    /// 显示一帧
    fn display(&mut self, frame: DisplayFrame) -> AvSyncResult<()>;
}

/// 通过 mpsc 通道把画面转发给界面线程
pub struct ChannelVideoSink {
    tx: Sender<DisplayFrame>,
}

impl ChannelVideoSink {
    /// 创建转发端
    pub fn new(tx: Sender<DisplayFrame>) -> Self {
        Self { tx }
    }
}

impl VideoSink for ChannelVideoSink {
    fn display(&mut self, frame: DisplayFrame) -> AvSyncResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| AvSyncError::Device("显示端已关闭".into()))
    }
}

/// 视频渲染器
pub struct VideoRenderer<S: VideoSink> {
    sink: S,
    converter: Option<PixelConverter>,
    frames_rendered: u64,
}

impl<S: VideoSink> VideoRenderer<S> {
    /// 创建渲染器
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            converter: None,
            frames_rendered: 0,
        }
    }

    /// 已送显的帧数
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// 显示设备
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// 转换并送显一帧
    pub fn render(&mut self, frame: &Frame, subtitle: Option<&Frame>) -> AvSyncResult<()> {
        let video = frame
            .as_video()
            .ok_or_else(|| AvSyncError::InvalidData("视频队列中出现非视频帧".into()))?;
        let params = video.params();
        let rebuild = self
            .converter
            .as_ref()
            .is_none_or(|conv| conv.params() != params);
        if rebuild {
            debug!(
                "视频转换: {}x{} {} -> rgb24",
                params.width, params.height, params.pixel_format
            );
            self.converter = Some(PixelConverter::new(params)?);
        }
        let Some(converter) = self.converter.as_mut() else {
            return Ok(());
        };
        let image = converter.convert(video)?;
        let subtitle = subtitle
            .and_then(Frame::as_subtitle)
            .map(|s| s.text.clone());
        self.sink.display(DisplayFrame {
            image,
            pts: frame.pts,
            subtitle,
        })?;
        self.frames_rendered += 1;
        Ok(())
    }
}

/// 视频刷新循环
///
/// 按控制器给出的等待时间休眠, 到期帧交给渲染器显示; 中止后发送停止事件.
pub fn run_video_loop<S: VideoSink>(
    controller: &mut SyncController,
    renderer: &mut VideoRenderer<S>,
) -> AvSyncResult<()> {
    let state = Arc::clone(controller.state());
    let refresh_rate = state.config().refresh_rate;
    let mut remaining_time = 0.0;
    info!("视频输出启动");

    let result = loop {
        if state.is_aborted() {
            break Ok(());
        }
        if remaining_time > 0.0 {
            thread::sleep(Duration::from_secs_f64(remaining_time));
        }
        remaining_time = refresh_rate;
        if state.is_paused() && !state.needs_refresh() {
            continue;
        }
        let outcome = controller.refresh(remaining_time);
        remaining_time = outcome.remaining_time;
        if let Some(frame) = outcome.frame {
            if let Err(e) = renderer.render(&frame, outcome.subtitle.as_deref()) {
                break Err(e);
            }
        }
    };

    match &result {
        Ok(()) => info!(
            "视频输出结束: 显示 {} 帧, 丢弃 {} 帧",
            renderer.frames_rendered(),
            state.frame_drops_late() + state.frame_drops_early()
        ),
        Err(e) => warn!("视频输出失败: {}", e),
    }
    state.emit(PlayerEvent::Stopped {
        stage: Stage::VideoRender,
        error: result.as_ref().err().map(ToString::to_string),
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{PixelFormat, VideoParams};
    use crate::frame::{SubtitleFrame, VideoFrame};
    use std::sync::mpsc;

    fn gray_frame(w: u32, h: u32, pts: f64) -> Frame {
        let mut v = VideoFrame::alloc(&VideoParams::new(w, h, PixelFormat::Gray8));
        v.data[0].fill(42);
        Frame::video(v, pts, 0.04, 0)
    }

    #[test]
    fn test_render_forwards_rgb_image() {
        let (tx, rx) = mpsc::channel();
        let mut renderer = VideoRenderer::new(ChannelVideoSink::new(tx));
        let sub = Frame::subtitle(
            SubtitleFrame {
                text: "你好".into(),
                ..Default::default()
            },
            0.0,
            0,
        );
        renderer.render(&gray_frame(4, 2, 1.5), Some(&sub)).unwrap();
        let shown = rx.try_recv().unwrap();
        assert_eq!(shown.pts, 1.5);
        assert_eq!(shown.image.data.len(), 4 * 2 * 3);
        assert!(shown.image.data.iter().all(|&b| b == 42));
        assert_eq!(shown.subtitle.as_deref(), Some("你好"));
        assert_eq!(renderer.frames_rendered(), 1);
    }

    #[test]
    fn test_converter_rebuilt_on_size_change() {
        let (tx, rx) = mpsc::channel();
        let mut renderer = VideoRenderer::new(ChannelVideoSink::new(tx));
        renderer.render(&gray_frame(2, 2, 0.0), None).unwrap();
        renderer.render(&gray_frame(6, 4, 0.04), None).unwrap();
        let sizes: Vec<_> = rx.try_iter().map(|f| (f.image.width, f.image.height)).collect();
        assert_eq!(sizes, vec![(2, 2), (6, 4)]);
    }

    #[test]
    fn test_closed_display_is_device_error() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let mut renderer = VideoRenderer::new(ChannelVideoSink::new(tx));
        assert!(matches!(
            renderer.render(&gray_frame(2, 2, 0.0), None),
            Err(AvSyncError::Device(_))
        ));
    }
}
