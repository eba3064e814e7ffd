//! 无设备输出端.
//!
//! 音频端按数据时长休眠, 模拟声卡的消费节奏; 视频端只做统计.

use std::thread;
use std::time::Duration;

use log::{debug, trace};
use tao_avsync::{AudioParams, AudioSink, AvSyncResult, DisplayFrame, SampleFormat, VideoSink};

/// 按实时速率 "播放" 的空音频设备
pub struct PacedAudioSink {
    bytes_per_sec: f64,
}

impl PacedAudioSink {
    pub fn new(output: &AudioParams) -> Self {
        Self {
            bytes_per_sec: (output.bytes_per_frame() * output.sample_rate as usize) as f64,
        }
    }
}

impl AudioSink for PacedAudioSink {
    fn is_format_supported(&self, params: &AudioParams) -> bool {
        matches!(params.sample_format, SampleFormat::S16 | SampleFormat::F32)
            && params.channel_layout.channels <= 2
    }

    fn write(&mut self, data: &[u8]) -> AvSyncResult<usize> {
        if self.bytes_per_sec > 0.0 {
            thread::sleep(Duration::from_secs_f64(data.len() as f64 / self.bytes_per_sec));
        }
        Ok(data.len())
    }
}

/// 统计送显画面的视频设备
#[derive(Debug, Default)]
pub struct StatsVideoSink {
    shown: u64,
    last_pts: Option<f64>,
    max_gap: f64,
}

impl StatsVideoSink {
    /// 相邻两次送显之间的最大 pts 间隔 (秒)
    pub fn max_gap(&self) -> f64 {
        self.max_gap
    }
}

impl VideoSink for StatsVideoSink {
    fn display(&mut self, frame: DisplayFrame) -> AvSyncResult<()> {
        if let Some(last) = self.last_pts {
            self.max_gap = self.max_gap.max(frame.pts - last);
        }
        self.last_pts = Some(frame.pts);
        self.shown += 1;

        let luma = frame.image.pixel(0, 0).map_or(0, |[r, _, _]| r);
        trace!(
            "显示: pts={:.3} {}x{} 左上像素={}",
            frame.pts, frame.image.width, frame.image.height, luma
        );
        if self.shown % 25 == 0 {
            debug!("已显示 {} 帧, 当前 pts={:.3}", self.shown, frame.pts);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tao_avsync::RgbImage;

    #[test]
    fn test_audio_sink_accepts_interleaved_stereo() {
        let params = AudioParams::new(48000, 2, SampleFormat::S16);
        let sink = PacedAudioSink::new(&params);
        assert!(sink.is_format_supported(&params));
        assert!(!sink.is_format_supported(&AudioParams::new(48000, 6, SampleFormat::S16)));
        assert!(!sink.is_format_supported(&AudioParams::new(48000, 2, SampleFormat::U8)));
    }

    #[test]
    fn test_video_sink_tracks_gap() {
        let mut sink = StatsVideoSink::default();
        for pts in [0.0, 0.04, 0.16] {
            sink.display(DisplayFrame {
                image: RgbImage {
                    width: 1,
                    height: 1,
                    data: vec![9, 9, 9],
                },
                pts,
                subtitle: None,
            })
            .unwrap();
        }
        assert_eq!(sink.shown, 3);
        assert!((sink.max_gap() - 0.12).abs() < 1e-9);
    }
}
