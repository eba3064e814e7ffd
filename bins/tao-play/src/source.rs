//! 合成音视频源.
//!
//! 代替解封装器, 按时间戳交错产生音视频数据包; 配套的解码器把数据包
//! 还原为移动的亮度条纹画面与 440Hz 正弦音.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace};
use tao_avsync::{
    AudioFrame, AvSyncError, AvSyncResult, ChannelLayout, CodedPacket, Frame, FrameDecoder,
    PixelFormat, PlaybackState, PlayerEvent, SampleFormat, Stage, VideoFrame, VideoParams,
};

/// 单个队列的数据包上限, 超过后读取阶段等待消费
const MAX_QUEUE_PACKETS: usize = 32;

/// 音频包时长 (秒)
const AUDIO_PACKET_SECONDS: f64 = 0.02;

const AUDIO_STREAM: usize = 0;
const VIDEO_STREAM: usize = 1;

/// 合成源参数
#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub audio: bool,
    pub video: bool,
}

/// 读取阶段: 产生数据包直到中止
pub struct SyntheticSource {
    opts: SourceOptions,
    video_index: u64,
    audio_sample: u64,
    pos: i64,
}

impl SyntheticSource {
    pub fn new(opts: SourceOptions) -> Self {
        Self {
            opts,
            video_index: 0,
            audio_sample: 0,
            pos: 0,
        }
    }

    fn video_pts(&self) -> f64 {
        self.video_index as f64 / f64::from(self.opts.fps)
    }

    fn audio_pts(&self) -> f64 {
        self.audio_sample as f64 / f64::from(self.opts.sample_rate)
    }

    fn audio_chunk(&self) -> u64 {
        (f64::from(self.opts.sample_rate) * AUDIO_PACKET_SECONDS).round() as u64
    }

    /// 运行读取循环, 返回写入的数据包数
    pub fn run(&mut self, state: &PlaybackState) -> AvSyncResult<u64> {
        info!(
            "合成源启动: video={} {}x{}@{}fps audio={} {}Hz",
            self.opts.video,
            self.opts.width,
            self.opts.height,
            self.opts.fps,
            self.opts.audio,
            self.opts.sample_rate
        );
        let result = match self.read_loop(state) {
            Err(AvSyncError::QueueAborted) => Ok(self.packets_read()),
            other => other,
        };
        state.emit(PlayerEvent::Stopped {
            stage: Stage::Read,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    fn packets_read(&self) -> u64 {
        let audio = if self.opts.audio {
            self.audio_sample / self.audio_chunk().max(1)
        } else {
            0
        };
        let video = if self.opts.video { self.video_index } else { 0 };
        audio + video
    }

    fn read_loop(&mut self, state: &PlaybackState) -> AvSyncResult<u64> {
        loop {
            if state.is_aborted() {
                return Ok(self.packets_read());
            }
            if let Some(req) = state.take_seek_request() {
                // 定位后再清空队列, 此后写入的包才带新串号
                self.seek_to(req.target.max(0.0));
                state.apply_seek(&req);
            }

            let audio_full = !self.opts.audio || state.audioq.nb_packets() >= MAX_QUEUE_PACKETS;
            let video_full = !self.opts.video || state.videoq.nb_packets() >= MAX_QUEUE_PACKETS;
            if audio_full && video_full {
                thread::sleep(Duration::from_millis(10));
                continue;
            }

            // 按 pts 交错, 先送时间更早的流
            let video_first = match (audio_full, video_full) {
                (true, _) => true,
                (_, true) => false,
                _ => self.video_pts() <= self.audio_pts(),
            };
            if video_first {
                self.push_video(state)?;
            } else {
                self.push_audio(state)?;
            }
        }
    }

    fn seek_to(&mut self, target: f64) {
        self.video_index = (target * f64::from(self.opts.fps)).floor() as u64;
        let chunk = self.audio_chunk().max(1);
        let sample = (target * f64::from(self.opts.sample_rate)) as u64;
        self.audio_sample = sample - sample % chunk;
        debug!(
            "合成源定位: target={:.3}s video_pts={:.3}s audio_pts={:.3}s",
            target,
            self.video_pts(),
            self.audio_pts()
        );
    }

    fn push_video(&mut self, state: &PlaybackState) -> AvSyncResult<()> {
        let data = Bytes::copy_from_slice(&self.video_index.to_le_bytes());
        let packet = CodedPacket::new(data, VIDEO_STREAM)
            .with_timing(self.video_pts(), 1.0 / f64::from(self.opts.fps))
            .with_pos(self.pos);
        trace!("读取视频包: pts={:.3}", packet.pts);
        self.pos += packet.size() as i64;
        state.videoq.push(packet)?;
        self.video_index += 1;
        Ok(())
    }

    fn push_audio(&mut self, state: &PlaybackState) -> AvSyncResult<()> {
        let chunk = self.audio_chunk();
        let data = Bytes::copy_from_slice(&self.audio_sample.to_le_bytes());
        let packet = CodedPacket::new(data, AUDIO_STREAM)
            .with_timing(
                self.audio_pts(),
                chunk as f64 / f64::from(self.opts.sample_rate),
            )
            .with_pos(self.pos);
        trace!("读取音频包: pts={:.3}", packet.pts);
        self.pos += packet.size() as i64;
        state.audioq.push(packet)?;
        self.audio_sample += chunk;
        Ok(())
    }
}

/// 数据包内容: 首个样本/帧的序号 (u64, 小端)
fn packet_index(packet: &CodedPacket) -> AvSyncResult<u64> {
    let bytes: [u8; 8] = packet
        .data
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| AvSyncError::InvalidData(format!("数据包过短: {} 字节", packet.size())))?;
    Ok(u64::from_le_bytes(bytes))
}

/// 正弦音解码器, 输出 F32 平面立体声
pub struct ToneDecoder {
    sample_rate: u32,
    pending: Option<Frame>,
}

impl ToneDecoder {
    const FREQUENCY: f64 = 440.0;
    const AMPLITUDE: f64 = 0.2;

    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            pending: None,
        }
    }
}

impl FrameDecoder for ToneDecoder {
    fn send_packet(&mut self, packet: &CodedPacket) -> AvSyncResult<()> {
        let start = packet_index(packet)?;
        let nb_samples = (packet.duration * f64::from(self.sample_rate)).round() as u32;
        let step = std::f64::consts::TAU * Self::FREQUENCY / f64::from(self.sample_rate);
        let plane: Vec<u8> = (0..u64::from(nb_samples))
            .flat_map(|i| {
                let v = (Self::AMPLITUDE * ((start + i) as f64 * step).sin()) as f32;
                v.to_le_bytes()
            })
            .collect();
        let frame = AudioFrame {
            data: vec![plane.clone(), plane],
            nb_samples,
            sample_rate: self.sample_rate,
            sample_format: SampleFormat::F32p,
            channel_layout: ChannelLayout::STEREO,
        };
        self.pending = Some(Frame::audio(frame, packet.pts, 0));
        Ok(())
    }

    fn receive_frame(&mut self) -> AvSyncResult<Option<Frame>> {
        Ok(self.pending.take())
    }

    fn flush(&mut self) {
        self.pending = None;
    }
}

/// 条纹画面解码器, 输出 YUV420P
pub struct PatternDecoder {
    params: VideoParams,
    pending: Option<Frame>,
}

impl PatternDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            params: VideoParams::new(width, height, PixelFormat::Yuv420p),
            pending: None,
        }
    }
}

impl FrameDecoder for PatternDecoder {
    fn send_packet(&mut self, packet: &CodedPacket) -> AvSyncResult<()> {
        let index = packet_index(packet)?;
        let mut frame = VideoFrame::alloc(&self.params);
        let width = self.params.width.max(1) as u64;
        let stride = frame.linesize[0];
        // 每帧右移 4 像素的亮度渐变
        for row in frame.data[0].chunks_mut(stride) {
            for (x, px) in row.iter_mut().enumerate() {
                *px = ((x as u64 + index * 4) % width * 255 / width) as u8;
            }
        }
        frame.data[1].fill(128);
        frame.data[2].fill(128);
        self.pending = Some(Frame::video(frame, packet.pts, packet.duration, 0).with_pos(packet.pos));
        Ok(())
    }

    fn receive_frame(&mut self) -> AvSyncResult<Option<Frame>> {
        Ok(self.pending.take())
    }

    fn flush(&mut self) {
        self.pending = None;
    }
}

/// 在独立线程运行读取阶段
pub fn spawn_source(
    state: Arc<PlaybackState>,
    opts: SourceOptions,
) -> std::io::Result<thread::JoinHandle<AvSyncResult<u64>>> {
    thread::Builder::new()
        .name(Stage::Read.to_string())
        .spawn(move || SyntheticSource::new(opts).run(&state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tao_avsync::SyncConfig;

    fn opts() -> SourceOptions {
        SourceOptions {
            fps: 25,
            width: 8,
            height: 4,
            sample_rate: 1000,
            audio: true,
            video: true,
        }
    }

    #[test]
    fn test_source_fills_queues_in_pts_order() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        let handle = spawn_source(Arc::clone(&state), opts()).unwrap();
        while state.videoq.nb_packets() < MAX_QUEUE_PACKETS
            || state.audioq.nb_packets() < MAX_QUEUE_PACKETS
        {
            thread::sleep(Duration::from_millis(5));
        }
        let first = state.videoq.pop(false).unwrap().unwrap();
        let second = state.videoq.pop(false).unwrap().unwrap();
        assert_eq!(first.pts, 0.0);
        assert!((second.pts - 0.04).abs() < 1e-9);
        let audio = state.audioq.pop(false).unwrap().unwrap();
        assert!((audio.duration - 0.02).abs() < 1e-9);
        state.abort();
        assert!(handle.join().unwrap().unwrap() >= 2 * MAX_QUEUE_PACKETS as u64);
    }

    #[test]
    fn test_seek_repositions_source() {
        let state = PlaybackState::new(SyncConfig::default());
        let mut source = SyntheticSource::new(opts());
        source.seek_to(2.01);
        assert_eq!(source.video_index, 50);
        assert_eq!(source.audio_sample, 2000);
        source.push_video(&state).unwrap();
        let packet = state.videoq.pop(false).unwrap().unwrap();
        assert!((packet.pts - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_seek_request_restarts_at_target() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        let handle = spawn_source(Arc::clone(&state), opts()).unwrap();
        while state.videoq.nb_packets() < MAX_QUEUE_PACKETS {
            thread::sleep(Duration::from_millis(5));
        }
        let serial = state.videoq.serial();
        state.seek(2.0, 0.0);
        while state.videoq.serial() == serial {
            thread::sleep(Duration::from_millis(5));
        }
        let packet = state.videoq.pop(true).unwrap().unwrap();
        assert!((packet.pts - 2.0).abs() < 1e-9, "seek 后首包 pts={}", packet.pts);
        assert_eq!(packet.serial, state.videoq.serial());
        state.abort();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_tone_decoder_outputs_planar_stereo() {
        let mut decoder = ToneDecoder::new(1000);
        let packet =
            CodedPacket::new(Bytes::copy_from_slice(&0u64.to_le_bytes()), 0).with_timing(0.5, 0.02);
        decoder.send_packet(&packet).unwrap();
        let frame = decoder.receive_frame().unwrap().unwrap();
        let audio = frame.as_audio().unwrap();
        assert_eq!(audio.nb_samples, 20);
        assert_eq!(audio.data.len(), 2);
        assert_eq!(audio.data[0].len(), 80);
        assert_eq!(frame.pts, 0.5);
        assert!(decoder.receive_frame().unwrap().is_none());
    }

    #[test]
    fn test_pattern_decoder_shifts_each_frame() {
        let mut decoder = PatternDecoder::new(8, 2);
        let packet =
            CodedPacket::new(Bytes::copy_from_slice(&1u64.to_le_bytes()), 1).with_timing(0.04, 0.04);
        decoder.send_packet(&packet).unwrap();
        let frame = decoder.receive_frame().unwrap().unwrap();
        let video = frame.as_video().unwrap();
        // 第 1 帧左移 4 像素: x=0 处亮度等于第 0 帧 x=4 处
        assert_eq!(video.data[0][0], (4 * 255 / 8) as u8);
        assert!(video.data[1].iter().all(|&b| b == 128));
    }

    #[test]
    fn test_short_packet_is_invalid_data() {
        let mut decoder = PatternDecoder::new(2, 2);
        let packet = CodedPacket::new(&b"abc"[..], 1);
        assert!(matches!(
            decoder.send_packet(&packet),
            Err(AvSyncError::InvalidData(_))
        ));
    }
}
