//! 音频输出.
//!
//! 按设备速率消费音频帧队列: 重采样到设备格式, 处理静音与音量,
//! 写入输出设备, 并以帧结束时刻 (扣除设备延迟) 更新音频时钟.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};

use crate::clock::wall_time;
use crate::error::{AvSyncError, AvSyncResult};
use crate::format::{AudioParams, SampleFormat};
use crate::frame::{AudioFrame, Frame};
use crate::resample::AudioResampler;
use crate::state::{AudioData, PlayerEvent, PlaybackState, Stage};

/// 音频输出设备
///
/// `write` 可以只接受部分数据, 渲染端会重试剩余部分.
pub trait AudioSink: Send {
    /// 设备能否以该格式输出
    fn is_format_supported(&self, params: &AudioParams) -> bool;

    /// 写入交错 PCM 数据, 返回实际接受的字节数
    fn write(&mut self, data: &[u8]) -> AvSyncResult<usize>;

    /// 已写入但尚未播放的数据时长 (秒)
    fn latency(&self) -> f64 {
        0.0
    }
}

/// 音量控制句柄 (0.0 ~ 1.0), 可跨线程共享
#[derive(Debug, Clone)]
pub struct Volume(Arc<AtomicU32>);

impl Volume {
    fn new(volume: f32) -> Self {
        Self(Arc::new(AtomicU32::new(volume.clamp(0.0, 1.0).to_bits())))
    }

    /// 当前音量
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    /// 设置音量, 超出范围时截断
    pub fn set(&self, volume: f32) {
        self.0
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }
}

/// 音频渲染器
pub struct AudioRenderer<S: AudioSink> {
    state: Arc<PlaybackState>,
    sink: S,
    output: AudioParams,
    resampler: Option<AudioResampler>,
    last_serial: Option<u32>,
    volume: Volume,
    bytes_written: u64,
}

impl<S: AudioSink> AudioRenderer<S> {
    /// 创建渲染器
    ///
    /// 设备不支持 `output` 格式时返回 `UnsupportedOutputFormat`.
    pub fn new(state: Arc<PlaybackState>, sink: S, output: AudioParams) -> AvSyncResult<Self> {
        if !output.is_valid()
            || output.sample_format.is_planar()
            || !sink.is_format_supported(&output)
        {
            return Err(AvSyncError::UnsupportedOutputFormat(output.to_string()));
        }
        Ok(Self {
            state,
            sink,
            output,
            resampler: None,
            last_serial: None,
            volume: Volume::new(1.0),
            bytes_written: 0,
        })
    }

    /// 音量控制句柄
    pub fn volume(&self) -> Volume {
        self.volume.clone()
    }

    /// 输出格式
    pub fn output(&self) -> AudioParams {
        self.output
    }

    /// 累计写入设备的字节数
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// 输出设备
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// 运行输出循环直到中止, 退出时发送停止事件
    pub fn run(&mut self) -> AvSyncResult<()> {
        info!("音频输出启动: {}", self.output);
        let result = match self.run_loop() {
            Err(AvSyncError::QueueAborted) => Ok(()),
            other => other,
        };
        match &result {
            Ok(()) => info!("音频输出结束, 共写入 {} 字节", self.bytes_written),
            Err(e) => warn!("音频输出失败: {}", e),
        }
        self.state.emit(PlayerEvent::Stopped {
            stage: Stage::AudioRender,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    fn run_loop(&mut self) -> AvSyncResult<()> {
        let poll = Duration::from_millis(self.state.config().pause_poll_ms);
        while !self.state.is_aborted() {
            if self.state.is_paused() {
                thread::sleep(poll);
                continue;
            }
            let frame = self.next_frame()?;
            self.render_frame(&frame)?;
        }
        Ok(())
    }

    /// 取出下一帧串号有效的音频帧 (阻塞)
    fn next_frame(&self) -> AvSyncResult<Arc<Frame>> {
        loop {
            let frame = self.state.sampq.peek_readable()?;
            self.state.sampq.next();
            if frame.serial == self.state.audioq.serial() {
                return Ok(frame);
            }
            trace!("丢弃过期音频帧: serial={} pts={:.3}", frame.serial, frame.pts);
        }
    }

    /// 渲染一帧: 重采样, 静音/音量, 写设备, 更新音频时钟
    ///
    /// 返回写入的字节数.
    pub fn render_frame(&mut self, frame: &Frame) -> AvSyncResult<usize> {
        let Some(audio) = frame.as_audio() else {
            warn!("音频队列中出现非音频帧, 已忽略");
            return Ok(0);
        };
        let speed = self.state.playback_speed();
        let serial_changed = self.last_serial != Some(frame.serial);
        self.last_serial = Some(frame.serial);
        let resampler = self.resampler_for(audio)?;
        if serial_changed {
            resampler.reset();
        }
        resampler.set_speed(speed);
        let (mut pcm, _) = resampler.convert(audio)?;

        if self.state.is_muted() {
            fill_silence(&mut pcm, self.output.sample_format);
        } else {
            apply_gain(&mut pcm, self.output.sample_format, self.volume.get());
        }
        self.write_all(&pcm)?;
        let len = pcm.len();

        if !frame.pts.is_nan() {
            let now = wall_time();
            // 设备延迟按当前速度换算为媒体时长
            let clock = frame.pts + audio.duration() - self.sink.latency() * speed;
            let state = &self.state;
            if state.audclk.set_at(clock, frame.serial, now) {
                state
                    .extclk
                    .sync_to_slave_at(&state.audclk, state.config().nosync_threshold, now);
                state.emit(PlayerEvent::PlayTime(clock));
            }
        }
        if self.state.config().emit_audio_data {
            self.state.emit(PlayerEvent::AudioData(AudioData {
                pts: frame.pts,
                params: self.output,
                pcm: Bytes::from(pcm),
            }));
        }
        Ok(len)
    }

    fn resampler_for(&mut self, audio: &AudioFrame) -> AvSyncResult<&mut AudioResampler> {
        let src = audio.params();
        let stale = self.resampler.as_ref().is_none_or(|rs| rs.src() != src);
        if stale {
            debug!("音频参数转换: {} -> {}", src, self.output);
            self.resampler = Some(AudioResampler::new(src, self.output)?);
        }
        self.resampler
            .as_mut()
            .ok_or_else(|| AvSyncError::InvalidArgument("重采样器未初始化".into()))
    }

    /// 写入全部数据, 部分写入时重试剩余部分
    fn write_all(&mut self, data: &[u8]) -> AvSyncResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            if self.state.is_aborted() {
                return Err(AvSyncError::QueueAborted);
            }
            let n = self.sink.write(&data[offset..])?;
            if n == 0 {
                // 设备缓冲已满
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            offset += n.min(data.len() - offset);
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }
}

/// 以静音样本覆盖 (长度不变)
fn fill_silence(pcm: &mut [u8], format: SampleFormat) {
    let silence = if format == SampleFormat::U8 { 0x80 } else { 0 };
    pcm.fill(silence);
}

/// 按音量缩放交错样本
fn apply_gain(pcm: &mut [u8], format: SampleFormat, gain: f32) {
    if gain >= 1.0 {
        return;
    }
    let gain = f64::from(gain);
    match format {
        SampleFormat::U8 => {
            for s in pcm.iter_mut() {
                *s = ((f64::from(*s) - 128.0) * gain + 128.0).round() as u8;
            }
        }
        SampleFormat::S16 => {
            for c in pcm.chunks_exact_mut(2) {
                let v = f64::from(i16::from_le_bytes([c[0], c[1]])) * gain;
                c.copy_from_slice(&(v.round() as i16).to_le_bytes());
            }
        }
        SampleFormat::S32 => {
            for c in pcm.chunks_exact_mut(4) {
                let v = f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])) * gain;
                c.copy_from_slice(&(v.round() as i32).to_le_bytes());
            }
        }
        SampleFormat::F32 => {
            for c in pcm.chunks_exact_mut(4) {
                let v = f32::from_le_bytes([c[0], c[1], c[2], c[3]]) * gain as f32;
                c.copy_from_slice(&v.to_le_bytes());
            }
        }
        SampleFormat::F64 => {
            for c in pcm.chunks_exact_mut(8) {
                let v = f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
                c.copy_from_slice(&(v * gain).to_le_bytes());
            }
        }
        _ => {}
    }
}
