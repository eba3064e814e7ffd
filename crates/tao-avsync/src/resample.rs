//! 音频重采样.
//!
//! 把解码帧转换为输出设备的格式, 依次完成:
//! 1. 采样格式转换 (含平面 -> 交错)
//! 2. 声道布局转换
//! 3. 采样率转换 (线性插值)
//!
//! 中间结果统一为归一化 f64 交错样本.

use crate::error::{AvSyncError, AvSyncResult};
use crate::format::{AudioParams, SampleFormat};
use crate::frame::AudioFrame;

/// 音频重采样器
///
/// 配置一次后对同一路流的每一帧复用. 采样率转换跨帧连续:
/// 小数读取位置与上一帧末尾样本保留到下一帧.
#[derive(Debug, Clone)]
pub struct AudioResampler {
    src: AudioParams,
    dst: AudioParams,
    speed: f64,
    /// 下一个输出样本在当前输入帧中的位置, 负值表示位于上一帧末尾样本之后
    position: f64,
    /// 上一帧最后一个采样时刻 (输出声道数)
    last: Vec<f64>,
}

impl AudioResampler {
    /// 创建重采样器; 输出必须为交错格式
    pub fn new(src: AudioParams, dst: AudioParams) -> AvSyncResult<Self> {
        if !src.is_valid() {
            return Err(AvSyncError::InvalidArgument(format!("无效的输入音频参数: {src}")));
        }
        if !dst.is_valid() || dst.sample_format.is_planar() {
            return Err(AvSyncError::InvalidArgument(format!("无效的输出音频参数: {dst}")));
        }
        Ok(Self {
            src,
            dst,
            speed: 1.0,
            position: 0.0,
            last: Vec::new(),
        })
    }

    /// 输入参数
    pub fn src(&self) -> AudioParams {
        self.src
    }

    /// 输出参数
    pub fn dst(&self) -> AudioParams {
        self.dst
    }

    /// 播放速度
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// 设置播放速度: 按 `speed` 倍速消耗输入样本 (音调随之改变)
    pub fn set_speed(&mut self, speed: f64) {
        if speed > 0.0 && speed.is_finite() {
            self.speed = speed;
        }
    }

    /// 丢弃跨帧插值状态 (seek 后调用)
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.last.clear();
    }

    /// 是否需要转换
    pub fn is_needed(&self) -> bool {
        self.src != self.dst || self.speed != 1.0
    }

    /// 转换一帧
    ///
    /// 返回输出交错字节与每声道采样数. 帧参数与创建时的输入参数不一致时报错.
    pub fn convert(&mut self, frame: &AudioFrame) -> AvSyncResult<(Vec<u8>, u32)> {
        if frame.params() != self.src {
            return Err(AvSyncError::InvalidArgument(format!(
                "音频帧参数 {} 与重采样输入 {} 不一致",
                frame.params(),
                self.src
            )));
        }
        let nb_samples = frame.nb_samples as usize;
        let src_channels = self.src.channel_layout.channels as usize;
        let dst_channels = self.dst.channel_layout.channels as usize;

        if !self.is_needed() {
            let len = nb_samples * self.src.bytes_per_frame();
            let data = frame.data.first().map(Vec::as_slice).unwrap_or_default();
            if data.len() < len {
                return Err(AvSyncError::InvalidData(format!(
                    "音频数据不足: 期望 {len} 字节, 实际 {} 字节",
                    data.len()
                )));
            }
            return Ok((data[..len].to_vec(), frame.nb_samples));
        }

        let mut samples = read_interleaved(frame, src_channels)?;
        if src_channels != dst_channels {
            samples = mix_channels(&samples, nb_samples, src_channels, dst_channels);
        }
        let mut nb = nb_samples;
        let ratio = f64::from(self.src.sample_rate) * self.speed / f64::from(self.dst.sample_rate);
        if ratio != 1.0 {
            let (resampled, out) = self.resample_linear(&samples, nb, dst_channels, ratio);
            samples = resampled;
            nb = out;
        }

        let output = write_samples(&samples, self.dst.sample_format)?;
        let nb = u32::try_from(nb)
            .map_err(|_| AvSyncError::InvalidArgument(format!("输出采样数溢出: {nb}")))?;
        Ok((output, nb))
    }
}

impl AudioResampler {
    /// 线性插值重采样
    ///
    /// `ratio` 为每个输出样本推进的输入样本数. 输出到读取位置越过本帧末尾为止,
    /// 剩余的小数位置留给下一帧, 因此逐帧转换的总样本数与整段转换一致.
    fn resample_linear(
        &mut self,
        input: &[f64],
        nb_samples: usize,
        channels: usize,
        ratio: f64,
    ) -> (Vec<f64>, usize) {
        if nb_samples == 0 {
            return (Vec::new(), 0);
        }
        if self.last.len() != channels {
            self.reset();
        }
        let end = (nb_samples - 1) as f64;
        let mut out = Vec::with_capacity(((end - self.position) / ratio) as usize * channels + channels);
        let mut pos = self.position;
        let mut out_samples = 0;
        while pos <= end {
            if pos < 0.0 {
                // 位于上一帧末尾样本与本帧首样本之间
                let frac = pos + 1.0;
                for ch in 0..channels {
                    let s0 = self.last[ch];
                    let s1 = input[ch];
                    out.push(s0 + (s1 - s0) * frac);
                }
            } else {
                let idx0 = (pos.floor() as usize).min(nb_samples - 1);
                let idx1 = (idx0 + 1).min(nb_samples - 1);
                let frac = pos - idx0 as f64;
                for ch in 0..channels {
                    let s0 = input[idx0 * channels + ch];
                    let s1 = input[idx1 * channels + ch];
                    out.push(s0 + (s1 - s0) * frac);
                }
            }
            out_samples += 1;
            pos += ratio;
        }
        self.position = pos - nb_samples as f64;
        self.last.clear();
        self.last
            .extend_from_slice(&input[(nb_samples - 1) * channels..nb_samples * channels]);
        (out, out_samples)
    }
}

/// 读出全部样本为 f64 交错序列
fn read_interleaved(frame: &AudioFrame, channels: usize) -> AvSyncResult<Vec<f64>> {
    let format = frame.sample_format;
    let bps = format.bytes_per_sample();
    let nb_samples = frame.nb_samples as usize;
    let mut out = vec![0.0; nb_samples * channels];

    if format.is_planar() {
        if frame.data.len() < channels {
            return Err(AvSyncError::InvalidData(format!(
                "平面音频缺少声道: 期望 {channels}, 实际 {}",
                frame.data.len()
            )));
        }
        for (ch, plane) in frame.data.iter().take(channels).enumerate() {
            check_len(plane, nb_samples * bps)?;
            for (i, chunk) in plane.chunks_exact(bps).take(nb_samples).enumerate() {
                out[i * channels + ch] = decode_sample(chunk, format)?;
            }
        }
    } else {
        let data = frame.data.first().map(Vec::as_slice).unwrap_or_default();
        check_len(data, out.len() * bps)?;
        for (slot, chunk) in out.iter_mut().zip(data.chunks_exact(bps)) {
            *slot = decode_sample(chunk, format)?;
        }
    }
    Ok(out)
}

fn check_len(data: &[u8], expected: usize) -> AvSyncResult<()> {
    if data.len() < expected {
        return Err(AvSyncError::InvalidData(format!(
            "音频数据不足: 期望 {expected} 字节, 实际 {} 字节",
            data.len()
        )));
    }
    Ok(())
}

/// 将原始字节解码为归一化 f64 样本 (-1.0 ~ 1.0)
fn decode_sample(data: &[u8], format: SampleFormat) -> AvSyncResult<f64> {
    let sample = match format.to_interleaved() {
        SampleFormat::U8 => (f64::from(data[0]) - 128.0) / 128.0,
        SampleFormat::S16 => f64::from(i16::from_le_bytes([data[0], data[1]])) / 32768.0,
        SampleFormat::S32 => {
            f64::from(i32::from_le_bytes([data[0], data[1], data[2], data[3]])) / 2_147_483_648.0
        }
        SampleFormat::F32 => f64::from(f32::from_le_bytes([data[0], data[1], data[2], data[3]])),
        SampleFormat::F64 => f64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]),
        _ => {
            return Err(AvSyncError::UnsupportedOutputFormat(format!(
                "不支持的采样格式: {format}"
            )));
        }
    };
    Ok(sample)
}

/// 将 f64 样本编码为目标格式
fn write_samples(samples: &[f64], format: SampleFormat) -> AvSyncResult<Vec<u8>> {
    let mut out = Vec::with_capacity(samples.len() * format.bytes_per_sample());
    for &s in samples {
        match format {
            SampleFormat::U8 => {
                out.push(((s * 128.0) + 128.0).round().clamp(0.0, 255.0) as u8);
            }
            SampleFormat::S16 => {
                let v = (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
            SampleFormat::S32 => {
                let v = (s * 2_147_483_648.0)
                    .round()
                    .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
                out.extend_from_slice(&v.to_le_bytes());
            }
            SampleFormat::F32 => out.extend_from_slice(&(s as f32).to_le_bytes()),
            SampleFormat::F64 => out.extend_from_slice(&s.to_le_bytes()),
            _ => {
                return Err(AvSyncError::UnsupportedOutputFormat(format!(
                    "不支持的输出采样格式: {format}"
                )));
            }
        }
    }
    Ok(out)
}

/// 声道混合
///
/// - 单声道 -> 多声道: 复制到所有声道
/// - 多声道 -> 单声道: 取平均
/// - 其余: 对应声道直接映射, 多出的声道填静音
fn mix_channels(input: &[f64], nb_samples: usize, src: usize, dst: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(nb_samples * dst);
    for frame in input.chunks_exact(src).take(nb_samples) {
        for ch in 0..dst {
            let v = if src == 1 {
                frame[0]
            } else if dst == 1 {
                frame.iter().sum::<f64>() / src as f64
            } else if ch < src {
                frame[ch]
            } else {
                0.0
            };
            out.push(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ChannelLayout;

    fn s16_frame(samples: &[i16], channels: u32, sample_rate: u32) -> AudioFrame {
        AudioFrame {
            data: vec![samples.iter().flat_map(|s| s.to_le_bytes()).collect()],
            nb_samples: samples.len() as u32 / channels,
            sample_rate,
            sample_format: SampleFormat::S16,
            channel_layout: ChannelLayout::from_channels(channels),
        }
    }

    fn read_s16(data: &[u8]) -> Vec<i16> {
        data.chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_passthrough_when_params_match() {
        let params = AudioParams::new(44100, 2, SampleFormat::S16);
        let mut rs = AudioResampler::new(params, params).unwrap();
        assert!(!rs.is_needed());
        let frame = s16_frame(&[1, 2, 3, 4], 2, 44100);
        let (out, nb) = rs.convert(&frame).unwrap();
        assert_eq!(nb, 2);
        assert_eq!(read_s16(&out), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_planar_float_to_interleaved_s16() {
        let left: Vec<u8> = [0.5f32, -0.5].iter().flat_map(|s| s.to_le_bytes()).collect();
        let right: Vec<u8> = [0.25f32, 0.0].iter().flat_map(|s| s.to_le_bytes()).collect();
        let frame = AudioFrame {
            data: vec![left, right],
            nb_samples: 2,
            sample_rate: 48000,
            sample_format: SampleFormat::F32p,
            channel_layout: ChannelLayout::STEREO,
        };
        let mut rs = AudioResampler::new(frame.params(), frame.params().s16_output()).unwrap();
        let (out, nb) = rs.convert(&frame).unwrap();
        assert_eq!(nb, 2);
        assert_eq!(read_s16(&out), vec![16384, 8192, -16384, 0]);
    }

    #[test]
    fn test_stereo_downmix_averages() {
        let src = AudioParams::new(44100, 2, SampleFormat::S16);
        let dst = AudioParams::new(44100, 1, SampleFormat::S16);
        let mut rs = AudioResampler::new(src, dst).unwrap();
        let (out, nb) = rs.convert(&s16_frame(&[1000, 3000], 2, 44100)).unwrap();
        assert_eq!(nb, 1);
        assert!((read_s16(&out)[0] - 2000).abs() <= 1);
    }

    #[test]
    fn test_rate_conversion_carries_position_across_frames() {
        let src = AudioParams::new(44100, 1, SampleFormat::S16);
        let dst = AudioParams::new(48000, 1, SampleFormat::S16);
        let mut rs = AudioResampler::new(src, dst).unwrap();
        let input: Vec<i16> = (0..100).map(|i| i * 100).collect();
        let mut total = 0u64;
        for _ in 0..10 {
            let (out, nb) = rs.convert(&s16_frame(&input, 1, 44100)).unwrap();
            assert_eq!(out.len(), nb as usize * 2);
            total += u64::from(nb);
        }
        // 1000 个输入样本 -> 约 1088.4 个输出样本, 不随分帧累积多余样本
        let expected = 1000.0 * 48000.0 / 44100.0;
        assert!(
            (total as f64 - expected).abs() <= 1.0,
            "输出样本数 {total} 偏离 {expected:.1}"
        );
    }

    #[test]
    fn test_interpolation_continues_across_frame_boundary() {
        let src = AudioParams::new(1000, 1, SampleFormat::S16);
        let dst = AudioParams::new(2000, 1, SampleFormat::S16);
        let mut rs = AudioResampler::new(src, dst).unwrap();
        let (first, _) = rs.convert(&s16_frame(&[0, 1000], 1, 1000)).unwrap();
        let (second, _) = rs.convert(&s16_frame(&[2000, 3000], 1, 1000)).unwrap();
        assert_eq!(read_s16(&first), vec![0, 500, 1000]);
        // 两帧之间插入 1500
        assert_eq!(read_s16(&second), vec![1500, 2000, 2500, 3000]);
    }

    #[test]
    fn test_speed_consumes_input_faster() {
        let params = AudioParams::new(1000, 1, SampleFormat::S16);
        let mut rs = AudioResampler::new(params, params).unwrap();
        rs.set_speed(2.0);
        assert!(rs.is_needed());
        let input: Vec<i16> = (0..100).map(|i| i * 10).collect();
        let (out, nb) = rs.convert(&s16_frame(&input, 1, 1000)).unwrap();
        assert_eq!(nb, 50);
        assert_eq!(read_s16(&out)[1], 20);
    }

    #[test]
    fn test_planar_output_rejected() {
        let src = AudioParams::new(44100, 2, SampleFormat::S16);
        let dst = AudioParams::new(44100, 2, SampleFormat::F32p);
        assert!(matches!(
            AudioResampler::new(src, dst),
            Err(AvSyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_short_buffer_is_invalid_data() {
        let params = AudioParams::new(44100, 2, SampleFormat::S16);
        let mut rs =
            AudioResampler::new(params, AudioParams::new(48000, 2, SampleFormat::S16)).unwrap();
        let mut frame = s16_frame(&[1, 2, 3, 4], 2, 44100);
        frame.nb_samples = 10;
        assert!(matches!(rs.convert(&frame), Err(AvSyncError::InvalidData(_))));
    }
}
