//! 同步引擎配置.
//!
//! 所有字段均有默认值, JSON 中缺省的字段取默认.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clock::SyncMode;
use crate::error::{AvSyncError, AvSyncResult};
use crate::frame_queue::{SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE};

/// 同步阈值下限 (秒)
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
/// 同步阈值上限 (秒)
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// 超过该差值 (秒) 不再尝试同步
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;
/// 视频刷新间隔 (秒)
pub const REFRESH_RATE: f64 = 0.01;

/// 同步引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 同步阈值下限 (秒)
    pub sync_threshold_min: f64,
    /// 同步阈值上限 (秒), 同时也是单次校正量的上限
    pub sync_threshold_max: f64,
    /// 超过该差值 (秒) 视为不可同步, 不做校正
    pub nosync_threshold: f64,
    /// 相邻帧 pts 差值的合理上限 (秒), 超出视为时间戳跳变
    pub max_frame_duration: f64,
    /// 视频刷新间隔 (秒)
    pub refresh_rate: f64,
    /// 落后时允许丢帧
    pub framedrop: bool,
    /// 主时钟类型
    pub sync_mode: SyncMode,
    /// 视频帧队列容量
    pub video_queue_size: usize,
    /// 音频帧队列容量
    pub audio_queue_size: usize,
    /// 字幕帧队列容量
    pub subtitle_queue_size: usize,
    /// 暂停时轮询间隔 (毫秒)
    pub pause_poll_ms: u64,
    /// 音频输出后发送 `PlayerEvent::AudioData` (波形/频谱显示)
    pub emit_audio_data: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_threshold_min: AV_SYNC_THRESHOLD_MIN,
            sync_threshold_max: AV_SYNC_THRESHOLD_MAX,
            nosync_threshold: AV_NOSYNC_THRESHOLD,
            max_frame_duration: 10.0,
            refresh_rate: REFRESH_RATE,
            framedrop: true,
            sync_mode: SyncMode::Audio,
            video_queue_size: VIDEO_PICTURE_QUEUE_SIZE,
            audio_queue_size: SAMPLE_QUEUE_SIZE,
            subtitle_queue_size: SUBPICTURE_QUEUE_SIZE,
            pause_poll_ms: 10,
            emit_audio_data: false,
        }
    }
}

impl SyncConfig {
    /// 从 JSON 字符串解析并校验
    pub fn from_json_str(text: &str) -> AvSyncResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| AvSyncError::Config(format!("解析 JSON 失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载并校验
    pub fn from_json_file(path: impl AsRef<Path>) -> AvSyncResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// 校验配置一致性
    pub fn validate(&self) -> AvSyncResult<()> {
        if !(self.sync_threshold_min >= 0.0 && self.sync_threshold_min <= self.sync_threshold_max)
        {
            return Err(AvSyncError::Config(format!(
                "同步阈值无效: min={} max={}",
                self.sync_threshold_min, self.sync_threshold_max
            )));
        }
        if !(self.refresh_rate > 0.0) || !(self.max_frame_duration > 0.0) {
            return Err(AvSyncError::Config(
                "refresh_rate 与 max_frame_duration 必须为正".into(),
            ));
        }
        if !(self.nosync_threshold > self.sync_threshold_max) {
            return Err(AvSyncError::Config(format!(
                "nosync_threshold ({}) 必须大于 sync_threshold_max ({})",
                self.nosync_threshold, self.sync_threshold_max
            )));
        }
        if self.video_queue_size == 0 || self.audio_queue_size == 0 || self.subtitle_queue_size == 0
        {
            return Err(AvSyncError::Config("帧队列容量必须至少为 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.video_queue_size, 3);
        assert_eq!(config.audio_queue_size, 9);
        assert_eq!(config.subtitle_queue_size, 16);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            SyncConfig::from_json_str(r#"{"framedrop": false, "sync_mode": "external"}"#).unwrap();
        assert!(!config.framedrop);
        assert_eq!(config.sync_mode, SyncMode::External);
        assert_eq!(config.sync_threshold_max, AV_SYNC_THRESHOLD_MAX);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let result =
            SyncConfig::from_json_str(r#"{"sync_threshold_min": 0.2, "sync_threshold_max": 0.1}"#);
        assert!(matches!(result, Err(AvSyncError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"video_queue_size": 5}}"#).unwrap();
        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.video_queue_size, 5);
    }
}
