//! # tao-avsync
//!
//! Tao 实时音视频同步引擎.
//!
//! 解封装/解码阶段把压缩数据包写入 [`PacketQueue`], 把解码帧写入 [`FrameQueue`];
//! 音频渲染与视频渲染各自按时钟节拍消费, [`SyncController`] 持续比较视频时钟
//! 与主时钟 (音频/视频/外部), 给出等待与丢帧决策.
//!
//! 主要组件:
//! - [`PacketQueue`]: 带串号的压缩数据包 FIFO
//! - [`FrameQueue`]: 固定容量的解码帧环形队列
//! - [`Clock`]: 连续外推的媒体时钟
//! - [`SyncController`]: 视频节拍与丢帧策略
//! - [`AudioRenderer`] / [`VideoRenderer`]: 音视频输出
//! - [`PlaybackState`]: 共享播放状态与传输控制命令

pub mod audio;
pub mod clock;
pub mod config;
pub mod convert;
pub mod decoder;
pub mod error;
pub mod format;
pub mod frame;
pub mod frame_queue;
pub mod packet_queue;
pub mod resample;
pub mod state;
pub mod sync;
pub mod video;

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

pub use audio::{AudioRenderer, AudioSink, Volume};
pub use clock::{Clock, SyncMode, wall_time};
pub use config::SyncConfig;
pub use convert::{PixelConverter, RgbImage};
pub use decoder::{DecodeWorker, FrameDecoder};
pub use error::{AvSyncError, AvSyncResult};
pub use format::{AudioParams, ChannelLayout, PixelFormat, SampleFormat, VideoParams};
pub use frame::{AudioFrame, Frame, FrameData, SubtitleFrame, VideoFrame};
pub use frame_queue::FrameQueue;
pub use packet_queue::{CodedPacket, PacketQueue};
pub use resample::AudioResampler;
pub use state::{AudioData, MediaKind, PlaybackState, PlayerEvent, SeekRequest, Stage};
pub use sync::{RefreshOutcome, SyncController, SyncPhase, TargetDelay, compute_target_delay};
pub use video::{ChannelVideoSink, DisplayFrame, VideoRenderer, VideoSink, run_video_loop};

/// 加锁; 持锁线程 panic 后仍取回数据继续使用
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 条件变量等待, 忽略锁中毒
pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
