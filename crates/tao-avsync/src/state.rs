//! 共享播放状态.
//!
//! 汇集三条流的数据包队列, 帧队列与时钟, 以及传输控制标志.
//! 各工作线程通过 `Arc<PlaybackState>` 共享; 标志位均为原子量,
//! 只有 seek 请求受互斥锁保护.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use bytes::Bytes;
use log::{debug, info};

use crate::clock::{AtomicF64, Clock, SyncMode, wall_time};
use crate::config::SyncConfig;
use crate::format::AudioParams;
use crate::frame_queue::FrameQueue;
use crate::lock;
use crate::packet_queue::PacketQueue;

/// 外部时钟调速: 队列包数不高于该值视为饥饿
pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
/// 外部时钟调速: 队列包数高于该值视为充足
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;
/// 外部时钟最低速度
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
/// 外部时钟最高速度
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
/// 外部时钟单次调速步长
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;

/// 最低播放速度
pub const PLAYBACK_SPEED_MIN: f64 = 0.25;
/// 最高播放速度
pub const PLAYBACK_SPEED_MAX: f64 = 4.0;
/// 播放速度调节步长
pub const PLAYBACK_SPEED_STEP: f64 = 0.25;

/// 流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// 音频
    Audio,
    /// 视频
    Video,
    /// 字幕
    Subtitle,
}

/// 管线阶段 (用于停止通知)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// 读取/解封装
    Read,
    /// 音频解码
    AudioDecode,
    /// 视频解码
    VideoDecode,
    /// 字幕解码
    SubtitleDecode,
    /// 音频输出
    AudioRender,
    /// 视频输出
    VideoRender,
}

impl Stage {
    /// 对应流类型的解码阶段
    pub fn decode_of(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::AudioDecode,
            MediaKind::Video => Self::VideoDecode,
            MediaKind::Subtitle => Self::SubtitleDecode,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::AudioDecode => "audio-decode",
            Self::VideoDecode => "video-decode",
            Self::SubtitleDecode => "subtitle-decode",
            Self::AudioRender => "audio-render",
            Self::VideoRender => "video-render",
        };
        write!(f, "{name}")
    }
}

/// 发往界面的播放事件
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// 当前播放位置 (秒)
    PlayTime(f64),
    /// 暂停状态变化
    Paused(bool),
    /// 静音状态变化
    Muted(bool),
    /// 播放速度变化
    Speed(f64),
    /// 刚写入音频设备的 PCM 数据 (供波形/频谱显示)
    AudioData(AudioData),
    /// 某个阶段已退出; `error` 为 None 表示正常结束
    Stopped {
        /// 退出的阶段
        stage: Stage,
        /// 失败原因
        error: Option<String>,
    },
}

/// 已输出的一段音频
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    /// 段首的显示时间戳 (秒)
    pub pts: f64,
    /// PCM 格式 (交错)
    pub params: AudioParams,
    /// 音量与静音处理之后的 PCM
    pub pcm: Bytes,
}

/// 待执行的 seek 请求
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    /// 目标位置 (秒)
    pub target: f64,
    /// 相对当前位置的偏移 (秒), 绝对 seek 时为 0
    pub increment: f64,
}

/// 共享播放状态
pub struct PlaybackState {
    config: SyncConfig,

    /// 音频数据包队列
    pub audioq: PacketQueue,
    /// 视频数据包队列
    pub videoq: PacketQueue,
    /// 字幕数据包队列
    pub subtitleq: PacketQueue,

    /// 音频帧队列
    pub sampq: FrameQueue,
    /// 视频帧队列 (保留最近显示帧)
    pub pictq: FrameQueue,
    /// 字幕帧队列 (保留最近显示帧)
    pub subpq: FrameQueue,

    /// 音频时钟
    pub audclk: Clock,
    /// 视频时钟
    pub vidclk: Clock,
    /// 外部时钟
    pub extclk: Clock,

    paused: AtomicBool,
    abort_request: AtomicBool,
    step: AtomicBool,
    muted: AtomicBool,
    realtime: AtomicBool,
    force_refresh: AtomicBool,
    sync_mode: AtomicU8,

    has_audio: AtomicBool,
    has_video: AtomicBool,
    has_subtitle: AtomicBool,

    frame_drops_late: AtomicU64,
    frame_drops_early: AtomicU64,
    /// 最近一次显示帧的目标时刻 (墙钟秒), NaN 表示未开始
    pub(crate) frame_timer: AtomicF64,
    playback_speed: AtomicF64,

    seek_request: Mutex<Option<SeekRequest>>,
    events: Option<Sender<PlayerEvent>>,
}

impl PlaybackState {
    /// 按配置创建播放状态 (默认无任何流)
    pub fn new(config: SyncConfig) -> Self {
        let audioq = PacketQueue::new("audioq");
        let videoq = PacketQueue::new("videoq");
        let subtitleq = PacketQueue::new("subtitleq");
        let audclk = Clock::new(audioq.serial_handle());
        let vidclk = Clock::new(videoq.serial_handle());
        let sync_mode = AtomicU8::new(config.sync_mode.to_u8());
        Self {
            sampq: FrameQueue::new(config.audio_queue_size, false),
            pictq: FrameQueue::new(config.video_queue_size, true),
            subpq: FrameQueue::new(config.subtitle_queue_size, true),
            audioq,
            videoq,
            subtitleq,
            audclk,
            vidclk,
            extclk: Clock::standalone(),
            paused: AtomicBool::new(false),
            abort_request: AtomicBool::new(false),
            step: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            realtime: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            sync_mode,
            has_audio: AtomicBool::new(false),
            has_video: AtomicBool::new(false),
            has_subtitle: AtomicBool::new(false),
            frame_drops_late: AtomicU64::new(0),
            frame_drops_early: AtomicU64::new(0),
            frame_timer: AtomicF64::new(f64::NAN),
            playback_speed: AtomicF64::new(1.0),
            seek_request: Mutex::new(None),
            events: None,
            config,
        }
    }

    /// 设置事件发送端
    pub fn with_events(mut self, events: Sender<PlayerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// 配置
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 声明存在的流
    pub fn set_streams(&self, audio: bool, video: bool, subtitle: bool) {
        self.has_audio.store(audio, Ordering::Release);
        self.has_video.store(video, Ordering::Release);
        self.has_subtitle.store(subtitle, Ordering::Release);
        info!(
            "播放状态: audio={} video={} subtitle={} sync={}",
            audio,
            video,
            subtitle,
            self.sync_mode()
        );
    }

    /// 是否有音频流
    pub fn has_audio(&self) -> bool {
        self.has_audio.load(Ordering::Acquire)
    }

    /// 是否有视频流
    pub fn has_video(&self) -> bool {
        self.has_video.load(Ordering::Acquire)
    }

    /// 是否有字幕流
    pub fn has_subtitle(&self) -> bool {
        self.has_subtitle.load(Ordering::Acquire)
    }

    /// 指定流的数据包队列
    pub fn packet_queue(&self, kind: MediaKind) -> &PacketQueue {
        match kind {
            MediaKind::Audio => &self.audioq,
            MediaKind::Video => &self.videoq,
            MediaKind::Subtitle => &self.subtitleq,
        }
    }

    /// 指定流的帧队列
    pub fn frame_queue(&self, kind: MediaKind) -> &FrameQueue {
        match kind {
            MediaKind::Audio => &self.sampq,
            MediaKind::Video => &self.pictq,
            MediaKind::Subtitle => &self.subpq,
        }
    }

    // ========================
    // 主时钟
    // ========================

    /// 用户选择的同步模式
    pub fn sync_mode(&self) -> SyncMode {
        SyncMode::from_u8(self.sync_mode.load(Ordering::Acquire))
    }

    /// 修改同步模式
    pub fn set_sync_mode(&self, mode: SyncMode) {
        self.sync_mode.store(mode.to_u8(), Ordering::Release);
    }

    /// 实际生效的主时钟类型
    ///
    /// 选择音频为主但没有音频流时回退到外部时钟.
    pub fn master_sync_type(&self) -> SyncMode {
        match self.sync_mode() {
            SyncMode::Video => SyncMode::Video,
            SyncMode::Audio if self.has_audio() => SyncMode::Audio,
            _ => SyncMode::External,
        }
    }

    /// 主时钟
    pub fn master_clock(&self) -> &Clock {
        match self.master_sync_type() {
            SyncMode::Video => &self.vidclk,
            SyncMode::Audio => &self.audclk,
            SyncMode::External => &self.extclk,
        }
    }

    /// 主时钟在指定墙钟时刻的读数
    pub fn master_time_at(&self, now: f64) -> f64 {
        self.master_clock().get_time_at(now)
    }

    /// 根据缓冲水位调整外部时钟速度 (实时流)
    ///
    /// 调速范围与步长都相对于当前播放速度.
    pub fn check_external_clock_speed_at(&self, now: f64) {
        let video_packets = self.videoq.nb_packets();
        let audio_packets = self.audioq.nb_packets();
        let has_video = self.has_video();
        let has_audio = self.has_audio();
        let base = self.playback_speed();
        let step = EXTERNAL_CLOCK_SPEED_STEP * base;
        let speed = self.extclk.speed();

        let starving = (has_video && video_packets <= EXTERNAL_CLOCK_MIN_FRAMES)
            || (has_audio && audio_packets <= EXTERNAL_CLOCK_MIN_FRAMES);
        let plentiful = (!has_video || video_packets > EXTERNAL_CLOCK_MAX_FRAMES)
            && (!has_audio || audio_packets > EXTERNAL_CLOCK_MAX_FRAMES);

        if starving {
            self.extclk
                .set_speed_at((speed - step).max(EXTERNAL_CLOCK_SPEED_MIN * base), now);
        } else if plentiful {
            self.extclk
                .set_speed_at((speed + step).min(EXTERNAL_CLOCK_SPEED_MAX * base), now);
        } else if speed != base {
            let next = if (base - speed).abs() <= step {
                base
            } else {
                speed + step.copysign(base - speed)
            };
            self.extclk.set_speed_at(next, now);
        }
    }

    // ========================
    // 传输控制
    // ========================

    /// 是否暂停
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// 切换暂停 (用户命令), 同时结束单帧步进
    pub fn toggle_pause(&self) {
        self.stream_toggle_pause_at(wall_time());
        self.step.store(false, Ordering::Release);
    }

    /// 在指定墙钟时刻切换暂停状态
    ///
    /// 恢复播放时帧计时器顺延暂停时长, 各时钟以冻结值重设锚点.
    pub fn stream_toggle_pause_at(&self, now: f64) {
        let paused = self.is_paused();
        if paused {
            let frame_timer = self.frame_timer.load();
            if !frame_timer.is_nan() {
                self.frame_timer
                    .store(frame_timer + now - self.vidclk.last_updated());
            }
            self.vidclk
                .set_at(self.vidclk.get_time_at(now), self.vidclk.serial(), now);
            // 音频输出暂停期间不更新时钟, 需同样从冻结值重新计时
            self.audclk
                .set_at(self.audclk.get_time_at(now), self.audclk.serial(), now);
        }
        self.extclk
            .set_at(self.extclk.get_time_at(now), self.extclk.serial(), now);

        let paused = !paused;
        self.paused.store(paused, Ordering::Release);
        self.audclk.set_paused(paused);
        self.vidclk.set_paused(paused);
        self.extclk.set_paused(paused);
        debug!("暂停状态: {}", paused);
        self.emit(PlayerEvent::Paused(paused));
    }

    /// 单帧步进: 暂停时恢复播放, 显示一帧后重新暂停
    pub fn step_to_next_frame(&self) {
        if self.is_paused() {
            self.stream_toggle_pause_at(wall_time());
        }
        self.step.store(true, Ordering::Release);
    }

    /// 是否处于单帧步进
    pub fn is_stepping(&self) -> bool {
        self.step.load(Ordering::Acquire)
    }

    /// 是否静音
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// 设置静音
    pub fn set_muted(&self, muted: bool) {
        let old = self.muted.swap(muted, Ordering::AcqRel);
        if old != muted {
            self.emit(PlayerEvent::Muted(muted));
        }
    }

    /// 切换静音
    pub fn toggle_mute(&self) {
        self.set_muted(!self.is_muted());
    }

    /// 播放速度
    pub fn playback_speed(&self) -> f64 {
        self.playback_speed.load()
    }

    /// 设置播放速度, 返回截断到 [`PLAYBACK_SPEED_MIN`, `PLAYBACK_SPEED_MAX`] 后的实际值
    pub fn set_playback_speed(&self, speed: f64) -> f64 {
        self.set_playback_speed_at(speed, wall_time())
    }

    /// 在指定墙钟时刻设置播放速度
    ///
    /// 各时钟先以当前读数重设锚点再改变速度, 时钟读数保持连续.
    pub fn set_playback_speed_at(&self, speed: f64, now: f64) -> f64 {
        let speed = if speed.is_nan() {
            1.0
        } else {
            speed.clamp(PLAYBACK_SPEED_MIN, PLAYBACK_SPEED_MAX)
        };
        self.playback_speed.store(speed);
        self.audclk.set_speed_at(speed, now);
        self.vidclk.set_speed_at(speed, now);
        self.extclk.set_speed_at(speed, now);
        info!("播放速度: {:.2}x", speed);
        self.emit(PlayerEvent::Speed(speed));
        speed
    }

    /// 按 [`PLAYBACK_SPEED_STEP`] 加快或减慢播放
    pub fn adjust_playback_speed(&self, faster: bool) -> f64 {
        let step = if faster {
            PLAYBACK_SPEED_STEP
        } else {
            -PLAYBACK_SPEED_STEP
        };
        self.set_playback_speed(self.playback_speed() + step)
    }

    /// 标记为实时流 (启用外部时钟调速)
    pub fn set_realtime(&self, realtime: bool) {
        self.realtime.store(realtime, Ordering::Release);
    }

    /// 是否实时流
    pub fn is_realtime(&self) -> bool {
        self.realtime.load(Ordering::Acquire)
    }

    /// 请求重绘最近显示的帧
    pub fn request_refresh(&self) {
        self.force_refresh.store(true, Ordering::Release);
    }

    /// 是否有待处理的重绘请求
    pub fn needs_refresh(&self) -> bool {
        self.force_refresh.load(Ordering::Acquire)
    }

    /// 取走重绘请求
    pub(crate) fn take_refresh(&self) -> bool {
        self.force_refresh.swap(false, Ordering::AcqRel)
    }

    /// 请求 seek
    ///
    /// 只记录请求; 由读取阶段取走, 完成定位后调用 [`apply_seek`](Self::apply_seek).
    pub fn seek(&self, target: f64, increment: f64) {
        *lock(&self.seek_request) = Some(SeekRequest { target, increment });
        info!("seek: target={:.3}s increment={:.3}s", target, increment);
    }

    /// 读取阶段定位完成后调用
    ///
    /// 清空全部数据包队列 (串号递增), 外部时钟移到目标位置;
    /// 暂停状态下步进一帧以显示 seek 后的画面.
    pub fn apply_seek(&self, request: &SeekRequest) {
        self.audioq.flush();
        self.videoq.flush();
        self.subtitleq.flush();
        self.extclk.set(request.target, self.extclk.serial());
        debug!("seek 生效: target={:.3}s", request.target);
        if self.is_paused() {
            self.step_to_next_frame();
        }
    }

    /// 取走待执行的 seek 请求
    pub fn take_seek_request(&self) -> Option<SeekRequest> {
        lock(&self.seek_request).take()
    }

    /// 请求停止: 中止全部队列并唤醒阻塞的工作线程
    pub fn abort(&self) {
        if self.abort_request.swap(true, Ordering::AcqRel) {
            return;
        }
        self.audioq.abort();
        self.videoq.abort();
        self.subtitleq.abort();
        self.sampq.abort();
        self.pictq.abort();
        self.subpq.abort();
        info!("播放中止");
    }

    /// 是否已请求停止
    pub fn is_aborted(&self) -> bool {
        self.abort_request.load(Ordering::Acquire)
    }

    // ========================
    // 统计与事件
    // ========================

    /// 显示阶段丢弃的帧数
    pub fn frame_drops_late(&self) -> u64 {
        self.frame_drops_late.load(Ordering::Acquire)
    }

    /// 解码阶段提前丢弃的帧数
    pub fn frame_drops_early(&self) -> u64 {
        self.frame_drops_early.load(Ordering::Acquire)
    }

    pub(crate) fn count_late_drop(&self) {
        self.frame_drops_late.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn count_early_drop(&self) {
        self.frame_drops_early.fetch_add(1, Ordering::AcqRel);
    }

    /// 当前帧计时器 (墙钟秒)
    pub fn frame_timer(&self) -> f64 {
        self.frame_timer.load()
    }

    /// 发送事件; 接收端已关闭时忽略
    pub fn emit(&self, event: PlayerEvent) {
        if let Some(events) = &self.events {
            events.send(event).ok();
        }
    }
}

impl fmt::Debug for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackState")
            .field("paused", &self.is_paused())
            .field("aborted", &self.is_aborted())
            .field("sync", &self.master_sync_type())
            .field("audclk", &self.audclk)
            .field("vidclk", &self.vidclk)
            .field("extclk", &self.extclk)
            .finish_non_exhaustive()
    }
}
