//! 视频节拍与丢帧策略.
//!
//! 每个刷新周期比较视频时钟与主时钟, 决定当前帧是继续等待, 立即显示, 还是丢弃.
//! 状态转换: `Idle` (无视频流) -> `Waiting` (队列为空) -> `Timing` (等待显示时刻)
//! -> `Displaying` -> 回到 `Waiting`/`Timing`.

use std::sync::Arc;

use log::{debug, trace};

use crate::clock::{SyncMode, wall_time};
use crate::config::SyncConfig;
use crate::frame::Frame;
use crate::state::PlaybackState;

/// 同步控制器所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// 没有视频流
    #[default]
    Idle,
    /// 帧队列为空
    Waiting,
    /// 已计算延迟, 等待显示时刻
    Timing,
    /// 本周期有帧需要显示
    Displaying,
}

/// 延迟计算结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetDelay {
    /// 距上一帧的目标显示间隔 (秒), 不小于 0
    pub delay: f64,
    /// 相对名义帧间隔的校正量 (秒)
    pub correction: f64,
}

/// 一个刷新周期的结果
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    /// 需要显示 (或重绘) 的视频帧
    pub frame: Option<Arc<Frame>>,
    /// 需要叠加显示的字幕
    pub subtitle: Option<Arc<Frame>>,
    /// 建议下次刷新前的等待时间 (秒)
    pub remaining_time: f64,
    /// 本周期丢弃的帧数
    pub dropped: u32,
    /// 所处阶段
    pub phase: SyncPhase,
}

/// 由名义帧间隔与视频/主时钟差值计算目标延迟
///
/// `diff = 视频时钟 - 主时钟`, 以视频为主时传入 NaN.
/// 校正量不超过 `sync_threshold_max`, 差值为 NaN 或超过 `nosync_threshold` 时不校正.
pub fn compute_target_delay(nominal: f64, diff: f64, config: &SyncConfig) -> TargetDelay {
    let sync_threshold = sync_threshold(nominal, config);
    let mut correction = 0.0;
    if !diff.is_nan() && diff.abs() < config.nosync_threshold {
        if diff <= -sync_threshold {
            correction = diff.max(-config.sync_threshold_max);
        } else if diff >= sync_threshold {
            correction = diff.min(config.sync_threshold_max);
        }
    }
    TargetDelay {
        delay: (nominal + correction).max(0.0),
        correction,
    }
}

/// 同步阈值: 名义帧间隔限定在 [min, max] 内
///
/// NaN 间隔取下限.
pub fn sync_threshold(nominal: f64, config: &SyncConfig) -> f64 {
    if nominal.is_nan() {
        return config.sync_threshold_min;
    }
    nominal.clamp(config.sync_threshold_min, config.sync_threshold_max)
}

/// 两相邻帧之间的名义显示间隔
///
/// 串号不同 (跨越 seek) 时为 0; pts 差值无效或超过上限时使用 `vp.duration`.
pub fn frame_duration(lastvp: &Frame, vp: &Frame, max_frame_duration: f64) -> f64 {
    if lastvp.serial != vp.serial {
        return 0.0;
    }
    let duration = vp.pts - lastvp.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        vp.duration
    } else {
        duration
    }
}

/// 视频同步控制器
///
/// 只由视频输出线程驱动.
pub struct SyncController {
    state: Arc<PlaybackState>,
    phase: SyncPhase,
}

impl SyncController {
    /// 创建控制器
    pub fn new(state: Arc<PlaybackState>) -> Self {
        Self {
            state,
            phase: SyncPhase::Idle,
        }
    }

    /// 共享播放状态
    pub fn state(&self) -> &Arc<PlaybackState> {
        &self.state
    }

    /// 最近一次刷新后的阶段
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// 以当前墙钟执行一个刷新周期
    pub fn refresh(&mut self, remaining_time: f64) -> RefreshOutcome {
        self.refresh_at(wall_time(), remaining_time)
    }

    /// 在指定墙钟时刻执行一个刷新周期
    ///
    /// `remaining_time` 为调用方的等待预算, 只会被缩小.
    pub fn refresh_at(&mut self, now: f64, remaining_time: f64) -> RefreshOutcome {
        let state = Arc::clone(&self.state);
        let config = state.config();
        let mut outcome = RefreshOutcome {
            remaining_time,
            ..Default::default()
        };

        if !state.is_paused()
            && state.master_sync_type() == SyncMode::External
            && state.is_realtime()
        {
            state.check_external_clock_speed_at(now);
        }

        if !state.has_video() {
            self.phase = SyncPhase::Idle;
            state.take_refresh();
            return outcome;
        }

        self.phase = SyncPhase::Waiting;
        loop {
            let (Some(vp), Some(lastvp)) = (state.pictq.peek(), state.pictq.peek_last()) else {
                break;
            };

            // seek 之前的帧直接跳过
            if vp.serial != state.videoq.serial() {
                trace!("丢弃过期视频帧: serial={} pts={:.3}", vp.serial, vp.pts);
                state.pictq.next();
                continue;
            }

            let shown = state.pictq.has_shown();
            let discontinuity = !shown || lastvp.serial != vp.serial;
            if discontinuity || state.frame_timer.load().is_nan() {
                if shown {
                    debug!("视频串号变化 {} -> {}, 重置帧计时器", lastvp.serial, vp.serial);
                }
                state.frame_timer.store(now);
            }

            self.phase = SyncPhase::Timing;
            if state.is_paused() {
                break;
            }

            let speed = state.playback_speed();
            let last_duration = if discontinuity {
                0.0
            } else {
                frame_duration(&lastvp, &vp, config.max_frame_duration) / speed
            };
            let master = state.master_sync_type();
            let diff = if master == SyncMode::Video {
                f64::NAN
            } else {
                state.vidclk.get_time_at(now) - state.master_time_at(now)
            };
            let target = compute_target_delay(last_duration, diff, config);

            let frame_timer = state.frame_timer.load();
            if now < frame_timer + target.delay {
                outcome.remaining_time = outcome
                    .remaining_time
                    .min(frame_timer + target.delay - now);
                break;
            }

            let mut frame_timer = frame_timer + target.delay;
            if target.delay > 0.0 && now - frame_timer > config.sync_threshold_max {
                frame_timer = now;
            }
            state.frame_timer.store(frame_timer);

            if !vp.pts.is_nan() && state.vidclk.set_at(vp.pts, vp.serial, now) {
                state
                    .extclk
                    .sync_to_slave_at(&state.vidclk, config.nosync_threshold, now);
            }

            if let Some(nextvp) = state.pictq.peek_next() {
                if config.framedrop && !state.is_stepping() && master != SyncMode::Video {
                    let duration = frame_duration(&vp, &nextvp, config.max_frame_duration) / speed;
                    let next_due_passed = now > frame_timer + duration;
                    let lag = vp.pts - state.master_time_at(now);
                    let lags_master = !lag.is_nan()
                        && lag.abs() < config.nosync_threshold
                        && lag <= -sync_threshold(duration, config);
                    if next_due_passed || lags_master {
                        state.count_late_drop();
                        outcome.dropped += 1;
                        trace!(
                            "丢帧: pts={:.3} lag={:.3} 累计={}",
                            vp.pts,
                            lag,
                            state.frame_drops_late()
                        );
                        state.pictq.next();
                        continue;
                    }
                }
            }

            self.retire_subtitles();
            state.pictq.next();
            state.request_refresh();
            if state.is_stepping() && !state.is_paused() {
                state.stream_toggle_pause_at(now);
            }
            break;
        }

        if outcome.dropped > 0 {
            debug!(
                "本周期丢弃 {} 帧, 累计 {}",
                outcome.dropped,
                state.frame_drops_late()
            );
        }

        if state.take_refresh() && state.pictq.has_shown() {
            outcome.frame = state.pictq.peek_last();
            outcome.subtitle = self.current_subtitle(outcome.frame.as_deref());
            self.phase = SyncPhase::Displaying;
        }
        outcome.phase = self.phase;
        outcome
    }

    /// 按视频时钟移除过期字幕
    fn retire_subtitles(&self) {
        let state = &self.state;
        if !state.has_subtitle() {
            return;
        }
        let video_pts = state.vidclk.pts();
        while let Some(sp) = state.subpq.peek() {
            let Some(sub) = sp.as_subtitle() else {
                state.subpq.next();
                continue;
            };
            let expired = video_pts > sp.pts + f64::from(sub.end_display_time) / 1000.0;
            let superseded = state.subpq.peek_next().is_some_and(|sp2| {
                let start = sp2
                    .as_subtitle()
                    .map_or(0.0, |s| f64::from(s.start_display_time) / 1000.0);
                video_pts > sp2.pts + start
            });
            if sp.serial != state.subtitleq.serial() || expired || superseded {
                state.subpq.next();
            } else {
                break;
            }
        }
    }

    /// 与视频帧同时显示的字幕
    fn current_subtitle(&self, vp: Option<&Frame>) -> Option<Arc<Frame>> {
        let state = &self.state;
        if !state.has_subtitle() {
            return None;
        }
        let vp = vp?;
        let sp = state.subpq.peek()?;
        let sub = sp.as_subtitle()?;
        (vp.pts >= sp.pts + f64::from(sub.start_display_time) / 1000.0).then_some(sp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SubtitleFrame;

    fn frame(pts: f64, serial: u32) -> Frame {
        let mut f = Frame::subtitle(SubtitleFrame::default(), pts, serial);
        f.duration = 0.04;
        f
    }

    #[test]
    fn test_correction_clamped_to_max_threshold() {
        let config = SyncConfig::default();
        let behind = compute_target_delay(0.04, -0.5, &config);
        assert_eq!(behind.correction, -config.sync_threshold_max);
        assert_eq!(behind.delay, 0.0);

        let ahead = compute_target_delay(0.04, 0.5, &config);
        assert_eq!(ahead.correction, config.sync_threshold_max);
        assert!((ahead.delay - 0.14).abs() < 1e-9);
    }

    #[test]
    fn test_small_diff_keeps_nominal_delay() {
        let config = SyncConfig::default();
        let target = compute_target_delay(0.04, 0.01, &config);
        assert_eq!(target.correction, 0.0);
        assert_eq!(target.delay, 0.04);

        // 校正量在 [-max, max] 内时等于差值
        let target = compute_target_delay(0.04, -0.06, &config);
        assert!((target.correction + 0.06).abs() < 1e-12);
        assert_eq!(target.delay, 0.0);
    }

    #[test]
    fn test_no_correction_beyond_nosync_or_nan() {
        let config = SyncConfig::default();
        assert_eq!(compute_target_delay(0.04, 20.0, &config).delay, 0.04);
        assert_eq!(compute_target_delay(0.04, f64::NAN, &config).delay, 0.04);
    }

    #[test]
    fn test_sync_threshold_clamps_nominal() {
        let config = SyncConfig::default();
        assert_eq!(sync_threshold(0.0, &config), 0.04);
        assert_eq!(sync_threshold(0.066, &config), 0.066);
        assert_eq!(sync_threshold(1.0, &config), 0.1);
    }

    #[test]
    fn test_frame_duration_falls_back_on_jump() {
        let a = frame(1.0, 1);
        assert!((frame_duration(&a, &frame(1.04, 1), 10.0) - 0.04).abs() < 1e-9);
        // 时间戳倒退或跳变时使用帧自身时长
        assert_eq!(frame_duration(&a, &frame(0.5, 1), 10.0), 0.04);
        assert_eq!(frame_duration(&a, &frame(30.0, 1), 10.0), 0.04);
        assert_eq!(frame_duration(&a, &frame(f64::NAN, 1), 10.0), 0.04);
        // 跨越 seek
        assert_eq!(frame_duration(&a, &frame(1.04, 2), 10.0), 0.0);
    }

    #[test]
    fn test_idle_without_video_stream() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        let mut controller = SyncController::new(state);
        let outcome = controller.refresh_at(0.0, 0.01);
        assert_eq!(outcome.phase, SyncPhase::Idle);
        assert!(outcome.frame.is_none());
        assert_eq!(outcome.remaining_time, 0.01);
    }

    #[test]
    fn test_empty_queue_waits() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        state.set_streams(false, true, false);
        let mut controller = SyncController::new(state);
        let outcome = controller.refresh_at(0.0, 0.01);
        assert_eq!(outcome.phase, SyncPhase::Waiting);
        assert!(outcome.frame.is_none());
    }

    #[test]
    fn test_stale_frames_skipped_after_flush() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        state.set_streams(false, true, false);
        let old = state.videoq.serial();
        state.pictq.push(frame(0.0, old)).unwrap();
        state.videoq.flush();
        let new = state.videoq.serial();
        state.pictq.push(frame(7.0, new)).unwrap();

        let mut controller = SyncController::new(Arc::clone(&state));
        let outcome = controller.refresh_at(50.0, 0.01);
        let shown = outcome.frame.expect("应显示新串号的帧");
        assert_eq!(shown.pts, 7.0);
        assert_eq!(shown.serial, new);
        assert_eq!(outcome.dropped, 0);
    }

    #[test]
    fn test_paused_redisplays_only_on_refresh_request() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        state.set_streams(false, true, false);
        let serial = state.videoq.serial();
        for i in 0..3 {
            state.pictq.push(frame(f64::from(i) * 0.04, serial)).unwrap();
        }
        let mut controller = SyncController::new(Arc::clone(&state));
        assert!(controller.refresh_at(10.0, 0.01).frame.is_some());

        state.stream_toggle_pause_at(10.0);
        let outcome = controller.refresh_at(20.0, 0.01);
        assert!(outcome.frame.is_none());
        assert_eq!(state.pictq.nb_remaining(), 2);

        state.request_refresh();
        let outcome = controller.refresh_at(21.0, 0.01);
        assert_eq!(outcome.frame.map(|f| f.pts), Some(0.0));
        assert_eq!(state.pictq.nb_remaining(), 2);
    }

    #[test]
    fn test_no_drop_after_unpause_with_audio_master() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        state.set_streams(true, true, false);
        state.audclk.set_at(0.0, state.audioq.serial(), 100.0);
        let serial = state.videoq.serial();
        for i in 0..3 {
            state.pictq.push(frame(f64::from(i) * 0.04, serial)).unwrap();
        }
        let mut controller = SyncController::new(Arc::clone(&state));
        assert_eq!(controller.refresh_at(100.0, 0.01).frame.map(|f| f.pts), Some(0.0));

        state.stream_toggle_pause_at(100.0);
        state.stream_toggle_pause_at(105.0);
        let outcome = controller.refresh_at(105.05, 0.01);
        assert_eq!(outcome.dropped, 0, "暂停时长不应被当作视频落后");
        assert_eq!(outcome.frame.map(|f| f.pts), Some(0.04));
        assert_eq!(state.frame_drops_late(), 0);
    }

    #[test]
    fn test_double_speed_halves_frame_delay() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        state.set_streams(false, true, false);
        state.set_sync_mode(SyncMode::Video);
        let serial = state.videoq.serial();
        for i in 0..3 {
            state.pictq.push(frame(f64::from(i) * 0.04, serial)).unwrap();
        }
        state.set_playback_speed_at(2.0, 0.0);
        let mut controller = SyncController::new(Arc::clone(&state));
        assert!(controller.refresh_at(10.0, 0.01).frame.is_some());

        let outcome = controller.refresh_at(10.01, 0.05);
        assert!(outcome.frame.is_none());
        assert!((outcome.remaining_time - 0.01).abs() < 1e-9);
        let outcome = controller.refresh_at(10.021, 0.05);
        assert_eq!(outcome.frame.map(|f| f.pts), Some(0.04));
    }

    #[test]
    fn test_step_displays_one_frame_then_pauses() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        state.set_streams(false, true, false);
        let serial = state.videoq.serial();
        for i in 0..3 {
            state.pictq.push(frame(f64::from(i) * 0.04, serial)).unwrap();
        }
        state.stream_toggle_pause_at(0.0);
        state.step_to_next_frame();
        assert!(!state.is_paused());

        let mut controller = SyncController::new(Arc::clone(&state));
        let outcome = controller.refresh_at(1.0, 0.01);
        assert_eq!(outcome.frame.map(|f| f.pts), Some(0.0));
        assert!(state.is_paused());
    }

    #[test]
    fn test_subtitle_retired_after_end_time() {
        let state = Arc::new(PlaybackState::new(SyncConfig::default()));
        state.set_streams(false, true, true);
        let vserial = state.videoq.serial();
        let sserial = state.subtitleq.serial();
        state
            .subpq
            .push(Frame::subtitle(
                SubtitleFrame {
                    start_display_time: 0,
                    end_display_time: 500,
                    text: "第一句".into(),
                },
                0.0,
                sserial,
            ))
            .unwrap();
        state
            .subpq
            .push(Frame::subtitle(
                SubtitleFrame {
                    start_display_time: 0,
                    end_display_time: 500,
                    text: "第二句".into(),
                },
                2.0,
                sserial,
            ))
            .unwrap();
        state.pictq.push(frame(1.0, vserial)).unwrap();

        let mut controller = SyncController::new(Arc::clone(&state));
        let outcome = controller.refresh_at(0.0, 0.01);
        assert_eq!(outcome.frame.map(|f| f.pts), Some(1.0));
        // 第一句在 0.5s 结束, 第二句 2.0s 才开始
        assert!(outcome.subtitle.is_none());
        let current = state.subpq.peek().expect("第二句仍在队列中");
        assert_eq!(current.pts, 2.0);
    }
}
