//! 媒体时钟模块.
//!
//! 每条流 (音频/视频/外部) 各有一个时钟. 时钟记录最近一次锚点
//! (`pts`, `pts_drift`, `last_updated`), 读取时按墙钟连续外推.
//! 全部字段为原子量, 渲染热路径上无需加锁.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// 进程内单调时间基准
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 单调墙钟时间 (秒)
pub fn wall_time() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// 以位模式存放在 `AtomicU64` 中的 f64
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

impl fmt::Debug for AtomicF64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.load())
    }
}

/// 主时钟类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// 以音频时钟为主 (默认)
    #[default]
    Audio,
    /// 以视频时钟为主
    Video,
    /// 以外部 (墙钟) 时钟为主
    External,
}

impl SyncMode {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Audio => 0,
            Self::Video => 1,
            Self::External => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Video,
            2 => Self::External,
            _ => Self::Audio,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::External => "external",
        };
        write!(f, "{name}")
    }
}

/// 媒体时钟 (线程安全)
pub struct Clock {
    pts: AtomicF64,
    pts_drift: AtomicF64,
    last_updated: AtomicF64,
    speed: AtomicF64,
    serial: AtomicU32,
    paused: AtomicBool,
    /// 所属数据包队列的串号; None 表示时钟自身即为串号来源
    queue_serial: Option<Arc<AtomicU32>>,
}

impl Clock {
    /// 创建跟随数据包队列串号的时钟
    pub fn new(queue_serial: Arc<AtomicU32>) -> Self {
        Self::build(Some(queue_serial))
    }

    /// 创建独立时钟 (外部时钟)
    pub fn standalone() -> Self {
        Self::build(None)
    }

    fn build(queue_serial: Option<Arc<AtomicU32>>) -> Self {
        Self {
            pts: AtomicF64::new(f64::NAN),
            pts_drift: AtomicF64::new(f64::NAN),
            last_updated: AtomicF64::new(0.0),
            speed: AtomicF64::new(1.0),
            serial: AtomicU32::new(u32::MAX),
            paused: AtomicBool::new(false),
            queue_serial,
        }
    }

    /// 当前时间 (秒)
    pub fn get_time(&self) -> f64 {
        self.get_time_at(wall_time())
    }

    /// 指定墙钟时刻的时钟读数
    ///
    /// 串号已过期时返回 NaN; 暂停时返回冻结的 pts.
    pub fn get_time_at(&self, now: f64) -> f64 {
        if !self.is_current() {
            return f64::NAN;
        }
        if self.is_paused() {
            return self.pts.load();
        }
        let speed = self.speed.load();
        let last_updated = self.last_updated.load();
        self.pts_drift.load() + now - (now - last_updated) * (1.0 - speed)
    }

    /// 以当前墙钟设置时钟
    pub fn set(&self, pts: f64, serial: u32) -> bool {
        self.set_at(pts, serial, wall_time())
    }

    /// 在指定墙钟时刻设置时钟
    ///
    /// 串号与所属队列不一致 (seek 之前的帧) 时忽略, 返回 false.
    pub fn set_at(&self, pts: f64, serial: u32, time: f64) -> bool {
        if let Some(queue_serial) = &self.queue_serial {
            if queue_serial.load(Ordering::Acquire) != serial {
                return false;
            }
        }
        self.pts.store(pts);
        self.last_updated.store(time);
        self.pts_drift.store(pts - time);
        self.serial.store(serial, Ordering::Release);
        true
    }

    /// 修改播放速度, 先以当前读数重设锚点以保持连续
    pub fn set_speed(&self, speed: f64) {
        self.set_speed_at(speed, wall_time());
    }

    /// 在指定墙钟时刻修改播放速度
    pub fn set_speed_at(&self, speed: f64, now: f64) {
        let current = self.get_time_at(now);
        self.set_at(current, self.serial(), now);
        self.speed.store(speed);
    }

    /// 若本时钟无效或与 `slave` 相差超过 `threshold`, 则对齐到 `slave`
    pub fn sync_to_slave_at(&self, slave: &Clock, threshold: f64, now: f64) {
        let clock = self.get_time_at(now);
        let slave_clock = slave.get_time_at(now);
        if !slave_clock.is_nan() && (clock.is_nan() || (clock - slave_clock).abs() > threshold) {
            self.set_at(slave_clock, slave.serial(), now);
        }
    }

    /// 暂停/恢复
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// 是否已暂停
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// 最近一次设置的 pts (不外推)
    pub fn pts(&self) -> f64 {
        self.pts.load()
    }

    /// 最近一次设置时的墙钟时间
    pub fn last_updated(&self) -> f64 {
        self.last_updated.load()
    }

    /// 播放速度
    pub fn speed(&self) -> f64 {
        self.speed.load()
    }

    /// 时钟串号
    pub fn serial(&self) -> u32 {
        self.serial.load(Ordering::Acquire)
    }

    /// 串号是否与所属队列一致
    pub fn is_current(&self) -> bool {
        match &self.queue_serial {
            Some(queue_serial) => {
                queue_serial.load(Ordering::Acquire) == self.serial.load(Ordering::Acquire)
            }
            None => true,
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("pts", &self.pts)
            .field("pts_drift", &self.pts_drift)
            .field("last_updated", &self.last_updated)
            .field("speed", &self.speed)
            .field("serial", &self.serial())
            .field("paused", &self.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_clock() -> (Arc<AtomicU32>, Clock) {
        let serial = Arc::new(AtomicU32::new(1));
        let clock = Clock::new(Arc::clone(&serial));
        (serial, clock)
    }

    #[test]
    fn test_unset_clock_reads_nan() {
        let (_, clock) = queue_clock();
        assert!(clock.get_time_at(5.0).is_nan());
        assert!(Clock::standalone().get_time_at(5.0).is_nan());
    }

    #[test]
    fn test_extrapolates_from_anchor() {
        let (_, clock) = queue_clock();
        assert!(clock.set_at(2.0, 1, 100.0));
        assert!((clock.get_time_at(100.0) - 2.0).abs() < 1e-9);
        assert!((clock.get_time_at(100.5) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_stale_serial_rejected() {
        let (serial, clock) = queue_clock();
        assert!(clock.set_at(1.0, 1, 10.0));
        serial.store(2, Ordering::Release);
        // seek 后时钟失效
        assert!(clock.get_time_at(10.0).is_nan());
        assert!(!clock.set_at(5.0, 1, 10.0));
        assert_eq!(clock.pts(), 1.0);
        assert!(clock.set_at(5.0, 2, 10.0));
        assert!((clock.get_time_at(10.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_paused_clock_is_frozen() {
        let (_, clock) = queue_clock();
        clock.set_at(3.0, 1, 0.0);
        clock.set_paused(true);
        assert_eq!(clock.get_time_at(10.0), 3.0);
        clock.set_paused(false);
        assert!((clock.get_time_at(1.0) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_monotonic_for_non_negative_speed() {
        for speed in [0.0, 0.5, 1.0, 1.01, 2.0] {
            let (_, clock) = queue_clock();
            clock.set_at(0.0, 1, 0.0);
            clock.set_speed_at(speed, 0.0);
            let mut last = clock.get_time_at(0.0);
            for step in 1..100 {
                let now = f64::from(step) * 0.013;
                let t = clock.get_time_at(now);
                assert!(t >= last, "speed={speed} 时钟倒退: {t} < {last}");
                last = t;
            }
        }
    }

    #[test]
    fn test_set_speed_preserves_continuity() {
        let (_, clock) = queue_clock();
        clock.set_at(0.0, 1, 0.0);
        let before = clock.get_time_at(2.0);
        clock.set_speed_at(0.5, 2.0);
        assert!((clock.get_time_at(2.0) - before).abs() < 1e-9);
        assert!((clock.get_time_at(4.0) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_sync_to_slave_adopts_slave_when_invalid_or_far() {
        let ext = Clock::standalone();
        let (_, audio) = queue_clock();
        audio.set_at(7.0, 1, 0.0);

        ext.sync_to_slave_at(&audio, 10.0, 0.0);
        assert!((ext.get_time_at(0.0) - 7.0).abs() < 1e-9);

        // 差距在阈值内不调整
        ext.set_at(8.0, 0, 0.0);
        ext.sync_to_slave_at(&audio, 10.0, 0.0);
        assert!((ext.get_time_at(0.0) - 8.0).abs() < 1e-9);

        ext.set_at(30.0, 0, 0.0);
        ext.sync_to_slave_at(&audio, 10.0, 0.0);
        assert!((ext.get_time_at(0.0) - 7.0).abs() < 1e-9);
    }
}
