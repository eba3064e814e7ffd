//! 压缩数据包队列.
//!
//! 带串号 (serial) 的 FIFO. 每次 flush 都会使串号递增,
//! 消费者凭串号比较识别并丢弃 seek 之前的数据.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;
use log::{debug, trace};

use crate::error::{AvSyncError, AvSyncResult};
use crate::{lock, wait};

/// 每个数据包在容量统计中的额外开销 (字节)
const PACKET_OVERHEAD: usize = std::mem::size_of::<CodedPacket>();

/// 压缩数据包
///
/// 数据对同步引擎不透明, 由解码协作方解释.
#[derive(Debug, Clone)]
pub struct CodedPacket {
    /// 压缩数据
    pub data: Bytes,
    /// 所属流索引
    pub stream_index: usize,
    /// 显示时间戳 (秒), NaN 表示未知
    pub pts: f64,
    /// 时长 (秒)
    pub duration: f64,
    /// 在输入中的字节位置 (-1 表示未知)
    pub pos: i64,
    /// 入队时的队列串号
    pub serial: u32,
}

impl CodedPacket {
    /// 从数据创建数据包
    pub fn new(data: impl Into<Bytes>, stream_index: usize) -> Self {
        Self {
            data: data.into(),
            stream_index,
            pts: f64::NAN,
            duration: 0.0,
            pos: -1,
            serial: 0,
        }
    }

    /// 设置时间信息
    pub fn with_timing(mut self, pts: f64, duration: f64) -> Self {
        self.pts = pts;
        self.duration = duration;
        self
    }

    /// 设置字节位置
    pub fn with_pos(mut self, pos: i64) -> Self {
        self.pos = pos;
        self
    }

    /// 数据大小 (字节)
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

struct QueueInner {
    packets: VecDeque<CodedPacket>,
    /// 数据字节数 + 每包开销
    size: usize,
    /// 队列中数据包总时长 (秒)
    duration: f64,
}

/// 压缩数据包队列 (线程安全)
pub struct PacketQueue {
    name: &'static str,
    inner: Mutex<QueueInner>,
    cond: Condvar,
    /// 仅在持锁时修改, 允许无锁读取
    serial: Arc<AtomicU32>,
    abort: AtomicBool,
}

impl PacketQueue {
    /// 创建空队列
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(QueueInner {
                packets: VecDeque::new(),
                size: 0,
                duration: 0.0,
            }),
            cond: Condvar::new(),
            serial: Arc::new(AtomicU32::new(0)),
            abort: AtomicBool::new(false),
        }
    }

    /// 队列名称 (日志用)
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 追加数据包, 打上当前串号并唤醒等待者
    pub fn push(&self, mut packet: CodedPacket) -> AvSyncResult<()> {
        let mut inner = lock(&self.inner);
        if self.abort.load(Ordering::Acquire) {
            return Err(AvSyncError::QueueAborted);
        }
        packet.serial = self.serial.load(Ordering::Acquire);
        inner.size += packet.size() + PACKET_OVERHEAD;
        if packet.duration.is_finite() {
            inner.duration += packet.duration;
        }
        inner.packets.push_back(packet);
        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    /// 取出队首数据包
    ///
    /// - `block = true`: 队列为空时等待, 中止时返回 `QueueAborted`
    /// - `block = false`: 队列为空时立即返回 `Ok(None)`
    pub fn pop(&self, block: bool) -> AvSyncResult<Option<CodedPacket>> {
        let mut inner = lock(&self.inner);
        loop {
            if self.abort.load(Ordering::Acquire) {
                return Err(AvSyncError::QueueAborted);
            }
            if let Some(packet) = inner.packets.pop_front() {
                inner.size = inner.size.saturating_sub(packet.size() + PACKET_OVERHEAD);
                if packet.duration.is_finite() {
                    inner.duration -= packet.duration;
                }
                if inner.packets.is_empty() {
                    inner.duration = 0.0;
                }
                return Ok(Some(packet));
            }
            if !block {
                return Ok(None);
            }
            inner = wait(&self.cond, inner);
        }
    }

    /// 清空队列并递增串号
    pub fn flush(&self) {
        let mut inner = lock(&self.inner);
        let dropped = inner.packets.len();
        inner.packets.clear();
        inner.size = 0;
        inner.duration = 0.0;
        let serial = self.serial.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        drop(inner);
        self.cond.notify_all();
        debug!("{}: flush, 丢弃 {} 个数据包, serial={}", self.name, dropped, serial);
    }

    /// 中止队列, 唤醒所有等待者
    pub fn abort(&self) {
        let _inner = lock(&self.inner);
        self.abort.store(true, Ordering::Release);
        self.cond.notify_all();
        trace!("{}: abort", self.name);
    }

    /// 重新启用队列 (清除中止标记并开始新一代串号)
    pub fn start(&self) {
        let _inner = lock(&self.inner);
        self.abort.store(false, Ordering::Release);
        self.serial.fetch_add(1, Ordering::AcqRel);
    }

    /// 是否已中止
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// 当前串号 (无锁读取)
    pub fn serial(&self) -> u32 {
        self.serial.load(Ordering::Acquire)
    }

    /// 共享的串号句柄, 供时钟判断自身是否过期
    pub fn serial_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.serial)
    }

    /// 队列中数据包数量
    pub fn nb_packets(&self) -> usize {
        lock(&self.inner).packets.len()
    }

    /// 队列占用字节数 (含每包开销)
    pub fn size(&self) -> usize {
        lock(&self.inner).size
    }

    /// 队列中数据包总时长 (秒)
    pub fn duration(&self) -> f64 {
        lock(&self.inner).duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn packet(byte: u8) -> CodedPacket {
        CodedPacket::new(vec![byte; 4], 0).with_timing(f64::from(byte) * 0.04, 0.04)
    }

    #[test]
    fn test_push_pop_fifo_and_counters() {
        let q = PacketQueue::new("test");
        q.push(packet(1)).unwrap();
        q.push(packet(2)).unwrap();
        assert_eq!(q.nb_packets(), 2);
        assert_eq!(q.size(), 2 * (4 + PACKET_OVERHEAD));
        assert!((q.duration() - 0.08).abs() < 1e-9);

        let first = q.pop(false).unwrap().unwrap();
        assert_eq!(first.data[0], 1);
        let second = q.pop(false).unwrap().unwrap();
        assert_eq!(second.data[0], 2);
        assert!(q.pop(false).unwrap().is_none());
        assert_eq!(q.size(), 0);
        assert_eq!(q.duration(), 0.0);
    }

    #[test]
    fn test_flush_bumps_serial_and_tags_new_packets() {
        let q = PacketQueue::new("test");
        q.push(packet(1)).unwrap();
        let old_serial = q.serial();
        q.flush();
        assert_eq!(q.nb_packets(), 0);
        assert_eq!(q.serial(), old_serial + 1);

        q.push(packet(2)).unwrap();
        let pkt = q.pop(false).unwrap().unwrap();
        assert_eq!(pkt.serial, q.serial());
    }

    #[test]
    fn test_push_after_abort_fails() {
        let q = PacketQueue::new("test");
        q.abort();
        assert!(matches!(q.push(packet(1)), Err(AvSyncError::QueueAborted)));
        q.start();
        assert!(q.push(packet(1)).is_ok());
    }

    #[test]
    fn test_abort_wakes_blocked_pop() {
        let q = Arc::new(PacketQueue::new("test"));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let start = Instant::now();
                let result = q.pop(true);
                (result, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        q.abort();
        let (result, elapsed) = consumer.join().unwrap();
        assert!(matches!(result, Err(AvSyncError::QueueAborted)));
        assert!(elapsed < Duration::from_secs(2), "阻塞 pop 未及时返回");
    }

    #[test]
    fn test_blocked_pop_receives_pushed_packet() {
        let q = Arc::new(PacketQueue::new("test"));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop(true))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(packet(7)).unwrap();
        let pkt = consumer.join().unwrap().unwrap().unwrap();
        assert_eq!(pkt.data[0], 7);
    }
}
