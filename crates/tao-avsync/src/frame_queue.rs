//! 解码帧环形队列.
//!
//! 固定容量的帧槽位数组, 读写游标按容量取模回绕.
//! `keep_last` 模式 (视频/字幕) 下, 最近显示过的帧继续保留在读游标处,
//! 作为计算帧间隔与重绘的参考.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{AvSyncError, AvSyncResult};
use crate::frame::Frame;
use crate::{lock, wait};

/// 视频帧队列默认容量
pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
/// 音频帧队列默认容量
pub const SAMPLE_QUEUE_SIZE: usize = 9;
/// 字幕帧队列默认容量
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;

struct Ring {
    slots: Vec<Option<Arc<Frame>>>,
    rindex: usize,
    windex: usize,
    size: usize,
    /// 读游标处的帧是否已显示过 (0 或 1)
    rindex_shown: usize,
}

impl Ring {
    fn slot(&self, offset: usize) -> Option<Arc<Frame>> {
        let max = self.slots.len();
        self.slots[(self.rindex + offset) % max].clone()
    }

    fn remaining(&self) -> usize {
        self.size - self.rindex_shown
    }
}

/// 解码帧队列 (线程安全)
pub struct FrameQueue {
    ring: Mutex<Ring>,
    cond: Condvar,
    max_size: usize,
    keep_last: bool,
    abort: AtomicBool,
}

impl FrameQueue {
    /// 创建帧队列
    ///
    /// `max_size` 至少为 1.
    pub fn new(max_size: usize, keep_last: bool) -> Self {
        let max_size = max_size.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: vec![None; max_size],
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            max_size,
            keep_last,
            abort: AtomicBool::new(false),
        }
    }

    /// 容量
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// 写入一帧, 队列满时阻塞
    pub fn push(&self, frame: Frame) -> AvSyncResult<()> {
        let mut ring = lock(&self.ring);
        while ring.size >= self.max_size && !self.is_aborted() {
            ring = wait(&self.cond, ring);
        }
        if self.is_aborted() {
            return Err(AvSyncError::QueueAborted);
        }
        let windex = ring.windex;
        ring.slots[windex] = Some(Arc::new(frame));
        ring.windex = (windex + 1) % self.max_size;
        ring.size += 1;
        drop(ring);
        self.cond.notify_all();
        Ok(())
    }

    /// 下一帧待显示帧 (不前移), 无可读帧时阻塞
    pub fn peek_readable(&self) -> AvSyncResult<Arc<Frame>> {
        let mut ring = lock(&self.ring);
        loop {
            if self.is_aborted() {
                return Err(AvSyncError::QueueAborted);
            }
            if ring.remaining() > 0 {
                let shown = ring.rindex_shown;
                if let Some(frame) = ring.slot(shown) {
                    return Ok(frame);
                }
            }
            ring = wait(&self.cond, ring);
        }
    }

    /// 下一帧待显示帧 (非阻塞)
    pub fn peek(&self) -> Option<Arc<Frame>> {
        let ring = lock(&self.ring);
        if ring.remaining() == 0 {
            return None;
        }
        ring.slot(ring.rindex_shown)
    }

    /// 当前帧之后的一帧
    pub fn peek_next(&self) -> Option<Arc<Frame>> {
        let ring = lock(&self.ring);
        if ring.remaining() < 2 {
            return None;
        }
        ring.slot(ring.rindex_shown + 1)
    }

    /// 最近显示的帧
    ///
    /// 尚无帧显示过时与 `peek()` 返回同一帧.
    pub fn peek_last(&self) -> Option<Arc<Frame>> {
        let ring = lock(&self.ring);
        if ring.size == 0 {
            return None;
        }
        ring.slot(0)
    }

    /// 前移读游标, 释放已消费的帧并唤醒写端
    pub fn next(&self) {
        let mut ring = lock(&self.ring);
        if ring.size == 0 {
            return;
        }
        if self.keep_last && ring.rindex_shown == 0 {
            ring.rindex_shown = 1;
            return;
        }
        let rindex = ring.rindex;
        ring.slots[rindex] = None;
        ring.rindex = (rindex + 1) % self.max_size;
        ring.size -= 1;
        drop(ring);
        self.cond.notify_all();
    }

    /// 尚未显示的帧数
    pub fn nb_remaining(&self) -> usize {
        lock(&self.ring).remaining()
    }

    /// 队列中的帧数 (含保留的已显示帧)
    pub fn size(&self) -> usize {
        lock(&self.ring).size
    }

    /// 是否有帧显示过 (读游标处的帧被保留)
    pub fn has_shown(&self) -> bool {
        lock(&self.ring).rindex_shown > 0
    }

    /// 最近显示帧的字节位置, 串号不匹配时返回 None
    pub fn last_pos(&self, serial: u32) -> Option<i64> {
        let ring = lock(&self.ring);
        if ring.rindex_shown == 0 {
            return None;
        }
        ring.slot(0)
            .filter(|f| f.serial == serial && f.pos >= 0)
            .map(|f| f.pos)
    }

    /// 中止队列, 唤醒所有等待者
    pub fn abort(&self) {
        let _ring = lock(&self.ring);
        self.abort.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// 是否已中止
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SubtitleFrame;
    use std::thread;
    use std::time::Duration;

    fn frame(pts: f64, serial: u32) -> Frame {
        Frame::subtitle(SubtitleFrame::default(), pts, serial)
    }

    #[test]
    fn test_fifo_order_without_keep_last() {
        let q = FrameQueue::new(4, false);
        for i in 0..4 {
            q.push(frame(i as f64, 0)).unwrap();
        }
        for i in 0..4 {
            let f = q.peek_readable().unwrap();
            assert_eq!(f.pts, i as f64);
            q.next();
        }
        assert_eq!(q.size(), 0);
        assert!(q.peek().is_none());
    }

    #[test]
    fn test_size_stays_within_bounds_under_wraparound() {
        let q = FrameQueue::new(3, false);
        let mut expected = 0.0;
        let mut produced = 0.0;
        for round in 0..10 {
            let burst = round % 3 + 1;
            for _ in 0..burst {
                if q.size() < q.max_size() {
                    q.push(frame(produced, 0)).unwrap();
                    produced += 1.0;
                }
                assert!(q.size() <= q.max_size());
            }
            while let Some(f) = q.peek() {
                assert_eq!(f.pts, expected);
                expected += 1.0;
                q.next();
            }
            assert_eq!(q.size(), 0);
            // 空队列上的 next 不得下溢
            q.next();
            assert_eq!(q.size(), 0);
        }
    }

    #[test]
    fn test_keep_last_retains_shown_frame() {
        let q = FrameQueue::new(3, true);
        q.push(frame(0.0, 1)).unwrap();
        q.push(frame(0.04, 1)).unwrap();

        // 尚未显示: last 与当前帧相同
        assert_eq!(q.peek_last().unwrap().pts, 0.0);
        assert_eq!(q.peek().unwrap().pts, 0.0);
        assert!(!q.has_shown());

        q.next();
        assert!(q.has_shown());
        assert_eq!(q.size(), 2);
        assert_eq!(q.nb_remaining(), 1);
        assert_eq!(q.peek_last().unwrap().pts, 0.0);
        assert_eq!(q.peek().unwrap().pts, 0.04);
        assert!(q.peek_next().is_none());

        q.next();
        assert_eq!(q.size(), 1);
        assert_eq!(q.nb_remaining(), 0);
        assert_eq!(q.peek_last().unwrap().pts, 0.04);
        assert!(q.peek().is_none());
    }

    #[test]
    fn test_peek_next_returns_following_frame() {
        let q = FrameQueue::new(3, false);
        q.push(frame(1.0, 0)).unwrap();
        assert!(q.peek_next().is_none());
        q.push(frame(2.0, 0)).unwrap();
        assert_eq!(q.peek_next().unwrap().pts, 2.0);
    }

    #[test]
    fn test_last_pos_checks_serial() {
        let q = FrameQueue::new(3, true);
        q.push(frame(0.0, 2).with_pos(1234)).unwrap();
        assert_eq!(q.last_pos(2), None);
        q.next();
        assert_eq!(q.last_pos(2), Some(1234));
        assert_eq!(q.last_pos(3), None);
    }

    #[test]
    fn test_full_push_blocks_until_next() {
        let q = Arc::new(FrameQueue::new(1, false));
        q.push(frame(0.0, 0)).unwrap();
        let writer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(frame(1.0, 0)))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.size(), 1);
        q.next();
        writer.join().unwrap().unwrap();
        assert_eq!(q.peek().unwrap().pts, 1.0);
    }

    #[test]
    fn test_abort_wakes_peek_readable() {
        let q = Arc::new(FrameQueue::new(3, false));
        let reader = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.peek_readable())
        };
        thread::sleep(Duration::from_millis(30));
        q.abort();
        assert!(matches!(
            reader.join().unwrap(),
            Err(AvSyncError::QueueAborted)
        ));
    }
}
