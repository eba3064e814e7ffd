//! 解码阶段.
//!
//! 同步引擎不实现解码算法, 只规定解码协作方的接口与驱动方式:
//! 从数据包队列取包, 丢弃过期串号, 串号变化时刷新解码器,
//! 把产出的帧打上数据包串号后写入帧队列.

use std::sync::Arc;

use log::{debug, info, trace, warn};

use crate::clock::SyncMode;
use crate::error::{AvSyncError, AvSyncResult};
use crate::frame::Frame;
use crate::packet_queue::CodedPacket;
use crate::state::{MediaKind, PlaybackState, PlayerEvent, Stage};

/// 解码器接口
///
/// 解码流程:
/// 1. 调用 `send_packet()` 送入压缩数据
/// 2. 循环调用 `receive_frame()` 直到返回 `None`
/// 3. seek 后调用 `flush()` 清空内部状态
pub trait FrameDecoder: Send {
    /// 送入一个压缩数据包
    fn send_packet(&mut self, packet: &CodedPacket) -> AvSyncResult<()>;

    /// 取出一帧; `None` 表示需要更多数据
    fn receive_frame(&mut self) -> AvSyncResult<Option<Frame>>;

    /// 清空内部缓存
    fn flush(&mut self);
}

/// 解码工作线程主体
pub struct DecodeWorker {
    state: Arc<PlaybackState>,
    kind: MediaKind,
    pkt_serial: Option<u32>,
    frames_decoded: u64,
}

impl DecodeWorker {
    /// 创建指定流的解码工作者
    pub fn new(state: Arc<PlaybackState>, kind: MediaKind) -> Self {
        Self {
            state,
            kind,
            pkt_serial: None,
            frames_decoded: 0,
        }
    }

    /// 已写入帧队列的帧数
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// 运行解码循环直到中止, 退出时发送停止事件
    pub fn run<D: FrameDecoder>(&mut self, decoder: &mut D) -> AvSyncResult<()> {
        let stage = Stage::decode_of(self.kind);
        debug!("{} 启动", stage);
        let result = match self.decode_loop(decoder) {
            Err(AvSyncError::QueueAborted) => Ok(()),
            other => other,
        };
        match &result {
            Ok(()) => info!("{} 结束, 共解码 {} 帧", stage, self.frames_decoded),
            Err(e) => warn!("{} 失败: {}", stage, e),
        }
        self.state.emit(PlayerEvent::Stopped {
            stage,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    fn decode_loop<D: FrameDecoder>(&mut self, decoder: &mut D) -> AvSyncResult<()> {
        let state = Arc::clone(&self.state);
        let packets = state.packet_queue(self.kind);
        let frames = state.frame_queue(self.kind);
        loop {
            let Some(packet) = packets.pop(true)? else {
                continue;
            };
            if packet.serial != packets.serial() {
                trace!(
                    "{}: 丢弃过期数据包 serial={} 当前={}",
                    packets.name(),
                    packet.serial,
                    packets.serial()
                );
                continue;
            }
            if self.pkt_serial != Some(packet.serial) {
                if self.pkt_serial.is_some() {
                    debug!("{}: 串号变化, 刷新解码器", packets.name());
                    decoder.flush();
                }
                self.pkt_serial = Some(packet.serial);
            }

            decoder.send_packet(&packet)?;
            while let Some(mut frame) = decoder.receive_frame()? {
                frame.serial = packet.serial;
                if frame.pts.is_nan() {
                    frame.pts = packet.pts;
                }
                if frame.pos < 0 {
                    frame.pos = packet.pos;
                }
                if self.kind == MediaKind::Video && self.should_drop_early(&frame) {
                    state.count_early_drop();
                    trace!("解码后提前丢帧: pts={:.3}", frame.pts);
                    continue;
                }
                frames.push(frame)?;
                self.frames_decoded += 1;
            }
        }
    }

    /// 帧已落后于主时钟且仍有后续数据包时, 不进入帧队列
    fn should_drop_early(&self, frame: &Frame) -> bool {
        let state = &self.state;
        let config = state.config();
        if !config.framedrop || state.master_sync_type() == SyncMode::Video {
            return false;
        }
        if frame.pts.is_nan() {
            return false;
        }
        let diff = frame.pts - state.master_clock().get_time();
        !diff.is_nan()
            && diff.abs() < config.nosync_threshold
            && diff < 0.0
            && frame.serial == state.vidclk.serial()
            && state.videoq.nb_packets() > 0
    }
}
