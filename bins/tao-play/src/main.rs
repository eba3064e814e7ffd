//! # tao-play
//!
//! Tao 音视频同步演示程序.
//!
//! 以合成音视频源驱动 tao-avsync 的完整管线 (读取, 解码, 音频输出, 视频输出),
//! 输出端不依赖声卡与窗口, 运行结束后打印同步统计.

mod logging;
mod sinks;
mod source;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use log::{debug, info, trace, warn};
use tao_avsync::{
    AudioParams, AudioRenderer, AvSyncResult, DecodeWorker, MediaKind, PlaybackState,
    PlayerEvent, SampleFormat, Stage, SyncConfig, SyncController, SyncMode, VideoRenderer,
    run_video_loop,
};

use crate::sinks::{PacedAudioSink, StatsVideoSink};
use crate::source::{PatternDecoder, SourceOptions, ToneDecoder, spawn_source};

/// 主时钟选择
#[derive(Debug, Clone, Copy, ValueEnum)]
enum SyncArg {
    Audio,
    Video,
    Ext,
}

impl From<SyncArg> for SyncMode {
    fn from(arg: SyncArg) -> Self {
        match arg {
            SyncArg::Audio => SyncMode::Audio,
            SyncArg::Video => SyncMode::Video,
            SyncArg::Ext => SyncMode::External,
        }
    }
}

/// Tao 音视频同步演示 (对标 ffplay 的同步行为)
#[derive(Parser)]
#[command(name = "tao-play", version, about = "Tao 音视频同步演示")]
struct Args {
    /// 同步配置文件 (JSON), 缺省字段取默认值
    #[arg(long)]
    config: Option<PathBuf>,

    /// 主时钟类型, 覆盖配置文件
    #[arg(long, value_enum)]
    sync: Option<SyncArg>,

    /// 禁止落后时丢帧
    #[arg(long = "noframedrop")]
    no_framedrop: bool,

    /// 禁用音频
    #[arg(long = "noaudio")]
    no_audio: bool,

    /// 禁用视频
    #[arg(long = "novideo")]
    no_video: bool,

    /// 起始位置 (秒)
    #[arg(long = "ss", default_value_t = 0.0)]
    start: f64,

    /// 播放时长 (秒)
    #[arg(short = 't', long, default_value_t = 5.0)]
    duration: f64,

    /// 合成视频帧率
    #[arg(long, default_value_t = 25, value_parser = clap::value_parser!(u32).range(1..=240))]
    fps: u32,

    /// 合成视频宽度
    #[arg(long, default_value_t = 320, value_parser = clap::value_parser!(u32).range(2..=7680))]
    width: u32,

    /// 合成视频高度
    #[arg(long, default_value_t = 240, value_parser = clap::value_parser!(u32).range(2..=4320))]
    height: u32,

    /// 合成音频采样率
    #[arg(long, default_value_t = 48000, value_parser = clap::value_parser!(u32).range(8000..=192000))]
    sample_rate: u32,

    /// 播放速度 (0.25-4.0)
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// 音量 (0-100)
    #[arg(long, default_value_t = 100)]
    volume: u32,

    /// 静音启动
    #[arg(long)]
    mute: bool,

    /// 详细输出 (-v: debug, -vv: tao trace, -vvv: 全局 trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Worker {
    stage: Stage,
    handle: JoinHandle<AvSyncResult<u64>>,
}

fn spawn_worker<F>(stage: Stage, f: F) -> Result<Worker>
where
    F: FnOnce() -> AvSyncResult<u64> + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(stage.to_string())
        .spawn(f)
        .with_context(|| format!("创建 {stage} 线程失败"))?;
    Ok(Worker { stage, handle })
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("加载配置失败: {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(sync) = args.sync {
        config.sync_mode = sync.into();
    }
    if args.no_framedrop {
        config.framedrop = false;
    }
    config.validate().context("配置无效")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init("tao-play", args.verbose)?;

    if args.no_audio && args.no_video {
        bail!("音频与视频不能同时禁用");
    }
    if !(args.duration > 0.0) {
        bail!("播放时长必须为正: {}", args.duration);
    }

    let config = load_config(&args)?;
    info!(
        "同步配置: sync={} framedrop={} threshold=[{}, {}]",
        config.sync_mode, config.framedrop, config.sync_threshold_min, config.sync_threshold_max
    );

    let (event_tx, event_rx) = mpsc::channel();
    let state = Arc::new(PlaybackState::new(config).with_events(event_tx));
    state.set_streams(!args.no_audio, !args.no_video, false);
    state.set_muted(args.mute);
    if args.speed != 1.0 {
        state.set_playback_speed(args.speed);
    }
    if args.start > 0.0 {
        state.seek(args.start, 0.0);
    }

    let opts = SourceOptions {
        fps: args.fps,
        width: args.width,
        height: args.height,
        sample_rate: args.sample_rate,
        audio: !args.no_audio,
        video: !args.no_video,
    };

    let mut workers = vec![Worker {
        stage: Stage::Read,
        handle: spawn_source(Arc::clone(&state), opts).context("创建读取线程失败")?,
    }];

    if opts.audio {
        let output = AudioParams::new(args.sample_rate, 2, SampleFormat::S16);
        let mut renderer =
            AudioRenderer::new(Arc::clone(&state), PacedAudioSink::new(&output), output)
                .context("打开音频输出失败")?;
        renderer.volume().set(args.volume.min(100) as f32 / 100.0);

        let decode_state = Arc::clone(&state);
        workers.push(spawn_worker(Stage::AudioDecode, move || {
            let mut worker = DecodeWorker::new(decode_state, MediaKind::Audio);
            worker.run(&mut ToneDecoder::new(opts.sample_rate))?;
            Ok(worker.frames_decoded())
        })?);
        workers.push(spawn_worker(Stage::AudioRender, move || {
            renderer.run()?;
            Ok(renderer.bytes_written())
        })?);
    }

    if opts.video {
        let decode_state = Arc::clone(&state);
        workers.push(spawn_worker(Stage::VideoDecode, move || {
            let mut worker = DecodeWorker::new(decode_state, MediaKind::Video);
            worker.run(&mut PatternDecoder::new(opts.width, opts.height))?;
            Ok(worker.frames_decoded())
        })?);
        let render_state = Arc::clone(&state);
        workers.push(spawn_worker(Stage::VideoRender, move || {
            let mut controller = SyncController::new(render_state);
            let mut renderer = VideoRenderer::new(StatsVideoSink::default());
            run_video_loop(&mut controller, &mut renderer)?;
            debug!("最大显示间隔: {:.3}s", renderer.sink().max_gap());
            Ok(renderer.frames_rendered())
        })?);
    }

    // 事件循环: 到时或任一阶段失败后停止
    let deadline = Instant::now() + Duration::from_secs_f64(args.duration);
    let mut last_report = f64::NEG_INFINITY;
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        if timeout.is_zero() {
            break;
        }
        match event_rx.recv_timeout(timeout.min(Duration::from_millis(100))) {
            Ok(PlayerEvent::PlayTime(t)) => {
                if t - last_report >= 1.0 {
                    info!("播放位置: {:.2}s", t);
                    last_report = t;
                }
            }
            Ok(PlayerEvent::Stopped {
                stage,
                error: Some(e),
            }) => {
                warn!("{} 异常退出: {}", stage, e);
                break;
            }
            Ok(PlayerEvent::AudioData(data)) => {
                trace!("音频数据: pts={:.3} {} 字节", data.pts, data.pcm.len());
            }
            Ok(event) => debug!("事件: {:?}", event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    state.abort();

    let mut failed = None;
    for worker in workers {
        match worker.handle.join() {
            Ok(Ok(count)) => info!("{}: 完成, 计数={}", worker.stage, count),
            Ok(Err(e)) => {
                warn!("{}: {}", worker.stage, e);
                failed.get_or_insert_with(|| format!("{} 失败: {}", worker.stage, e));
            }
            Err(_) => {
                failed.get_or_insert_with(|| format!("{} 线程 panic", worker.stage));
            }
        }
    }

    info!(
        "同步统计: audclk={:.3}s vidclk={:.3}s 显示阶段丢帧={} 解码阶段丢帧={}",
        state.audclk.pts(),
        state.vidclk.pts(),
        state.frame_drops_late(),
        state.frame_drops_early()
    );
    match failed {
        Some(msg) => bail!(msg),
        None => Ok(()),
    }
}
