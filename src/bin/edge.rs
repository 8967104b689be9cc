// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 边缘节点 (Edge node)
///
/// 系统架构:
/// 1. 采集线程: 帧源 → 帧缓冲
/// 2. 检测线程: 限速推理 → 检测通道
/// 3. 上报线程: 检测通道 → MQTT
/// 4. 指令线程: MQTT 指令 → 安全状态
/// 5. 主线程:   视频外发进程监管, 等待退出
use anyhow::Context;
use clap::Parser;
use edgeguard::config::{SourceKind, Sharing};
use edgeguard::{EdgeConfig, EdgePipeline};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// 边缘节点参数
#[derive(Parser, Debug)]
#[command(author, version, about = "边缘节点 - 目标检测上报与安全指令", long_about = None)]
struct Args {
    /// 配置文件 (TOML), 默认 ~/.config/edgeguard/edge.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 帧源类型
    #[arg(long, value_enum)]
    source: Option<SourceKind>,

    /// RTSP 地址
    #[arg(long)]
    url: Option<String>,

    /// 视频文件或图像目录
    #[arg(long)]
    path: Option<PathBuf>,

    /// 写出带检测框的预览图
    #[arg(long)]
    display: bool,

    /// 关闭本地检测
    #[arg(long)]
    no_yolo: bool,

    /// 帧缓冲与检测通道的交接方式
    #[arg(long, value_enum)]
    sharing: Option<Sharing>,

    /// 不启动视频外发
    #[arg(long)]
    no_egress: bool,

    #[arg(long)]
    debug: bool,

    /// 运行秒数, 不指定则运行到帧源结束
    #[arg(long)]
    duration: Option<u64>,
}

fn apply(args: &Args, cfg: &mut EdgeConfig) {
    if let Some(kind) = args.source {
        cfg.source.kind = kind;
    }
    if let Some(url) = &args.url {
        cfg.source.url = url.clone();
    }
    if let Some(path) = &args.path {
        cfg.source.path = path.clone();
    }
    if let Some(sharing) = args.sharing {
        cfg.pipeline.frame_sharing = sharing;
        cfg.pipeline.detection_sharing = sharing;
    }
    cfg.pipeline.display |= args.display;
    cfg.pipeline.yolo_enabled &= !args.no_yolo;
    cfg.egress.enabled &= !args.no_egress;
    cfg.debug |= args.debug;
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = EdgeConfig::load(args.config.as_deref()).context("failed to load edge configuration")?;
    apply(&args, &mut cfg);
    init_tracing(cfg.debug);

    info!("🚀 边缘节点启动");
    info!(
        device = %cfg.device_id,
        source = ?cfg.source.kind,
        yolo = cfg.pipeline.yolo_enabled,
        display = cfg.pipeline.display,
        egress = cfg.egress.enabled,
        "configuration"
    );

    let mut pipeline = EdgePipeline::start(cfg).context("failed to start edge pipeline")?;
    pipeline
        .shutdown_signal()
        .cancel_on_interrupt()
        .context("failed to set Ctrl-C handler")?;

    // ========== 安全状态日志 ==========
    let transitions = pipeline.safety().watch();
    std::thread::Builder::new()
        .name("edgeguard-safety-log".to_string())
        .spawn(move || {
            for state in transitions {
                let reason = state.last_command.as_ref().map(|c| c.reason.as_str()).unwrap_or("");
                if state.is_stopped() {
                    warn!(reason, "🛑 vehicle STOPPED");
                } else {
                    info!(reason, "✅ vehicle RUNNING");
                }
            }
        })
        .context("failed to spawn safety log thread")?;

    pipeline.wait(args.duration.map(Duration::from_secs));
    let stats = pipeline.shutdown();
    info!(?stats, "edge node exited");
    Ok(())
}
