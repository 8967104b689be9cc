// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 云端融合服务 (Cloud fusion service)
///
/// 子命令:
/// - run:     连续模式, 按间隔处理输入目录中最新的一帧
/// - once:    处理单个图像文件并打印检测结果
/// - watch:   监视输入目录, 新帧到达即处理
/// - command: 向边缘节点发送 stop / resume 指令
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use edgeguard::cloud::operator::{self, OperatorRequest};
use edgeguard::cloud::{watch_directory, FusionService, HttpVisionModel};
use edgeguard::transport::{self, Transport};
use edgeguard::{FusionConfig, Shutdown};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "云端融合服务 - 视觉模型分析与停车指令", long_about = None)]
struct Args {
    /// 配置文件 (TOML), 默认 ~/.config/edgeguard/fusion.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// 连续模式
    Run {
        /// 运行秒数, 不指定则一直运行
        #[arg(long)]
        duration: Option<u64>,
    },
    /// 单帧模式
    Once { image: PathBuf },
    /// 目录监视模式
    Watch {
        #[arg(long)]
        duration: Option<u64>,
    },
    /// 操作员指令
    Command {
        /// stop 或 resume
        kind: String,
        #[arg(long, default_value = "")]
        reason: String,
        /// 目标设备, 默认配置中的 device_id
        #[arg(long)]
        device: Option<String>,
    },
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

/// Cancels `shutdown` after `secs`, if given.
fn stop_after(shutdown: &Shutdown, secs: Option<u64>) {
    if let Some(secs) = secs {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            shutdown.cancel();
        });
    }
}

fn service(cfg: &FusionConfig, transport: Arc<dyn Transport>) -> anyhow::Result<FusionService> {
    let vision = HttpVisionModel::from_config(&cfg.vision).context("failed to create vision model client")?;
    Ok(FusionService::new(cfg.clone(), Box::new(vision), transport))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = FusionConfig::load(args.config.as_deref()).context("failed to load fusion configuration")?;
    cfg.debug |= args.debug;
    init_tracing(cfg.debug);
    cfg.validate().context("invalid fusion configuration")?;

    let transport = transport::connect(&cfg.transport, &cfg.device_id).context("failed to connect transport")?;
    let shutdown = Shutdown::new();
    shutdown.cancel_on_interrupt().context("failed to set Ctrl-C handler")?;

    let result: anyhow::Result<()> = match args.command {
        Cmd::Run { duration } => {
            let svc = service(&cfg, transport.clone())?;
            stop_after(&shutdown, duration);
            svc.run_continuous(&shutdown);
            Ok(())
        }
        Cmd::Once { image } => {
            let svc = service(&cfg, transport.clone())?;
            let outcome = svc
                .process_file(&image)
                .with_context(|| format!("failed to process {}", image.display()))?;
            println!("{}", serde_json::to_string_pretty(&outcome.report)?);
            if let Some(cmd) = outcome.command {
                info!(reason = %cmd.reason, "stop issued");
            }
            Ok(())
        }
        Cmd::Watch { duration } => {
            let svc = service(&cfg, transport.clone())?;
            let poll = Duration::from_millis(cfg.frames.poll_ms);
            let (rx, watcher) = watch_directory(cfg.frames.dir.clone(), poll, shutdown.clone())
                .context("failed to watch frame directory")?;
            stop_after(&shutdown, duration);
            svc.run_notifications(rx, &shutdown);
            shutdown.cancel();
            let _ = watcher.join();
            Ok(())
        }
        Cmd::Command { kind, reason, device } => {
            let req = OperatorRequest {
                command: kind,
                reason,
                device_id: device.unwrap_or_else(|| cfg.device_id.clone()),
            };
            let resp = operator::send_command(transport.as_ref(), &cfg.topic_prefix, &req);
            println!("{}", serde_json::to_string(&resp)?);
            match resp.error {
                Some(e) if !resp.success => bail!("command rejected: {e}"),
                _ => Ok(()),
            }
        }
    };

    transport.disconnect();
    result
}
