// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 外发策略 → 子进程命令行 (strategy command lines)

use super::credentials::Credentials;
use super::launcher::LaunchSpec;
use crate::config::{EgressConfig, SourceConfig, SourceKind, StrategyKind};

const GST_LAUNCH: &str = "gst-launch-1.0";
const SAMPLE_BINARY: &str = "kvs_gstreamer_sample";
const H264_CAPS: &str = "video/x-h264,stream-format=avc,alignment=au";

fn kvssink(cfg: &EgressConfig) -> Vec<String> {
    vec![
        "kvssink".to_string(),
        format!("stream-name={}", cfg.stream_name),
        format!("storage-size={}", cfg.storage_size_mb),
        format!("max-latency={}", cfg.max_latency_ms),
        format!("fragment-duration={}", cfg.fragment_duration_ms),
        "key-frame-fragmentation=true".to_string(),
    ]
}

/// Producer library path, region, log level, plugin path and credentials.
fn base_env(cfg: &EgressConfig, creds: &Credentials) -> Vec<(String, String)> {
    let producer = cfg.producer_path.display().to_string();
    let ld_path = match std::env::var("LD_LIBRARY_PATH") {
        Ok(existing) if !existing.is_empty() => format!("{producer}:{existing}"),
        _ => producer.clone(),
    };
    let mut env = vec![
        ("LD_LIBRARY_PATH".to_string(), ld_path),
        ("AWS_DEFAULT_REGION".to_string(), cfg.region.clone()),
        ("GST_DEBUG".to_string(), cfg.gst_debug.to_string()),
        ("GST_PLUGIN_PATH".to_string(), producer),
    ];
    env.extend(creds.env());
    env
}

fn rtsp_url(source: &SourceConfig) -> Result<&str, String> {
    match source.kind {
        SourceKind::Rtsp if !source.url.is_empty() => Ok(&source.url),
        _ => Err("requires an rtsp source".to_string()),
    }
}

/// Command line for `kind`, or why it cannot run against this source.
pub fn build(
    kind: StrategyKind,
    cfg: &EgressConfig,
    source: &SourceConfig,
    creds: &Credentials,
) -> Result<LaunchSpec, String> {
    let mut spec = match kind {
        StrategyKind::Passthrough => {
            let url = rtsp_url(source)?;
            LaunchSpec::new(GST_LAUNCH)
                .arg("-v")
                .args([
                    "rtspsrc".to_string(),
                    format!("location={url}"),
                    "latency=0".to_string(),
                    "buffer-mode=auto".to_string(),
                ])
                .args(["!", "rtph264depay", "!", "h264parse", "!", H264_CAPS, "!"])
                .args(kvssink(cfg))
                .arg("nal-adaptation-flags=0x0")
        }
        StrategyKind::Sample | StrategyKind::Rtmp => {
            let (flag, url) = match kind {
                StrategyKind::Sample => ("-rtsp", rtsp_url(source)?.to_string()),
                _ if cfg.rtmp_url.is_empty() => return Err("rtmp_url is not set".to_string()),
                _ => ("-r", cfg.rtmp_url.clone()),
            };
            let mut spec = LaunchSpec::new(cfg.producer_path.join(SAMPLE_BINARY).display().to_string())
                .arg(cfg.stream_name.clone())
                .args(["-w".to_string(), source.width.to_string()])
                .args(["-h".to_string(), source.height.to_string()])
                .args(["-f".to_string(), source.fps.to_string()])
                .args([flag.to_string(), url]);
            spec.cwd = Some(cfg.producer_path.clone());
            spec
        }
        StrategyKind::File => {
            if source.kind != SourceKind::File {
                return Err("requires a file source".to_string());
            }
            LaunchSpec::new(GST_LAUNCH)
                .arg("-v")
                .args(["filesrc".to_string(), format!("location={}", source.path.display())])
                .args(["!", "decodebin", "!", "videoconvert", "!"])
                .args(["x264enc", "bitrate=2000", "tune=zerolatency", "speed-preset=superfast"])
                .args(["!", H264_CAPS, "!"])
                .args(kvssink(cfg))
                .arg("absolute-fragment-times=false")
        }
    };
    spec.env = base_env(cfg, creds);
    Ok(spec)
}
