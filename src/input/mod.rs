// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频输入系统 (Video Input System)
///
/// 采集线程通过 `FrameSource::read` 拉取帧, 帧率由源自身归一化
/// - ImageLoopSource: 单张图片 / 图片目录循环播放
/// - SyntheticSource: 合成测试画面
/// - FfmpegSource:    摄像头 / RTSP / 视频文件 (需要 `ffmpeg` 功能)
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod image_loop;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegSource;
pub use image_loop::ImageLoopSource;
pub use synthetic::SyntheticSource;

use crate::config::{SourceConfig, SourceKind};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    /// Startup-fatal.
    #[error("cannot open {what}: {reason}")]
    Open { what: String, reason: String },

    /// Transient; the capture stage logs, backs off and retries.
    #[error("frame read failed: {0}")]
    Read(String),

    /// A non-looping file ran out of frames.
    #[error("source exhausted")]
    Exhausted,
}

impl SourceError {
    pub fn open(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SourceError::Open {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

/// Pull-based frame producer, paced to its configured frame rate.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<RgbImage, SourceError>;

    fn describe(&self) -> String;
}

fn is_image_path(path: &std::path::Path) -> bool {
    path.is_dir() || image::ImageFormat::from_path(path).is_ok()
}

/// Opens the configured source. Image paths never need ffmpeg.
pub fn open_source(cfg: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    match cfg.kind {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSource::new(cfg.width, cfg.height, cfg.fps))),
        SourceKind::File if is_image_path(&cfg.path) => Ok(Box::new(ImageLoopSource::open(
            &cfg.path,
            cfg.fps,
            cfg.loop_file,
        )?)),
        #[cfg(feature = "ffmpeg")]
        _ => Ok(Box::new(FfmpegSource::open(cfg)?)),
        #[cfg(not(feature = "ffmpeg"))]
        kind => Err(SourceError::open(
            format!("{kind:?} source"),
            "built without the `ffmpeg` feature",
        )),
    }
}
