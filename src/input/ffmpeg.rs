// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// FFmpeg 输入 (camera / RTSP / video file)
/// FFmpeg decode source
///
/// 解码在独立线程中运行, 过滤器把 rgb24 帧转换为 RgbImage 后 try_send 给采集线程.
/// 流结束或断开后由下一次 `read` 重新拉流.
use super::{FrameSource, SourceError};
use crate::config::{SourceConfig, SourceKind};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// 解码过滤器: rgb24 帧 → RgbImage
#[derive(Clone)]
struct RgbFilter {
    tx: Sender<RgbImage>,
    stop: Arc<AtomicBool>,
    dropped: usize,
}

impl FrameFilter for RgbFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!("decode filter started");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if self.stop.load(Ordering::Relaxed) {
            return Err("source closed".to_string());
        }
        if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
            self.dropped += 1;
            return Ok(None);
        }

        // format=rgb24: one packed plane, rows padded to linesize
        let img = unsafe {
            let raw = &*frame.as_ptr();
            let (w, h) = (raw.width as usize, raw.height as usize);
            let stride = raw.linesize[0] as usize;
            let data = raw.data[0];
            if data.is_null() || w == 0 || h == 0 || stride < w * 3 {
                self.dropped += 1;
                return Ok(None);
            }
            let mut pixels = Vec::with_capacity(w * h * 3);
            for y in 0..h {
                let row = std::slice::from_raw_parts(data.add(y * stride), w * 3);
                pixels.extend_from_slice(row);
            }
            RgbImage::from_raw(w as u32, h as u32, pixels)
        };

        if let Some(img) = img {
            // capture thread behind: keep decoding, drop this frame
            let _ = self.tx.try_send(img);
        }
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        debug!(dropped = self.dropped, "decode filter stopped");
    }
}

fn camera_input(device: &str) -> (String, &'static str) {
    #[cfg(target_os = "windows")]
    {
        (format!("video={}", device), "dshow")
    }
    #[cfg(target_os = "macos")]
    {
        (device.to_string(), "avfoundation")
    }
    #[cfg(target_os = "linux")]
    {
        let url = if device.chars().all(|c| c.is_ascii_digit()) {
            format!("/dev/video{}", device)
        } else {
            device.to_string()
        };
        (url, "v4l2")
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        (device.to_string(), "video4linux2")
    }
}

pub struct FfmpegSource {
    cfg: SourceConfig,
    rx: Option<Receiver<RgbImage>>,
    stop: Arc<AtomicBool>,
    decoder: Option<JoinHandle<()>>,
    restarts: u64,
}

impl FfmpegSource {
    pub fn open(cfg: &SourceConfig) -> Result<Self, SourceError> {
        if cfg.kind == SourceKind::File && !cfg.path.exists() {
            return Err(SourceError::open(cfg.path.display().to_string(), "file not found"));
        }
        let mut source = Self {
            cfg: cfg.clone(),
            rx: None,
            stop: Arc::new(AtomicBool::new(false)),
            decoder: None,
            restarts: 0,
        };
        source.start().map_err(|e| SourceError::open(source.describe(), e))?;
        Ok(source)
    }

    fn build_input(&self) -> Input {
        match self.cfg.kind {
            SourceKind::Camera => {
                let (url, format) = camera_input(&self.cfg.device);
                let size = format!("{}x{}", self.cfg.width, self.cfg.height);
                let rate = self.cfg.fps.to_string();
                Input::new(url).set_format(format).set_input_opts(
                    [
                        ("framerate".to_string(), rate),
                        ("video_size".to_string(), size),
                    ]
                    .into(),
                )
            }
            SourceKind::Rtsp => Input::new(self.cfg.url.clone()).set_input_opts(
                [
                    ("rtsp_transport".to_string(), "tcp".to_string()),
                    ("stimeout".to_string(), "5000000".to_string()),
                ]
                .into(),
            ),
            _ => Input::new(self.cfg.path.display().to_string()),
        }
    }

    /// Builds and starts a decode context on its own thread.
    fn start(&mut self) -> Result<(), String> {
        let (tx, rx) = bounded(2);
        let (status_tx, status_rx) = bounded::<Result<(), String>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let filter = RgbFilter {
            tx,
            stop: stop.clone(),
            dropped: 0,
        };
        let input = self.build_input();
        let desc = format!("fps={},format=rgb24", self.cfg.fps.max(1));

        let handle = std::thread::Builder::new()
            .name("edgeguard-decode".into())
            .spawn(move || {
                let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
                let pipe = pipe.filter("rgb", Box::new(filter));
                let out = create_null_output().add_frame_pipeline(pipe);

                let ctx = match FfmpegContext::builder()
                    .input(input)
                    .filter_desc(desc)
                    .output(out)
                    .build()
                {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        let _ = status_tx.send(Err(format!("build failed: {e}")));
                        return;
                    }
                };
                let sch = match ctx.start() {
                    Ok(sch) => sch,
                    Err(e) => {
                        let _ = status_tx.send(Err(format!("start failed: {e}")));
                        return;
                    }
                };
                let _ = status_tx.send(Ok(()));
                if let Err(e) = sch.wait() {
                    debug!("decode loop ended: {e}");
                }
            })
            .map_err(|e| e.to_string())?;

        match status_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                stop.store(true, Ordering::Relaxed);
                return Err(format!("not opened within {}s", OPEN_TIMEOUT.as_secs()));
            }
        }

        self.stop_decoder();
        self.stop = stop;
        self.rx = Some(rx);
        self.decoder = Some(handle);
        info!(source = %self.describe(), "decoder started");
        Ok(())
    }

    fn stop_decoder(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.rx = None;
        // detached: a blocked network read would stall shutdown
        self.decoder.take();
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        if self.rx.is_none() {
            self.restarts += 1;
            self.start()
                .map_err(|e| SourceError::Read(format!("reconnect #{} failed: {e}", self.restarts)))?;
        }
        let Some(rx) = &self.rx else {
            return Err(SourceError::Read("decoder not running".to_string()));
        };
        match rx.recv_timeout(READ_TIMEOUT) {
            Ok(img) => Ok(img),
            Err(RecvTimeoutError::Timeout) => Err(SourceError::Read(format!(
                "no frame within {}s",
                READ_TIMEOUT.as_secs()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                self.stop_decoder();
                if self.cfg.kind == SourceKind::File && !self.cfg.loop_file {
                    return Err(SourceError::Exhausted);
                }
                warn!(source = %self.describe(), "stream ended; restarting decoder");
                Err(SourceError::Read("stream ended".to_string()))
            }
        }
    }

    fn describe(&self) -> String {
        match self.cfg.kind {
            SourceKind::Camera => format!("camera {}", self.cfg.device),
            SourceKind::Rtsp => format!("rtsp {}", self.cfg.url),
            _ => format!("file {}", self.cfg.path.display()),
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.stop_decoder();
    }
}
