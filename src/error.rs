// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! Error types for the edge pipeline and the fusion service.
//!
//! Every stage absorbs its own transient failures. Only the variants of
//! [`PipelineError`] escape, and all of them abort startup.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::detection::DetectorError;
use crate::egress::EgressError;
use crate::input::SourceError;
use crate::transport::TransportError;

/// Startup-fatal failures of the edge pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("detector failed to load: {0}")]
    Detector(#[from] DetectorError),

    #[error("frame source failed to open: {0}")]
    Source(#[from] SourceError),

    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("video egress failed: {0}")]
    Egress(#[from] EgressError),

    #[error("failed to spawn {stage} thread: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("preview output directory unavailable: {0}")]
    PreviewDir(PathBuf),
}

impl PipelineError {
    pub fn spawn(stage: &'static str, source: std::io::Error) -> Self {
        PipelineError::Spawn { stage, source }
    }
}
