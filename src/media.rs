//! Video decomposition through an external `ffmpeg` binary.
//!
//! A video unit becomes up to `max_frames` PNG frames sampled every
//! `frame_interval_secs` (image units `{location}#frame-NNNN`) plus one
//! mono 16 kHz WAV track (audio unit `{location}#audio`). A video without
//! an audio stream yields frames only.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use ragweave_core::loader::MediaDecomposer;
use ragweave_core::models::{Modality, SourceUnit};
use ragweave_core::{Error, Result};
use tokio::process::Command;

use crate::config::LoaderConfig;

const AUDIO_SAMPLE_RATE: u32 = 16_000;

pub struct FfmpegDecomposer {
    ffmpeg: PathBuf,
    frame_interval_secs: u32,
    max_frames: usize,
}

impl FfmpegDecomposer {
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            frame_interval_secs: config.frame_interval_secs.max(1),
            max_frames: config.max_frames,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::provider_fatal(
                    "ffmpeg",
                    format!("failed to run {}: {e}", self.ffmpeg.display()),
                )
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::provider_fatal(
                "ffmpeg",
                format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }

    async fn split(&self, unit: &SourceUnit, dir: &Path) -> Result<Vec<SourceUnit>> {
        let input = dir.join("input");
        tokio::fs::write(&input, unit.content.as_bytes()).await?;
        let input_arg = input.to_string_lossy().to_string();

        let mut parts = Vec::new();

        if self.max_frames > 0 {
            let pattern = dir.join("frame-%04d.png").to_string_lossy().to_string();
            let filter = format!("fps=1/{}", self.frame_interval_secs);
            let max = self.max_frames.to_string();
            self.run(&["-i", &input_arg, "-vf", &filter, "-frames:v", &max, &pattern])
                .await?;

            for n in 1..=self.max_frames {
                let frame = dir.join(format!("frame-{n:04}.png"));
                let bytes = match tokio::fs::read(&frame).await {
                    Ok(b) => b,
                    Err(_) => break,
                };
                let index = n - 1;
                parts.push(
                    SourceUnit::media(
                        format!("{}#frame-{n:04}", unit.location),
                        Modality::Image,
                        bytes,
                    )
                    .with_metadata("frame_index", index)
                    .with_metadata("timestamp_secs", index as u64 * self.frame_interval_secs as u64),
                );
            }
        }

        let audio = dir.join("audio.wav");
        let audio_arg = audio.to_string_lossy().to_string();
        let rate = AUDIO_SAMPLE_RATE.to_string();
        match self
            .run(&["-i", &input_arg, "-vn", "-ac", "1", "-ar", &rate, &audio_arg])
            .await
        {
            Ok(()) => {
                let bytes = tokio::fs::read(&audio).await?;
                parts.push(SourceUnit::media(
                    format!("{}#audio", unit.location),
                    Modality::Audio,
                    bytes,
                ));
            }
            Err(e) => {
                tracing::warn!(location = %unit.location, error = %e, "no audio track extracted")
            }
        }

        for part in &mut parts {
            part.metadata.extend(unit.metadata.clone());
            part.metadata
                .insert("base_source".to_string(), unit.location.clone().into());
        }
        Ok(parts)
    }
}

#[async_trait]
impl MediaDecomposer for FfmpegDecomposer {
    async fn decompose(&self, unit: &SourceUnit) -> Result<Vec<SourceUnit>> {
        if unit.modality.fallback().is_empty() {
            return Ok(Vec::new());
        }

        let dir = std::env::temp_dir().join(format!("ragweave-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        let result = self.split(unit, &dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::debug!(dir = %dir.display(), error = %e, "failed to remove scratch dir");
        }

        let parts = result?;
        tracing::debug!(location = %unit.location, parts = parts.len(), "decomposed video");
        Ok(parts)
    }
}
