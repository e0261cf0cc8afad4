//! ffmpeg-backed media composition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use clipforge_core::JobId;

use crate::provider::{MediaComposer, MediaFetcher, ProviderError};

/// Concatenates and mixes media with the `ffmpeg` binary in a scratch directory.
#[derive(Clone)]
pub struct FfmpegComposer {
    fetcher: Arc<dyn MediaFetcher>,
    ffmpeg: PathBuf,
    scratch: PathBuf,
}

impl FfmpegComposer {
    pub fn new(fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self {
            fetcher,
            ffmpeg: PathBuf::from("ffmpeg"),
            scratch: std::env::temp_dir().join("clipforge"),
        }
    }

    pub fn with_binary(mut self, ffmpeg: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self
    }

    async fn workdir(&self) -> Result<ScratchDir, ProviderError> {
        let dir = self.scratch.join(JobId::generate().as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::Request(format!("scratch dir: {e}")))?;
        Ok(ScratchDir(dir))
    }

    async fn run(&self, args: &[&str]) -> Result<(), ProviderError> {
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(args)
            .output()
            .await
            .map_err(|e| ProviderError::Request(format!("spawn ffmpeg: {e}")))?;

        if !output.status.success() {
            return Err(ProviderError::InvalidResult(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl core::fmt::Debug for FfmpegComposer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FfmpegComposer")
            .field("ffmpeg", &self.ffmpeg)
            .field("scratch", &self.scratch)
            .finish()
    }
}

#[async_trait]
impl MediaComposer for FfmpegComposer {
    async fn concat(&self, clip_urls: &[String]) -> Result<Vec<u8>, ProviderError> {
        let dir = self.workdir().await?;
        let mut list = String::new();

        for (i, url) in clip_urls.iter().enumerate() {
            let bytes = self.fetcher.fetch(url).await?;
            let clip = dir.path().join(format!("scene-{i:02}.mp4"));
            write(&clip, &bytes).await?;
            list.push_str(&format!("file '{}'\n", clip.display()));
        }

        let list_path = dir.path().join("concat.txt");
        write(&list_path, list.as_bytes()).await?;

        let out = dir.path().join("merged.mp4");
        let list_arg = list_path.to_string_lossy().into_owned();
        let out_arg = out.to_string_lossy().into_owned();
        self.run(&[
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
            list_arg.as_str(),
            "-c",
            "copy",
            out_arg.as_str(),
        ])
        .await?;

        let merged = read(&out).await?;
        debug!(clips = clip_urls.len(), len = merged.len(), "clips concatenated");
        Ok(merged)
    }

    async fn mix_audio(&self, video: Vec<u8>, audio: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let dir = self.workdir().await?;
        let video_path = dir.path().join("video.mp4");
        let audio_path = dir.path().join("narration.mp3");
        write(&video_path, &video).await?;
        write(&audio_path, audio).await?;

        let out = dir.path().join("mixed.mp4");
        let video_arg = video_path.to_string_lossy().into_owned();
        let audio_arg = audio_path.to_string_lossy().into_owned();
        let out_arg = out.to_string_lossy().into_owned();
        self.run(&[
            "-i",
            video_arg.as_str(),
            "-i",
            audio_arg.as_str(),
            "-map",
            "0:v",
            "-map",
            "1:a",
            "-c:v",
            "copy",
            "-shortest",
            out_arg.as_str(),
        ])
        .await?;

        read(&out).await
    }
}

async fn write(path: &Path, bytes: &[u8]) -> Result<(), ProviderError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| ProviderError::Request(format!("write {}: {e}", path.display())))
}

async fn read(path: &Path) -> Result<Vec<u8>, ProviderError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| ProviderError::Request(format!("read {}: {e}", path.display())))
}

/// Scratch directory removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
