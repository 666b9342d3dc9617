//! Turns track references into PCM streams and looks up media metadata
//!
//! Page URLs go through yt-dlp (fetch) piped into ffmpeg (transcode). Files and direct
//! media URLs only need ffmpeg. Metadata comes from a separate yt-dlp JSON dump and
//! never touches the playback pipeline.

use super::pipeline::{PcmStream, ProcessPipeline};
use crate::config::{pcm, MediaConfig};
use crate::error::SourceError;
use crate::track::{Track, TrackSource};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const YTDLP: &str = "yt-dlp";
const FFMPEG: &str = "ffmpeg";

/// Lightweight metadata from the fetch stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct MetadataDump {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
}

/// Opens PCM sources for tracks
#[derive(Debug, Clone)]
pub struct AudioSourceResolver {
    config: MediaConfig,
}

impl AudioSourceResolver {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Open a track's audio as PCM, bound to `cancel`
    pub async fn open(
        &self,
        track: &Track,
        cancel: &CancellationToken,
    ) -> Result<PcmStream, SourceError> {
        match &track.source {
            TrackSource::Url(url) => self.open_url(url, cancel),
            TrackSource::DirectUrl(url) => self.open_direct(url, cancel),
            TrackSource::File(path) => self.open_direct(&path.to_string_lossy(), cancel),
            TrackSource::Factory(factory) => factory(cancel.clone()).await,
        }
    }

    /// yt-dlp bestaudio piped into ffmpeg
    pub fn open_url(&self, url: &str, cancel: &CancellationToken) -> Result<PcmStream, SourceError> {
        let ytdlp = locate(YTDLP, self.config.ytdlp_path.as_deref())?;
        let ffmpeg = locate(FFMPEG, self.config.ffmpeg_path.as_deref())?;

        let mut fetch = Command::new(&ytdlp);
        fetch.args(fetch_args(url));
        let mut transcode = Command::new(&ffmpeg);
        transcode.args(transcode_args("pipe:0"));

        debug!(url, "Opening two-stage pipeline");
        ProcessPipeline::spawn(Some(fetch), transcode, self.config.grace_period, cancel)
    }

    /// ffmpeg reading the input itself
    pub fn open_direct(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<PcmStream, SourceError> {
        let ffmpeg = locate(FFMPEG, self.config.ffmpeg_path.as_deref())?;

        let mut transcode = Command::new(&ffmpeg);
        transcode.args(transcode_args(input));

        debug!(input, "Opening transcode-only pipeline");
        ProcessPipeline::spawn(None, transcode, self.config.grace_period, cancel)
    }

    /// Resolve title, thumbnail and duration for a page URL
    pub async fn resolve_metadata(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata, SourceError> {
        let ytdlp = locate(YTDLP, self.config.ytdlp_path.as_deref())?;
        let cookies = self.config.cookies_file.as_deref().filter(|p| p.is_file());

        let mut cmd = Command::new(&ytdlp);
        cmd.args(metadata_args(url, cookies))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            out = cmd.output() => out.map_err(|source| SourceError::Spawn {
                program: ytdlp.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                return Err(SourceError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "metadata lookup cancelled",
                )));
            }
        };

        if !output.status.success() {
            return Err(SourceError::FetchFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let meta = parse_metadata(&output.stdout)?;
        info!(url, title = ?meta.title, duration = ?meta.duration, "Resolved metadata");
        Ok(meta)
    }

    /// Build a page-URL track, decorated with metadata when the lookup succeeds
    pub async fn track_for_url(&self, url: &str, cancel: &CancellationToken) -> Track {
        let meta = match self.resolve_metadata(url, cancel).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(url, error = %e, "Metadata lookup failed, queuing without it");
                MediaMetadata::default()
            }
        };

        let mut track = Track::url(meta.title.unwrap_or_else(|| url.to_string()), url);
        track.duration = meta.duration;
        track.thumbnail_url = meta.thumbnail;
        track
    }
}

/// yt-dlp arguments streaming the best audio-only format to stdout
pub fn fetch_args(url: &str) -> Vec<String> {
    ["-o", "-", "-f", "ba", "--no-playlist", url]
        .into_iter()
        .map(String::from)
        .collect()
}

/// ffmpeg arguments producing s16le/48kHz/stereo on stdout
pub fn transcode_args(input: &str) -> Vec<String> {
    let rate = pcm::SAMPLE_RATE.to_string();
    let channels = pcm::CHANNELS.to_string();
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-i",
        input,
        "-f",
        "s16le",
        "-ar",
        rate.as_str(),
        "-ac",
        channels.as_str(),
        "pipe:1",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// yt-dlp arguments dumping one entry's JSON metadata
pub fn metadata_args(url: &str, cookies: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = ["--dump-json", "--no-playlist", "--no-warnings"]
        .into_iter()
        .map(String::from)
        .collect();
    if let Some(cookies) = cookies {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }
    args.push(url.to_string());
    args
}

pub fn parse_metadata(json: &[u8]) -> Result<MediaMetadata, SourceError> {
    let dump: MetadataDump = serde_json::from_slice(json)?;
    Ok(MediaMetadata {
        title: dump.title,
        thumbnail: dump.thumbnail,
        duration: dump
            .duration
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
    })
}

/// Find an executable: configured path, then next to our binary, then PATH
pub fn locate(name: &str, configured: Option<&Path>) -> Result<PathBuf, SourceError> {
    let mut searched = Vec::new();

    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        searched.push(path.display().to_string());
    }

    let file_name = format!("{}{}", name, env::consts::EXE_SUFFIX);

    if let Some(dir) = env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        let candidate = dir.join(&file_name);
        if candidate.is_file() {
            return Ok(candidate);
        }
        searched.push(candidate.display().to_string());
    }

    if let Some(found) = find_on_path(&file_name, env::var_os("PATH").as_deref()) {
        return Ok(found);
    }
    searched.push("PATH".to_string());

    Err(SourceError::ExecutableNotFound {
        name: name.to_string(),
        searched: searched.join(", "),
    })
}

fn find_on_path(file_name: &str, path_var: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    env::split_paths(path_var?)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}
