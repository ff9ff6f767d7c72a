use std::process::Stdio;

use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::process::Command;
use tracing::debug;

use crate::engine;
use crate::engine::MetricProvider;
use crate::engine::ModuleKind;
use crate::engine::ProviderError;
use crate::engine::Sample;

const PLAYERCTL: &str = "playerctl";
const FORMAT: &str = "{{status}}\t{{playerName}}\t{{artist}}\t{{title}}\t{{album}}";

/// State reported when no player is active
pub const IDLE: &str = "idle";

/// Now-playing information from MPRIS players, read with playerctl
pub struct MediaProvider {
    program: String,
}

impl MediaProvider {
    pub fn new() -> Self {
        Self {
            program: PLAYERCTL.to_string(),
        }
    }
}

impl Default for MediaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, PartialEq)]
struct Track {
    status: String,
    player: String,
    artist: String,
    title: String,
    album: String,
}

fn parse_metadata(line: &str) -> Option<Track> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split('\t');
    let track = Track {
        status: parts.next()?.to_lowercase(),
        player: parts.next()?.to_string(),
        artist: parts.next()?.to_string(),
        title: parts.next()?.to_string(),
        album: parts.next().unwrap_or_default().to_string(),
    };
    Some(track)
}

fn idle_sample() -> Sample {
    Sample::new()
        .with_state(IDLE)
        .field("status", "stopped")
        .field("playing", false)
}

impl Track {
    fn into_sample(self) -> Sample {
        if self.status == "stopped" || self.title.is_empty() {
            return idle_sample();
        }
        let state = if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        };
        Sample::new()
            .with_state(state)
            .field("playing", self.status == "playing")
            .field("status", self.status)
            .field("player", self.player)
            .field("artist", self.artist)
            .field("title", self.title)
            .field("album", self.album)
    }
}

#[async_trait]
impl MetricProvider for MediaProvider {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Media
    }

    async fn sample(&mut self) -> Result<Sample, ProviderError> {
        if !cfg!(target_os = "linux") {
            return Err(ProviderError::Unavailable(
                "media sessions are only read through playerctl on Linux".to_string(),
            ));
        }

        let output = Command::new(&self.program)
            .args(["metadata", "--format", FORMAT])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            // playerctl exits non-zero when no player is running.
            debug!(
                "playerctl reported no player: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(idle_sample());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().unwrap_or_default();
        let track = parse_metadata(line)
            .ok_or_else(|| ProviderError::Probe(format!("unexpected playerctl output: {:?}", line)))?;
        Ok(track.into_sample())
    }
}

#[distributed_slice(engine::PROVIDER_REGISTRY)]
fn init_media(ctx: &engine::ProviderContext) -> engine::ProviderFactoryResult {
    if !ctx.config.modules.media.enabled {
        return Ok(None);
    }
    Ok(Some(Box::new(MediaProvider::new())))
}
