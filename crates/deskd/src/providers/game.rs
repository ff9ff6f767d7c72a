use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use linkme::distributed_slice;
use tracing::debug;
use tracing::warn;

use crate::engine;
use crate::engine::MetricProvider;
use crate::engine::ModuleKind;
use crate::engine::ProviderError;
use crate::engine::Sample;

/// State reported when no game is running
pub const IDLE: &str = "idle";

/// Extra details about a game, e.g. from an artwork database
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameDetails {
    pub cover_url: Option<String>,
    pub genre: Option<String>,
}

/// Optional lookup of game details by name
#[async_trait]
pub trait GameMetadata: Send + Sync {
    async fn lookup(&self, game: &str) -> anyhow::Result<Option<GameDetails>>;
}

/// Current game read from a file written by a launcher hook
pub struct GameProvider {
    path: PathBuf,
    metadata: Option<Arc<dyn GameMetadata>>,
    cached: Option<(String, Option<GameDetails>)>,
}

impl GameProvider {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            metadata: None,
            cached: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn GameMetadata>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Details for `game`, looked up once per distinct name.
    async fn details(&mut self, game: &str) -> Option<GameDetails> {
        let metadata = self.metadata.as_ref()?;
        if let Some((name, details)) = &self.cached {
            if name == game {
                return details.clone();
            }
        }
        let details = match metadata.lookup(game).await {
            Ok(details) => details,
            Err(e) => {
                warn!("Game metadata lookup for '{}' failed: {:#}", game, e);
                None
            }
        };
        self.cached = Some((game.to_string(), details.clone()));
        details
    }
}

/// First line of the game file, or `None` when idle.
fn current_game(contents: &str) -> Option<&str> {
    let line = contents.lines().next()?.trim();
    if line.is_empty() || line.eq_ignore_ascii_case("unknown") {
        return None;
    }
    Some(line)
}

#[async_trait]
impl MetricProvider for GameProvider {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Game
    }

    async fn sample(&mut self) -> Result<Sample, ProviderError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Game file {} does not exist", self.path.display());
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        let Some(game) = current_game(&contents).map(str::to_string) else {
            return Ok(Sample::new()
                .with_state(IDLE)
                .field("playing", false)
                .field("game", serde_json::Value::Null));
        };

        let mut sample = Sample::new()
            .with_state(game.clone())
            .field("playing", true)
            .field("game", game.clone());
        if let Some(details) = self.details(&game).await {
            if let Some(cover) = details.cover_url {
                sample = sample.field("cover_url", cover);
            }
            if let Some(genre) = details.genre {
                sample = sample.field("genre", genre);
            }
        }
        Ok(sample)
    }
}

#[distributed_slice(engine::PROVIDER_REGISTRY)]
fn init_game(ctx: &engine::ProviderContext) -> engine::ProviderFactoryResult {
    let game = &ctx.config.modules.game;
    if !game.enabled {
        return Ok(None);
    }
    let path = game
        .game_file
        .clone()
        .ok_or_else(|| anyhow::anyhow!("modules.game.game_file is required"))?;
    Ok(Some(Box::new(GameProvider::new(path))))
}
