//! Built-in metric providers.
//!
//! Each provider registers a factory in [`crate::engine::PROVIDER_REGISTRY`]; the factory
//! returns `Ok(None)` when its module is disabled.

pub mod game;
pub mod media;
pub mod system;

pub use game::GameDetails;
pub use game::GameMetadata;
pub use game::GameProvider;
pub use media::MediaProvider;
pub use system::SystemProvider;
