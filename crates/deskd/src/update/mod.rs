//! Self-update from a release channel.

mod install;
mod manager;
mod source;
mod version;

pub use install::backup_path;
pub use manager::UpdateError;
pub use manager::UpdateHandle;
pub use manager::UpdateManager;
pub use manager::UpdateStatus;
pub use source::HttpReleaseSource;
pub use source::Release;
pub use source::ReleaseSource;
pub use version::Channel;
pub use version::Version;
pub use version::VersionError;
