use serde::Deserialize;
use serde::Serialize;

/// Operating system family a command may run on
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Linux,
    #[serde(alias = "win")]
    Windows,
    #[serde(alias = "darwin", alias = "mac")]
    Macos,
}

impl Platform {
    /// The platform this binary was built for, if it is one commands can target.
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else if cfg!(target_os = "macos") {
            Some(Platform::Macos)
        } else {
            None
        }
    }
}
