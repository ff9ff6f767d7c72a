use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Release stream to follow
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Beta,
    Nightly,
}

impl Channel {
    /// Whether releases of `version` are offered on this channel.
    pub fn admits(&self, version: &Version) -> bool {
        match (self, &version.pre) {
            (_, None) => true,
            (Channel::Stable, Some(_)) => false,
            (Channel::Beta, Some(pre)) => matches!(pre.label.as_str(), "beta" | "rc"),
            (Channel::Nightly, Some(_)) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerelease {
    pub label: String,
    pub number: Option<u64>,
}

/// `MAJOR.MINOR.PATCH[-LABEL[.N]]`, with an optional leading `v` and ignored `+build`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<Prerelease>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid version '{0}'")]
pub struct VersionError(String);

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionError(s.to_string());
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let trimmed = trimmed.split_once('+').map_or(trimmed, |(v, _build)| v);

        let (core, pre) = match trimmed.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (trimmed, None),
        };

        let mut parts = core.split('.');
        let mut number = || -> Result<u64, VersionError> {
            let part = parts.next().ok_or_else(err)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            part.parse().map_err(|_| err())
        };
        let major = number()?;
        let minor = number()?;
        let patch = number()?;
        if parts.next().is_some() {
            return Err(err());
        }

        let pre = match pre {
            None => None,
            Some(pre) => {
                let (label, number) = match pre.split_once('.') {
                    Some((label, n)) => (label, Some(n.parse::<u64>().map_err(|_| err())?)),
                    None => (pre, None),
                };
                if label.is_empty() || !label.bytes().all(|b| b.is_ascii_alphabetic()) {
                    return Err(err());
                }
                Some(Prerelease {
                    label: label.to_ascii_lowercase(),
                    number,
                })
            }
        };

        Ok(Version {
            major,
            minor,
            patch,
            pre,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre.label)?;
            if let Some(n) = pre.number {
                write!(f, ".{}", n)?;
            }
        }
        Ok(())
    }
}

/// Prereleases with different labels at the same core have no defined order.
impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let core = (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch));
        if core != Ordering::Equal {
            return Some(core);
        }
        match (&self.pre, &other.pre) {
            (None, None) => Some(Ordering::Equal),
            (None, Some(_)) => Some(Ordering::Greater),
            (Some(_), None) => Some(Ordering::Less),
            (Some(a), Some(b)) if a.label == b.label => Some(a.number.cmp(&b.number)),
            (Some(_), Some(_)) => None,
        }
    }
}
