use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::UpdateError;
use super::version::Channel;
use super::version::Version;

const USER_AGENT: &str = concat!("deskd/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A published release that can be installed on this host
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub version: Version,
    pub title: String,
    pub summary: Option<String>,
    pub url: Option<String>,
    /// Download location of the binary for this platform
    pub asset_url: String,
}

/// Where releases are discovered and downloaded from
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Newest release admitted by `channel`, if any.
    async fn latest(&self, channel: Channel) -> Result<Option<Release>, UpdateError>;

    /// Download the artifact for `release`.
    async fn fetch(&self, release: &Release) -> Result<Vec<u8>, UpdateError>;
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    name: Option<String>,
    body: Option<String>,
    html_url: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// Releases from a GitHub-style JSON endpoint (`/repos/<owner>/<repo>/releases`)
pub struct HttpReleaseSource {
    client: reqwest::Client,
    url: String,
}

impl HttpReleaseSource {
    pub fn new(url: impl Into<String>) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReleaseSource for HttpReleaseSource {
    async fn latest(&self, channel: Channel) -> Result<Option<Release>, UpdateError> {
        let releases: Vec<GithubRelease> = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("Release endpoint listed {} releases", releases.len());
        Ok(select_release(releases, channel, std::env::consts::OS, std::env::consts::ARCH))
    }

    async fn fetch(&self, release: &Release) -> Result<Vec<u8>, UpdateError> {
        let bytes = self
            .client
            .get(&release.asset_url)
            .header(reqwest::header::ACCEPT, "application/octet-stream")
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

/// Asset names carry the target, e.g. `deskd-linux-x86_64` or `deskd-windows-x86_64.exe`.
fn asset_matches(name: &str, os: &str, arch: &str) -> bool {
    let name = name.to_ascii_lowercase();
    let os_matches = match os {
        "macos" => name.contains("macos") || name.contains("darwin"),
        os => name.contains(os),
    };
    os_matches && name.contains(arch) && !name.ends_with(".sha256")
}

fn select_release(
    releases: Vec<GithubRelease>,
    channel: Channel,
    os: &str,
    arch: &str,
) -> Option<Release> {
    let mut best: Option<Release> = None;
    for release in releases.into_iter().filter(|r| !r.draft) {
        let Ok(version) = release.tag_name.parse::<Version>() else {
            debug!("Ignoring release with unparseable tag {}", release.tag_name);
            continue;
        };
        if !channel.admits(&version) {
            continue;
        }
        let Some(asset) = release.assets.iter().find(|a| asset_matches(&a.name, os, arch)) else {
            continue;
        };
        // Incomparable candidates never displace the current pick.
        if best.as_ref().is_some_and(|b| !(version > b.version)) {
            continue;
        }
        best = Some(Release {
            title: release.name.clone().unwrap_or_else(|| release.tag_name.clone()),
            summary: release.body.clone(),
            url: release.html_url.clone(),
            asset_url: asset.browser_download_url.clone(),
            version,
        });
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn releases() -> Vec<GithubRelease> {
        serde_json::from_str(
            r#"[
                {"tag_name": "v1.3.0-nightly.2", "name": "Nightly", "assets": [
                    {"name": "deskd-linux-x86_64", "browser_download_url": "https://dl/n2"}]},
                {"tag_name": "v1.2.0", "name": "deskd 1.2.0", "body": "Fixes",
                 "html_url": "https://releases/1.2.0", "assets": [
                    {"name": "deskd-linux-x86_64.sha256", "browser_download_url": "https://dl/sum"},
                    {"name": "deskd-linux-x86_64", "browser_download_url": "https://dl/120"},
                    {"name": "deskd-windows-x86_64.exe", "browser_download_url": "https://dl/120w"}]},
                {"tag_name": "v1.3.0", "draft": true, "assets": [
                    {"name": "deskd-linux-x86_64", "browser_download_url": "https://dl/draft"}]},
                {"tag_name": "v1.2.1-rc.1", "assets": [
                    {"name": "deskd-linux-x86_64", "browser_download_url": "https://dl/rc"}]},
                {"tag_name": "latest", "assets": []},
                {"tag_name": "v1.1.0", "assets": [
                    {"name": "deskd-linux-x86_64", "browser_download_url": "https://dl/110"}]}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_stable_channel_picks_newest_stable() {
        let release = select_release(releases(), Channel::Stable, "linux", "x86_64").unwrap();
        assert_eq!(release.version.to_string(), "1.2.0");
        assert_eq!(release.title, "deskd 1.2.0");
        assert_eq!(release.summary.as_deref(), Some("Fixes"));
        assert_eq!(release.asset_url, "https://dl/120");
    }

    #[test]
    fn test_beta_channel_includes_release_candidates() {
        let release = select_release(releases(), Channel::Beta, "linux", "x86_64").unwrap();
        assert_eq!(release.version.to_string(), "1.2.1-rc.1");
        assert_eq!(release.title, "v1.2.1-rc.1");
    }

    #[test]
    fn test_nightly_channel_and_platform_assets() {
        let nightly = select_release(releases(), Channel::Nightly, "linux", "x86_64").unwrap();
        assert_eq!(nightly.asset_url, "https://dl/n2");

        let windows = select_release(releases(), Channel::Nightly, "windows", "x86_64").unwrap();
        assert_eq!(windows.asset_url, "https://dl/120w");

        assert!(select_release(releases(), Channel::Nightly, "macos", "aarch64").is_none());
    }
}
