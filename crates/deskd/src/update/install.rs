use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tracing::info;

use super::UpdateError;

/// Path the replaced binary is kept at: `<name>.previous` next to the target.
pub fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".previous");
    target.with_file_name(name)
}

/// Replace `target` with `artifact`.
///
/// The artifact is fully written and synced to a temporary file beside the target before
/// the target is touched, so a failure at any point leaves the old binary in place.
pub fn install(target: &Path, artifact: &[u8]) -> Result<(), UpdateError> {
    if artifact.is_empty() {
        return Err(UpdateError::ApplyFailure("downloaded artifact is empty".to_string()));
    }
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(artifact)?;
    staged.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(staged.path(), std::fs::Permissions::from_mode(0o755))?;
    }

    if target.exists() {
        let backup = backup_path(target);
        std::fs::copy(target, &backup)?;
        info!("Kept previous binary at {}", backup.display());
    }

    staged.persist(target).map_err(|e| UpdateError::Io(e.error))?;
    info!("Installed {} bytes to {}", artifact.len(), target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/usr/local/bin/deskd")),
            PathBuf::from("/usr/local/bin/deskd.previous")
        );
        assert_eq!(
            backup_path(Path::new("deskd.exe")),
            PathBuf::from("deskd.exe.previous")
        );
    }

    #[test]
    fn test_install_replaces_and_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deskd");
        std::fs::write(&target, b"old").unwrap();

        install(&target, b"new").unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert_eq!(std::fs::read(backup_path(&target)).unwrap(), b"old");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_empty_artifact_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deskd");
        std::fs::write(&target, b"old").unwrap();

        assert!(matches!(install(&target, b""), Err(UpdateError::ApplyFailure(_))));
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
        assert!(!backup_path(&target).exists());
        // No staged files are left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_install_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("deskd");
        assert!(matches!(install(&target, b"new"), Err(UpdateError::Io(_))));
    }
}
