//! qcow2 disk management — thin wrappers over `qemu-img`.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::VmlabError;

/// Run `qemu-img` with the given arguments, surfacing stderr on failure.
async fn run_qemu_img(args: &[&str]) -> Result<(), VmlabError> {
    let output = tokio::process::Command::new("qemu-img")
        .args(args)
        .output()
        .await
        .map_err(|e| VmlabError::Io {
            context: "running qemu-img (is qemu-utils installed?)".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(VmlabError::ExternalCommand {
            command: "qemu-img".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

async fn ensure_parent(path: &Path) -> Result<(), VmlabError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VmlabError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }
    Ok(())
}

/// Create an empty qcow2 disk of the given size.
pub async fn create_disk(path: &Path, size_gb: u64) -> Result<(), VmlabError> {
    ensure_parent(path).await?;
    let path_str = path.display().to_string();
    let size = format!("{size_gb}G");
    run_qemu_img(&["create", "-f", "qcow2", &path_str, &size]).await?;
    tracing::info!(path = %path.display(), size_gb, "created qcow2 disk");
    Ok(())
}

/// Create a qcow2 disk from a cloud image: convert (decouples the disk
/// from the cached image) then resize to the requested virtual size.
/// The guest filesystem grows into the new space on first boot.
pub async fn create_disk_from_image(
    image: &Path,
    path: &Path,
    size_gb: u64,
) -> Result<(), VmlabError> {
    ensure_parent(path).await?;
    let image_str = image.display().to_string();
    let path_str = path.display().to_string();
    run_qemu_img(&["convert", "-O", "qcow2", &image_str, &path_str]).await?;

    let size = format!("{size_gb}G");
    run_qemu_img(&["resize", &path_str, &size]).await?;
    tracing::info!(path = %path.display(), size_gb, "created disk from cloud image");
    Ok(())
}

/// Delete a disk image. Returns false when it did not exist.
pub async fn delete_disk(path: &Path) -> Result<bool, VmlabError> {
    if !path.exists() {
        return Ok(false);
    }
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| VmlabError::Io {
            context: format!("deleting disk {}", path.display()),
            source: e,
        })?;
    tracing::info!(path = %path.display(), "deleted disk");
    Ok(true)
}

/// Make a disk file group-accessible (mode 0660) so the qemu process
/// libvirt spawns can open it. Group ownership is left to the admin —
/// changing it needs privileges we may not have.
pub fn fix_permissions(path: &Path) -> Result<(), VmlabError> {
    let metadata = std::fs::metadata(path).map_err(|e| VmlabError::Io {
        context: format!("reading metadata for {}", path.display()),
        source: e,
    })?;
    let mut perms = metadata.permissions();
    if perms.mode() & 0o777 == 0o660 {
        return Ok(());
    }
    perms.set_mode(0o660);
    std::fs::set_permissions(path, perms).map_err(|e| VmlabError::Io {
        context: format!("setting permissions on {}", path.display()),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), "set disk permissions to 0660");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_missing_disk_is_false() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!delete_disk(&dir.path().join("none.qcow2")).await.unwrap());
    }

    #[tokio::test]
    async fn delete_existing_disk_is_true() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.qcow2");
        std::fs::write(&path, b"stub").unwrap();
        assert!(delete_disk(&path).await.unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn fix_permissions_sets_group_rw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.qcow2");
        std::fs::write(&path, b"stub").unwrap();
        fix_permissions(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }

    #[test]
    fn fix_permissions_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(fix_permissions(&dir.path().join("none.qcow2")).is_err());
    }
}
