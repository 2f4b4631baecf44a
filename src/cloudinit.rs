//! Cloud-init seed ISOs: user-data generation plus ISO mastering via
//! `genisoimage` (fallback `mkisofs`).

use std::path::Path;

use crate::error::VmlabError;

/// Default meta-data for a seed ISO when the caller supplies none.
const DEFAULT_META_DATA: &str = "instance-id: iid-local01\nlocal-hostname: cloudimg\n";

/// Build `#cloud-config` user-data that sets a password for `username`.
///
/// Uses `chpasswd`, which accepts a plaintext entry — the guest hashes
/// it on first boot. Password SSH auth is enabled so the account is
/// usable over the network, not just the console.
pub fn password_user_data(username: &str, password: &str) -> String {
    format!(
        r#"#cloud-config
users:
  - name: {username}
    sudo: ALL=(ALL) NOPASSWD:ALL
    shell: /bin/bash
    lock_passwd: false

chpasswd:
  list: |
    {username}:{password}
  expire: false

ssh_pwauth: true
disable_root: false
"#
    )
}

/// Master a cloud-init NoCloud seed ISO (volume id `cidata`) from
/// user-data and optional meta-data.
///
/// Tries `genisoimage` first, then `mkisofs` — both accept the same
/// file layout, differing only in flag spelling.
pub async fn create_seed_iso(
    user_data: &str,
    meta_data: Option<&str>,
    output: &Path,
) -> Result<(), VmlabError> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VmlabError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let staging = tempfile::tempdir().map_err(|e| VmlabError::Io {
        context: "creating temp directory for cloud-init data".into(),
        source: e,
    })?;

    tokio::fs::write(staging.path().join("user-data"), user_data)
        .await
        .map_err(|e| VmlabError::Io {
            context: "writing user-data".into(),
            source: e,
        })?;
    tokio::fs::write(
        staging.path().join("meta-data"),
        meta_data.unwrap_or(DEFAULT_META_DATA),
    )
    .await
    .map_err(|e| VmlabError::Io {
        context: "writing meta-data".into(),
        source: e,
    })?;

    let genisoimage = run_mastering_tool(
        "genisoimage",
        &["-o", "-volid", "cidata", "-joliet", "-rock"],
        staging.path(),
        output,
    )
    .await;

    match genisoimage {
        Ok(()) => {}
        Err(first_err) => {
            // genisoimage missing or broken — try mkisofs before giving up
            run_mastering_tool(
                "mkisofs",
                &["-o", "-V", "cidata", "-J", "-r"],
                staging.path(),
                output,
            )
            .await
            .map_err(|_| match first_err {
                VmlabError::Io { .. } => VmlabError::Validation {
                    message: "neither genisoimage nor mkisofs found; \
                              install with: sudo apt install genisoimage"
                        .into(),
                },
                other => other,
            })?;
        }
    }

    tracing::info!(path = %output.display(), "created cloud-init seed ISO");
    Ok(())
}

/// Invoke an ISO tool in the staging directory. `args[0]` must be the
/// output flag; the output path is spliced in after it.
async fn run_mastering_tool(
    tool: &str,
    args: &[&str],
    staging: &Path,
    output: &Path,
) -> Result<(), VmlabError> {
    let out = tokio::process::Command::new(tool)
        .arg(args[0])
        .arg(output)
        .args(&args[1..])
        .args(["user-data", "meta-data"])
        .current_dir(staging)
        .output()
        .await
        .map_err(|e| VmlabError::Io {
            context: format!("running {tool}"),
            source: e,
        })?;

    if !out.status.success() {
        return Err(VmlabError::ExternalCommand {
            command: tool.into(),
            message: String::from_utf8_lossy(&out.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_is_cloud_config() {
        let ud = password_user_data("ubuntu", "hunter2");
        assert!(ud.starts_with("#cloud-config\n"));
    }

    #[test]
    fn user_data_contains_user_and_password() {
        let ud = password_user_data("debian", "s3cret");
        assert!(ud.contains("- name: debian"));
        assert!(ud.contains("debian:s3cret"));
        assert!(ud.contains("lock_passwd: false"));
        assert!(ud.contains("sudo: ALL=(ALL) NOPASSWD:ALL"));
    }

    #[test]
    fn user_data_enables_password_ssh() {
        let ud = password_user_data("ubuntu", "pw");
        assert!(ud.contains("ssh_pwauth: true"));
        assert!(ud.contains("expire: false"));
    }

    #[test]
    fn default_meta_data_has_instance_id() {
        assert!(DEFAULT_META_DATA.contains("instance-id:"));
        assert!(DEFAULT_META_DATA.contains("local-hostname:"));
    }
}
