//! Cloud image cache: download, reuse, and prune pre-installed OS images.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tokio::io::AsyncWriteExt;

use crate::error::VmlabError;
use crate::template::Template;

/// Built-in image URLs for the default templates, keyed by (os, version).
/// A template's explicit `cloud_image_url` always wins over this table.
const IMAGE_URLS: &[(&str, &str, &str)] = &[
    (
        "ubuntu",
        "20.04",
        "https://cloud-images.ubuntu.com/focal/current/focal-server-cloudimg-amd64.img",
    ),
    (
        "ubuntu",
        "22.04",
        "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img",
    ),
    (
        "ubuntu",
        "24.04",
        "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
    ),
    (
        "debian",
        "11",
        "https://cloud.debian.org/images/cloud/bullseye/latest/debian-11-generic-amd64.qcow2",
    ),
    (
        "debian",
        "12",
        "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
    ),
    (
        "debian",
        "13",
        "https://cloud.debian.org/images/cloud/trixie/latest/debian-13-generic-amd64.qcow2",
    ),
];

/// Resolve the cloud image URL for a template.
pub fn resolve_url(template: &Template) -> Result<String, VmlabError> {
    if !template.cloud_image_url.is_empty() {
        return Ok(template.cloud_image_url.clone());
    }
    IMAGE_URLS
        .iter()
        .find(|(os, version, _)| *os == template.os && *version == template.version)
        .map(|(_, _, url)| (*url).to_string())
        .ok_or_else(|| VmlabError::Validation {
            message: format!(
                "template '{}' has no cloud image URL for {} {}",
                template.name, template.os, template.version
            ),
        })
}

/// Ensure the cloud image for a template is cached locally, downloading
/// it on first use. Returns the path to the cached file.
pub async fn ensure_image(template: &Template, cache_dir: &Path) -> Result<PathBuf, VmlabError> {
    let url = resolve_url(template)?;
    let filename = url.rsplit('/').next().unwrap_or("image.img");

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| VmlabError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let dest = cache_dir.join(filename);
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached cloud image");
        return Ok(dest);
    }

    println!("Downloading {url}...");
    download(&url, &dest).await?;
    tracing::info!(path = %dest.display(), "cloud image cached");
    Ok(dest)
}

/// Stream a URL to `dest` through a `.part` file, so an interrupted
/// download never leaves a truncated image behind under the final name.
async fn download(url: &str, dest: &Path) -> Result<(), VmlabError> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| VmlabError::ImageDownload {
            message: format!("request to {url} failed"),
            source: Box::new(e),
        })?;
    if !response.status().is_success() {
        return Err(VmlabError::ImageDownload {
            message: format!("HTTP {} from {url}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let bar = ProgressBar::new(response.content_length().unwrap_or(0));
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} ({eta})")
            .expect("valid progress template"),
    );

    let partial = dest.with_extension("part");
    let _ = tokio::fs::remove_file(&partial).await;

    let result = stream_body(response, &partial, &bar).await;
    bar.finish_and_clear();
    finalize_download(result, &partial, dest).await
}

/// Promote a completed `.part` file to its final name, or remove it when
/// the transfer failed — a truncated image must never survive under
/// either name.
async fn finalize_download(
    transfer: Result<(), VmlabError>,
    partial: &Path,
    dest: &Path,
) -> Result<(), VmlabError> {
    if let Err(e) = transfer {
        let _ = tokio::fs::remove_file(partial).await;
        return Err(e);
    }
    tokio::fs::rename(partial, dest)
        .await
        .map_err(|e| VmlabError::Io {
            context: format!("renaming {} to {}", partial.display(), dest.display()),
            source: e,
        })
}

async fn stream_body(
    response: reqwest::Response,
    path: &Path,
    bar: &ProgressBar,
) -> Result<(), VmlabError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VmlabError::Io {
            context: format!("creating {}", path.display()),
            source: e,
        })?;

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| VmlabError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| VmlabError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        bar.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| VmlabError::Io {
        context: "flushing image file".into(),
        source: e,
    })
}

/// A cached image file on disk.
pub struct CachedImage {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Scan the cache directory. A missing directory is an empty cache.
pub fn cached_images(cache_dir: &Path) -> Result<Vec<CachedImage>, VmlabError> {
    if !cache_dir.exists() {
        return Ok(Vec::new());
    }

    let dir = std::fs::read_dir(cache_dir).map_err(|e| VmlabError::Io {
        context: format!("reading cache directory {}", cache_dir.display()),
        source: e,
    })?;

    let mut images = Vec::new();
    for entry in dir.filter_map(|e| e.ok()) {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        images.push(CachedImage {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            size: meta.len(),
            modified: meta.modified().ok(),
        });
    }
    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(images)
}

#[derive(Tabled)]
struct ImageRow {
    name: String,
    size: String,
    modified: String,
}

/// Print the cache contents as a table with a size total.
pub fn list_cached(cache_dir: &Path) -> Result<(), VmlabError> {
    let images = cached_images(cache_dir)?;
    if images.is_empty() {
        println!("No cached images.");
        return Ok(());
    }

    let rows: Vec<ImageRow> = images
        .iter()
        .map(|img| ImageRow {
            name: img.name.clone(),
            size: format_size(img.size),
            modified: img
                .modified
                .map(format_age)
                .unwrap_or_else(|| "unknown".into()),
        })
        .collect();
    let mut table = Table::new(&rows);
    table.with(Style::modern_rounded());
    println!("{table}");

    let total: u64 = images.iter().map(|i| i.size).sum();
    println!("{} image(s), {} total", images.len(), format_size(total));
    Ok(())
}

/// Delete a specific cached image by filename.
pub fn delete_cached(cache_dir: &Path, name: &str) -> Result<(), VmlabError> {
    let images = cached_images(cache_dir)?;
    let Some(img) = images.iter().find(|i| i.name == name) else {
        return Err(VmlabError::Io {
            context: format!(
                "cached image '{}' not found in {}",
                name,
                cache_dir.display()
            ),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        });
    };
    std::fs::remove_file(&img.path).map_err(|e| VmlabError::Io {
        context: format!("deleting {}", img.path.display()),
        source: e,
    })?;
    println!("Deleted '{}' ({})", img.name, format_size(img.size));
    Ok(())
}

/// Delete every cached image, reporting the bytes freed.
pub fn clear_cache(cache_dir: &Path) -> Result<(), VmlabError> {
    let images = cached_images(cache_dir)?;
    if images.is_empty() {
        println!("No cached images.");
        return Ok(());
    }

    let mut freed = 0;
    for img in &images {
        std::fs::remove_file(&img.path).map_err(|e| VmlabError::Io {
            context: format!("deleting {}", img.path.display()),
            source: e,
        })?;
        freed += img.size;
    }
    println!("Deleted {} image(s) ({})", images.len(), format_size(freed));
    Ok(())
}

fn format_age(modified: SystemTime) -> String {
    let secs = SystemTime::now()
        .duration_since(modified)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 || unit == "GB" {
            return if unit == "B" {
                format!("{bytes} B")
            } else {
                format!("{value:.1} {unit}")
            };
        }
        value /= 1024.0;
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_url_prefers_template_url() {
        let template = Template {
            name: "custom".into(),
            os: "ubuntu".into(),
            version: "24.04".into(),
            cloud_image_url: "https://example.com/custom.qcow2".into(),
            ..Template::default()
        };
        assert_eq!(
            resolve_url(&template).unwrap(),
            "https://example.com/custom.qcow2"
        );
    }

    #[test]
    fn resolve_url_uses_builtin_table() {
        let template = Template {
            name: "debian-12".into(),
            os: "debian".into(),
            version: "12".into(),
            ..Template::default()
        };
        assert!(resolve_url(&template).unwrap().contains("bookworm"));
    }

    #[test]
    fn resolve_url_unknown_os_is_an_error() {
        let template = Template {
            name: "plan9".into(),
            os: "plan9".into(),
            version: "4".into(),
            ..Template::default()
        };
        assert!(resolve_url(&template).is_err());
    }

    #[tokio::test]
    async fn failed_download_leaves_no_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("noble-server-cloudimg-amd64.img");
        let partial = dest.with_extension("part");
        std::fs::write(&partial, b"truncated bytes").unwrap();

        let err = finalize_download(
            Err(VmlabError::ImageDownload {
                message: "connection reset".into(),
                source: "reset".to_string().into(),
            }),
            &partial,
            &dest,
        )
        .await;

        assert!(err.is_err());
        assert!(!partial.exists());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn completed_download_is_promoted_from_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("image.img");
        let partial = dest.with_extension("part");
        std::fs::write(&partial, b"full image").unwrap();

        finalize_download(Ok(()), &partial, &dest).await.unwrap();
        assert!(!partial.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"full image");
    }

    #[test]
    fn cached_images_skips_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cached_images(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn cached_images_sorted_with_sizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zz.img"), b"abcd").unwrap();
        std::fs::write(dir.path().join("aa.img"), b"ab").unwrap();
        let images = cached_images(dir.path()).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name, "aa.img");
        assert_eq!(images[0].size, 2);
        assert_eq!(images[1].name, "zz.img");
    }

    #[test]
    fn delete_missing_cached_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(delete_cached(dir.path(), "nope.img").is_err());
    }

    #[test]
    fn clear_empty_cache_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        clear_cache(dir.path()).unwrap();
        clear_cache(&dir.path().join("missing")).unwrap();
    }

    #[test]
    fn clear_removes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.img"), b"x").unwrap();
        std::fs::write(dir.path().join("b.img"), b"y").unwrap();
        clear_cache(dir.path()).unwrap();
        assert!(cached_images(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn format_size_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }
}
