use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::VmlabError;

/// An OS template: one YAML file per template in the template store.
///
/// The file name derives from the template name (`<name>.yaml`), which
/// keeps names unique per store.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Template {
    #[facet(default)]
    pub name: String,
    #[facet(default)]
    pub os: String,
    #[facet(default)]
    pub version: String,
    #[facet(default = "hvm")]
    pub os_type: String,
    #[facet(default)]
    pub os_variant: String,
    #[facet(default = "x86_64")]
    pub arch: String,
    #[facet(default = "hd")]
    pub boot: String,
    #[facet(default)]
    pub description: String,
    /// Whether a pre-installed cloud image can seed the disk.
    #[facet(default)]
    pub cloud_image: bool,
    /// Explicit cloud image URL; empty means "use the built-in table".
    #[facet(default)]
    pub cloud_image_url: String,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            name: String::new(),
            os: String::new(),
            version: String::new(),
            os_type: "hvm".into(),
            os_variant: String::new(),
            arch: "x86_64".into(),
            boot: "hd".into(),
            description: String::new(),
            cloud_image: false,
            cloud_image_url: String::new(),
        }
    }
}

/// On-disk template store: a directory of `<name>.yaml` files.
pub struct TemplateStore {
    dir: PathBuf,
    templates: BTreeMap<String, Template>,
}

impl TemplateStore {
    /// Open the store, loading every readable template. Unreadable files
    /// are skipped with a warning — one broken template must not take
    /// down `template list`.
    pub fn open(dir: &Path) -> Result<Self, VmlabError> {
        std::fs::create_dir_all(dir).map_err(|e| VmlabError::Io {
            context: format!("creating templates directory {}", dir.display()),
            source: e,
        })?;

        let mut templates = BTreeMap::new();
        let entries = std::fs::read_dir(dir).map_err(|e| VmlabError::Io {
            context: format!("reading templates directory {}", dir.display()),
            source: e,
        })?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            match load_template(&path) {
                Ok(template) => {
                    let name = if template.name.is_empty() {
                        path.file_stem()
                            .and_then(|s| s.to_str())
                            .unwrap_or_default()
                            .to_string()
                    } else {
                        template.name.clone()
                    };
                    templates.insert(name, template);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable template: {e}");
                }
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            templates,
        })
    }

    /// All templates, sorted by name.
    pub fn list(&self) -> Vec<&Template> {
        self.templates.values().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    /// Create or update a template — writes `<name>.yaml` and updates
    /// the in-memory map.
    pub fn create(&mut self, mut template: Template) -> Result<(), VmlabError> {
        if template.name.is_empty() {
            return Err(VmlabError::Validation {
                message: "template name must not be empty".into(),
            });
        }
        if template.os_variant.is_empty() {
            template.os_variant = format!("{}{}", template.os, template.version);
        }
        if template.description.is_empty() {
            template.description = format!("{} {}", template.os, template.version);
        }

        let path = self.dir.join(format!("{}.yaml", template.name));
        let yaml = facet_yaml::to_string(&template).map_err(|e| VmlabError::TemplateParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, yaml).map_err(|e| VmlabError::Io {
            context: format!("writing template {}", path.display()),
            source: e,
        })?;

        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Delete a template file. Returns false when it did not exist.
    pub fn delete(&mut self, name: &str) -> Result<bool, VmlabError> {
        let path = self.dir.join(format!("{name}.yaml"));
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).map_err(|e| VmlabError::Io {
            context: format!("deleting template {}", path.display()),
            source: e,
        })?;
        self.templates.remove(name);
        Ok(true)
    }

    /// Write the built-in default templates for common OS versions.
    pub fn write_defaults(&mut self) -> Result<(), VmlabError> {
        for template in default_templates() {
            self.create(template)?;
        }
        Ok(())
    }
}

fn load_template(path: &Path) -> Result<Template, VmlabError> {
    let contents = std::fs::read_to_string(path).map_err(|e| VmlabError::Io {
        context: format!("reading template {}", path.display()),
        source: e,
    })?;
    facet_yaml::from_str(&contents).map_err(|e| VmlabError::TemplateParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Built-in templates for the Ubuntu LTS and Debian releases commonly
/// pinned by paper artifacts.
pub fn default_templates() -> Vec<Template> {
    let ubuntu = |version: &str, codename: &str, pretty: &str| Template {
        name: format!("ubuntu-{version}"),
        os: "ubuntu".into(),
        version: version.into(),
        os_variant: format!("ubuntu{version}"),
        description: format!("Ubuntu {version} LTS ({pretty})"),
        cloud_image: true,
        cloud_image_url: format!(
            "https://cloud-images.ubuntu.com/{codename}/current/{codename}-server-cloudimg-amd64.img"
        ),
        ..Template::default()
    };
    let debian = |version: &str, codename: &str, pretty: &str| Template {
        name: format!("debian-{version}"),
        os: "debian".into(),
        version: version.into(),
        os_variant: format!("debian{version}"),
        description: format!("Debian {version} ({pretty})"),
        cloud_image: true,
        cloud_image_url: format!(
            "https://cloud.debian.org/images/cloud/{codename}/latest/debian-{version}-generic-amd64.qcow2"
        ),
        ..Template::default()
    };

    vec![
        ubuntu("20.04", "focal", "Focal Fossa"),
        ubuntu("22.04", "jammy", "Jammy Jellyfish"),
        ubuntu("24.04", "noble", "Noble Numbat"),
        debian("11", "bullseye", "Bullseye"),
        debian("12", "bookworm", "Bookworm"),
        debian("13", "trixie", "Trixie"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> TemplateStore {
        TemplateStore::open(dir.path()).unwrap()
    }

    #[test]
    fn create_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store
            .create(Template {
                name: "fedora-41".into(),
                os: "fedora".into(),
                version: "41".into(),
                ..Template::default()
            })
            .unwrap();

        // Reopen to force a read from disk
        let store = open_store(&dir);
        let t = store.get("fedora-41").unwrap();
        assert_eq!(t.os, "fedora");
        assert_eq!(t.os_variant, "fedora41");
        assert_eq!(t.description, "fedora 41");
        assert_eq!(t.arch, "x86_64");
        assert_eq!(t.boot, "hd");
        assert!(!t.cloud_image);
    }

    #[test]
    fn create_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        assert!(store.create(Template::default()).is_err());
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store
            .create(Template {
                name: "gone".into(),
                os: "ubuntu".into(),
                version: "24.04".into(),
                ..Template::default()
            })
            .unwrap();
        assert!(store.delete("gone").unwrap());
        assert!(!dir.path().join("gone.yaml").exists());
        assert!(!store.delete("gone").unwrap());
    }

    #[test]
    fn defaults_cover_ubuntu_and_debian() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.write_defaults().unwrap();

        let store = open_store(&dir);
        let names: Vec<&str> = store.list().iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"ubuntu-24.04"));
        assert!(names.contains(&"debian-12"));
        for t in store.list() {
            assert!(t.cloud_image);
            assert!(t.cloud_image_url.starts_with("https://"));
        }
    }

    #[test]
    fn unreadable_template_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "os: [unclosed").unwrap();
        let mut store = open_store(&dir);
        store
            .create(Template {
                name: "ok".into(),
                os: "debian".into(),
                version: "12".into(),
                ..Template::default()
            })
            .unwrap();

        let store = open_store(&dir);
        assert!(store.get("ok").is_some());
        assert!(store.get("broken").is_none());
    }

    #[test]
    fn list_is_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        for name in ["zeta", "alpha", "mid"] {
            store
                .create(Template {
                    name: name.into(),
                    os: "ubuntu".into(),
                    version: "24.04".into(),
                    ..Template::default()
                })
                .unwrap();
        }
        let names: Vec<&str> = store.list().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }
}
