use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmlabError {
    #[error("failed to load settings from {path}")]
    SettingsLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings from {path}: {message}")]
    SettingsParse { path: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("libvirt error: {message}")]
    #[diagnostic(help("{hint}"))]
    Libvirt { message: String, hint: String },

    #[error("domain '{name}' not found")]
    #[diagnostic(help("run `vmlab vm list` to see defined VMs"))]
    DomainNotFound { name: String },

    #[error("template '{name}' not found")]
    #[diagnostic(help("run `vmlab template list` to see available templates"))]
    TemplateNotFound { name: String },

    #[error("failed to parse template {path}: {message}")]
    TemplateParse { path: String, message: String },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("failed to download cloud image: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("validation error: {message}")]
    Validation { message: String },
}
