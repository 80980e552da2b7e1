use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("No job template found for style '{style}' in {dir}")]
    TemplateNotFound { style: String, dir: PathBuf },

    #[error("Unknown style: {0}")]
    UnknownStyle(String),

    #[error("Style catalog is empty")]
    EmptyCatalog,

    #[error("Invalid template {path}: {source}")]
    InvalidTemplate {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
