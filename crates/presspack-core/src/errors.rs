use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not resolve '{specifier}' from '{from}'")]
    Resolution { specifier: String, from: PathBuf },

    #[error("unknown bundle '{name}'")]
    UnknownBundle { name: String },

    #[error("unknown asset '{id}'")]
    UnknownAsset { id: String },

    #[error("failed to execute '{path}': {message}")]
    Execution { path: PathBuf, message: String },

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("failed to load contents for '{id}': {message}")]
    Fetch { id: String, message: String },

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rquickjs::Error> for LoadError {
    fn from(err: rquickjs::Error) -> Self {
        LoadError::Engine(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;
