use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("no file loader registered for tag \"{0}\"")]
    UnregisteredTag(String),

    #[error("file loader \"{tag}\" failed on {path:?}: {source:#}")]
    Factory {
        tag: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("async file loader has been stopped")]
    Stopped,
}

impl LoaderError {
    #[inline]
    pub fn is_factory_error(&self) -> bool {
        matches!(self, Self::Factory { .. })
    }
}
