use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("helper executable not found: tried {tried:?}")]
    NotFound { tried: Vec<PathBuf> },
    #[error("companion library missing and could not be copied to {target}: {source}")]
    CompanionLibraryMissing {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("helper process exited before startup completed, code {code:?}")]
    ExitedEarly { code: Option<i32> },
}
