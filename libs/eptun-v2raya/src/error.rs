#[derive(Debug, thiserror::Error)]
pub enum V2rayaError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}: {body_preview}")]
    HttpStatus {
        url: String,
        status: u16,
        body_preview: String,
    },
    #[error("login failed with code {code:?}: {message}")]
    LoginFailed { code: Option<String>, message: String },
    #[error("unexpected response shape at {path}")]
    Shape { path: &'static str },
    #[error("no reachable proxy endpoint was found among the configured ports")]
    NoReachablePort,
}
