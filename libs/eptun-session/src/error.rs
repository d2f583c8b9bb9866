use eptun_cidr::CidrRoute;
use std::path::PathBuf;

/// The single typed error surface the engine's caller sees. Every
/// variant here is fatal; collaborator-level failures that are merely
/// warnings (HTTP, DNS, GeoIP) never reach this type — they're logged
/// and the call site substitutes the documented fallback.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid config field `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },
    #[error("proxy endpoint {uri} was not reachable")]
    ProxyUnreachable { uri: String },
    #[error("helper executable not found: tried {tried:?}")]
    HelperNotFound { tried: Vec<PathBuf> },
    #[error("companion library missing: {path}")]
    CompanionLibraryMissing { path: PathBuf },
    #[error("helper exited before startup completed, code {code:?}")]
    HelperExitedEarly { code: Option<i32> },
    #[error("helper process failed, code {code:?}")]
    HelperFailed { code: Option<i32> },
    #[error("failed to configure TUN interface: {cause}")]
    TunConfigureFailed { cause: String },
    #[error("failed to add route {cidr}: {cause}")]
    RouteAddFailed { cidr: CidrRoute, cause: String },
}

impl From<eptun_config::ConfigError> for SessionError {
    fn from(e: eptun_config::ConfigError) -> Self {
        match e {
            eptun_config::ConfigError::Invalid { field, reason } => SessionError::InvalidConfig {
                field: field.to_string(),
                reason,
            },
            other => SessionError::InvalidConfig {
                field: "config".to_string(),
                reason: other.to_string(),
            },
        }
    }
}
