use eptun_cidr::CidrRoute;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no IPv4 default route found")]
    NoDefaultRouteV4,
    #[error("no IPv6 default route found")]
    NoDefaultRouteV6,
    #[error("no interface named {0:?} was found")]
    InterfaceNotFound(String),
    #[error("failed to add route {cidr}: {cause}")]
    AddFailed { cidr: CidrRoute, cause: String },
    #[error("route {cidr} already exists")]
    AlreadyExists { cidr: CidrRoute },
    #[error("failed to delete route {cidr}: {cause}")]
    DeleteFailed { cidr: CidrRoute, cause: String },
    #[error("command {command:?} exited with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to run command {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
