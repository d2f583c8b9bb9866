use eptun_cidr::CidrRoute;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRouteV4 {
    pub gateway: Ipv4Addr,
    pub iface_address: Ipv4Addr,
    pub metric: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRouteV6 {
    pub gateway: Ipv6Addr,
    pub iface_index: u32,
    pub metric: u32,
}

/// A route this process is responsible for removing on shutdown.
#[derive(Debug, Clone)]
pub struct ManagedRoute {
    pub route: CidrRoute,
    pub gateway: Option<IpAddr>,
    pub iface_index: Option<u32>,
}
