//! Native IP Helper route-table calls, grounded on the teacher's
//! `tun_device_manager::windows` module. Preferred over the CLI path;
//! the manager falls back to CLI for the remainder of the session the
//! first time this returns an error other than `AlreadyExists`, which it
//! instead handles with its own delete-then-retry logic.

#![cfg(windows)]

use crate::error::RoutingError;
use eptun_cidr::CidrRoute;
use std::net::IpAddr;
use windows::Win32::NetworkManagement::IpHelper::{
    CreateIpForwardEntry2, DeleteIpForwardEntry2, InitializeIpForwardEntry, GetBestRoute2,
    MIB_IPFORWARD_ROW2,
};
use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6, SOCKADDR_INET};

const DUPLICATE_ERR: u32 = 0x8007_1392;

pub fn add_route(route: &CidrRoute, gateway: Option<IpAddr>, iface_index: u32, metric: u32) -> Result<(), RoutingError> {
    let entry = forward_entry(route, gateway, iface_index, metric);
    match unsafe { CreateIpForwardEntry2(&entry) }.ok() {
        Ok(()) => Ok(()),
        Err(e) if (e.code().0 as u32) == DUPLICATE_ERR => Err(RoutingError::AlreadyExists { cidr: route.clone() }),
        Err(e) => Err(RoutingError::AddFailed {
            cidr: route.clone(),
            cause: e.to_string(),
        }),
    }
}

pub fn delete_route(route: &CidrRoute, gateway: Option<IpAddr>, iface_index: u32, metric: u32) -> Result<(), RoutingError> {
    let entry = forward_entry(route, gateway, iface_index, metric);
    unsafe { DeleteIpForwardEntry2(&entry) }
        .ok()
        .map_err(|e| RoutingError::DeleteFailed {
            cidr: route.clone(),
            cause: e.to_string(),
        })
}

fn forward_entry(route: &CidrRoute, gateway: Option<IpAddr>, iface_index: u32, metric: u32) -> MIB_IPFORWARD_ROW2 {
    let mut row = MIB_IPFORWARD_ROW2::default();
    unsafe { InitializeIpForwardEntry(&mut row) };

    row.InterfaceIndex = iface_index;
    // Some systems reject very low metrics on this struct's Metric field.
    row.Metric = metric.max(256);

    match route.network() {
        IpAddr::V4(v4) => {
            row.DestinationPrefix.PrefixLength = route.prefix_len();
            row.DestinationPrefix.Prefix.si_family = AF_INET;
            row.DestinationPrefix.Prefix.Ipv4.sin_family = AF_INET;
            row.DestinationPrefix.Prefix.Ipv4.sin_addr = v4.into();
        }
        IpAddr::V6(v6) => {
            row.DestinationPrefix.PrefixLength = route.prefix_len();
            row.DestinationPrefix.Prefix.si_family = AF_INET6;
            row.DestinationPrefix.Prefix.Ipv6.sin6_family = AF_INET6;
            row.DestinationPrefix.Prefix.Ipv6.sin6_addr = v6.into();
        }
    }

    if let Some(gw) = gateway {
        match gw {
            IpAddr::V4(v4) => {
                row.NextHop.si_family = AF_INET;
                row.NextHop.Ipv4.sin_family = AF_INET;
                row.NextHop.Ipv4.sin_addr = v4.into();
            }
            IpAddr::V6(v6) => {
                row.NextHop.si_family = AF_INET6;
                row.NextHop.Ipv6.sin6_family = AF_INET6;
                row.NextHop.Ipv6.sin6_addr = v6.into();
            }
        }
    }

    row
}

/// The best local interface index to reach `dst`, used to resolve a
/// gateway address into an interface index before calling
/// `CreateIpForwardEntry2`.
pub fn best_interface_for(dst: IpAddr) -> Result<u32, RoutingError> {
    use std::mem::MaybeUninit;

    let sockaddr: SOCKADDR_INET = std::net::SocketAddr::from((dst, 0)).into();
    let mut best_route: MaybeUninit<MIB_IPFORWARD_ROW2> = MaybeUninit::zeroed();
    let mut best_src: MaybeUninit<SOCKADDR_INET> = MaybeUninit::zeroed();

    let result: Result<(), windows::core::Error> = unsafe {
        GetBestRoute2(
            None,
            0,
            None,
            &sockaddr,
            0,
            best_route.as_mut_ptr(),
            best_src.as_mut_ptr(),
        )
    };

    result.map_err(|e| RoutingError::AddFailed {
        cidr: CidrRoute::new(dst, if matches!(dst, IpAddr::V4(_)) { 32 } else { 128 })
            .unwrap_or_else(|_| CidrRoute::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0).unwrap()),
        cause: e.to_string(),
    })?;

    let route = unsafe { best_route.assume_init() };
    Ok(route.InterfaceIndex)
}
