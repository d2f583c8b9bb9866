//! Composes the native and CLI route backends behind one capability, and
//! keeps the session-scoped managed-route list used for LIFO teardown.

use crate::cli;
use crate::error::RoutingError;
use crate::model::{DefaultRouteV4, DefaultRouteV6, ManagedRoute};
use eptun_cidr::{CidrRoute, Family};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

pub struct RouteManager {
    #[cfg(windows)]
    native_disabled: AtomicBool,
    #[cfg(not(windows))]
    _native_disabled: AtomicBool,
    iface_cache: Mutex<HashMap<IpAddr, u32>>,
    managed: Mutex<Vec<ManagedRoute>>,
    suppress_per_route_logs: bool,
}

impl Default for RouteManager {
    fn default() -> Self {
        Self::new(false)
    }
}

impl RouteManager {
    pub fn new(suppress_per_route_logs: bool) -> Self {
        Self {
            #[cfg(windows)]
            native_disabled: AtomicBool::new(false),
            #[cfg(not(windows))]
            _native_disabled: AtomicBool::new(false),
            iface_cache: Mutex::new(HashMap::new()),
            managed: Mutex::new(Vec::new()),
            suppress_per_route_logs,
        }
    }

    pub async fn read_default_v4(&self) -> Result<DefaultRouteV4, RoutingError> {
        let output = cli::run("route", &["print", "-4"]).await?;
        cli::parse_default_v4(&output.stdout).ok_or(RoutingError::NoDefaultRouteV4)
    }

    pub async fn read_default_v6(&self) -> Result<DefaultRouteV6, RoutingError> {
        let output = cli::run("route", &["print", "-6"]).await?;
        cli::parse_default_v6(&output.stdout).ok_or(RoutingError::NoDefaultRouteV6)
    }

    pub async fn interface_index_by_name(&self, name: &str) -> Result<u32, RoutingError> {
        let output = cli::run("netsh", &["interface", "ipv4", "show", "interfaces"]).await?;
        cli::parse_interface_index(&output.stdout, name).ok_or_else(|| RoutingError::InterfaceNotFound(name.to_string()))
    }

    fn best_interface_for(&self, gateway: IpAddr) -> Option<u32> {
        if let Some(idx) = self.iface_cache.lock().unwrap().get(&gateway) {
            return Some(*idx);
        }

        #[cfg(windows)]
        {
            if let Ok(idx) = crate::native::best_interface_for(gateway) {
                self.iface_cache.lock().unwrap().insert(gateway, idx);
                return Some(idx);
            }
        }
        #[cfg(not(windows))]
        {
            let _ = gateway;
        }

        None
    }

    /// Adds a route and, on success, appends it to the managed list.
    /// `replace_if_exists` retries once after deleting a duplicate.
    pub async fn add_route(
        &self,
        route: CidrRoute,
        gateway: Option<IpAddr>,
        iface_index: Option<u32>,
        metric: u32,
        replace_if_exists: bool,
    ) -> Result<(), RoutingError> {
        let result = self.add_once(&route, gateway, iface_index, metric).await;

        let result = match result {
            Err(e) if replace_if_exists && is_already_exists(&e) => {
                self.delete_once(&route, gateway, iface_index).await?;
                self.add_once(&route, gateway, iface_index, metric).await
            }
            other => other,
        };

        result?;

        self.managed.lock().unwrap().push(ManagedRoute {
            route: route.clone(),
            gateway,
            iface_index,
        });

        if !self.suppress_per_route_logs {
            info!(%route, "installed route");
        } else {
            let count = self.managed.lock().unwrap().len();
            if count % 500 == 0 {
                info!(count, "installed routes (progress)");
            }
        }

        Ok(())
    }

    async fn add_once(
        &self,
        route: &CidrRoute,
        gateway: Option<IpAddr>,
        iface_index: Option<u32>,
        metric: u32,
    ) -> Result<(), RoutingError> {
        match route.family() {
            Family::V4 => self.add_v4(route, gateway, iface_index, metric).await,
            Family::V6 => self.add_v6_cli(route, gateway, iface_index, metric).await,
        }
    }

    async fn add_v4(
        &self,
        route: &CidrRoute,
        gateway: Option<IpAddr>,
        iface_index: Option<u32>,
        metric: u32,
    ) -> Result<(), RoutingError> {
        #[cfg(windows)]
        {
            if !self.native_disabled.load(Ordering::Relaxed) {
                let resolved_iface = iface_index.or_else(|| gateway.and_then(|gw| self.best_interface_for(gw)));
                if let Some(idx) = resolved_iface {
                    match crate::native::add_route(route, gateway, idx, metric) {
                        Ok(()) => return Ok(()),
                        Err(e @ RoutingError::AlreadyExists { .. }) => return Err(e),
                        Err(e) => {
                            warn!(error = %e, "native route add failed, falling back to CLI for the rest of this session");
                            self.native_disabled.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        let gw = gateway.ok_or_else(|| RoutingError::AddFailed {
            cidr: route.clone(),
            cause: "IPv4 routes require a gateway".to_string(),
        })?;
        let args = [
            "add".to_string(),
            route.to_string(),
            gw.to_string(),
            "metric".to_string(),
            metric.to_string(),
        ];
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = cli::run("route", &arg_refs).await?;
        if !output.success {
            return Err(RoutingError::CommandFailed {
                command: format!("route {}", arg_refs.join(" ")),
                status: None,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    async fn add_v6_cli(
        &self,
        route: &CidrRoute,
        gateway: Option<IpAddr>,
        iface_index: Option<u32>,
        metric: u32,
    ) -> Result<(), RoutingError> {
        if gateway.is_none() && iface_index.is_none() {
            return Err(RoutingError::AddFailed {
                cidr: route.clone(),
                cause: "IPv6 route needs an interface when no gateway is given".to_string(),
            });
        }

        let mut args = vec![
            "interface".to_string(),
            "ipv6".to_string(),
            "add".to_string(),
            "route".to_string(),
            format!("prefix={route}"),
        ];
        if let Some(idx) = iface_index {
            args.push(format!("interface={idx}"));
        }
        if let Some(gw) = gateway {
            args.push(format!("nexthop={gw}"));
        }
        args.push(format!("metric={metric}"));
        args.push("store=active".to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = cli::run("netsh", &arg_refs).await?;
        if !output.success {
            return Err(RoutingError::CommandFailed {
                command: format!("netsh {}", arg_refs.join(" ")),
                status: None,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    async fn delete_once(&self, route: &CidrRoute, gateway: Option<IpAddr>, iface_index: Option<u32>) -> Result<(), RoutingError> {
        match route.family() {
            Family::V4 => self.delete_v4(route, gateway, iface_index).await,
            Family::V6 => self.delete_v6_cli(route, gateway, iface_index).await,
        }
    }

    /// Deletes a route. Failures are warnings to the caller, never fatal —
    /// cleanup is always best-effort.
    pub async fn delete_route(&self, route: &CidrRoute, gateway: Option<IpAddr>, iface_index: Option<u32>) {
        if let Err(e) = self.delete_once(route, gateway, iface_index).await {
            warn!(%route, error = %e, "failed to remove route during cleanup");
        } else {
            info!(%route, "removed route");
        }
    }

    async fn delete_v4(&self, route: &CidrRoute, gateway: Option<IpAddr>, iface_index: Option<u32>) -> Result<(), RoutingError> {
        #[cfg(windows)]
        {
            if !self.native_disabled.load(Ordering::Relaxed) {
                let resolved_iface = iface_index.or_else(|| gateway.and_then(|gw| self.best_interface_for(gw)));
                if let Some(idx) = resolved_iface {
                    if crate::native::delete_route(route, gateway, idx, 0).is_ok() {
                        return Ok(());
                    }
                }
            }
        }

        let args = ["delete".to_string(), route.to_string()];
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = cli::run("route", &arg_refs).await?;
        if !output.success {
            return Err(RoutingError::CommandFailed {
                command: format!("route {}", arg_refs.join(" ")),
                status: None,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    async fn delete_v6_cli(&self, route: &CidrRoute, gateway: Option<IpAddr>, iface_index: Option<u32>) -> Result<(), RoutingError> {
        let mut args = vec![
            "interface".to_string(),
            "ipv6".to_string(),
            "delete".to_string(),
            "route".to_string(),
            format!("prefix={route}"),
        ];
        if let Some(idx) = iface_index {
            args.push(format!("interface={idx}"));
        }
        if let Some(gw) = gateway {
            args.push(format!("nexthop={gw}"));
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = cli::run("netsh", &arg_refs).await?;
        if !output.success {
            return Err(RoutingError::CommandFailed {
                command: format!("netsh {}", arg_refs.join(" ")),
                status: None,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// Removes every managed route in LIFO order. Best-effort: a failure
    /// on one route never stops the rest from being attempted.
    pub async fn teardown_all(&self) {
        let routes: Vec<ManagedRoute> = {
            let mut managed = self.managed.lock().unwrap();
            std::mem::take(&mut *managed)
        };

        for managed in routes.into_iter().rev() {
            self.delete_route(&managed.route, managed.gateway, managed.iface_index).await;
        }
    }

    pub fn managed_count(&self) -> usize {
        self.managed.lock().unwrap().len()
    }
}

/// True for a failed add that means "this route is already installed",
/// whether the native API reported it directly or the CLI's output had to
/// be pattern-matched for it.
fn is_already_exists(e: &RoutingError) -> bool {
    match e {
        RoutingError::AlreadyExists { .. } => true,
        RoutingError::CommandFailed { stderr, .. } => cli::output_indicates_already_exists(stderr),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_with_empty_managed_list() {
        let mgr = RouteManager::new(false);
        assert_eq!(mgr.managed_count(), 0);
    }

    #[test]
    fn recognizes_already_exists_from_either_backend() {
        let cidr = CidrRoute::parse("10.0.0.0/8").unwrap();
        assert!(is_already_exists(&RoutingError::AlreadyExists { cidr: cidr.clone() }));
        assert!(is_already_exists(&RoutingError::CommandFailed {
            command: "route add".to_string(),
            status: None,
            stderr: "The object already exists.".to_string(),
        }));
        assert!(!is_already_exists(&RoutingError::AddFailed {
            cidr,
            cause: "boom".to_string(),
        }));
    }
}
