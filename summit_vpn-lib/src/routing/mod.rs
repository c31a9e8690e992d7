//! Route table management for the tunnel.
//!
//! Installs the routes that steer traffic into the tunnel while keeping the
//! VPN server itself reachable through the original gateway, and removes
//! exactly what it installed. Two strategies exist for claiming the default:
//!
//! - **Half-split (`0/1` + `128/1`)**: the original default route stays in
//!   place and is out-prioritised by two more-specific halves.
//! - **Split-default**: the original default is retained but scoped to its
//!   original interface and a new plain default points at the tunnel inner
//!   gateway. This keeps OS subsystems that bind sockets directly to the
//!   primary interface (cloud sync and friends) working while still moving
//!   all routed traffic into the tunnel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::platform::{self, DefaultRoute, Exec, as_strs};

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod bsd;
        use bsd as route_args;
    } else {
        mod linux;
        use linux as route_args;
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Platform(#[from] platform::Error),
}

/// Per-OS default: scoping the original default route is what keeps
/// direct-bound system services alive on macOS; on Linux the half-split pair
/// suffices.
#[cfg(target_os = "macos")]
const SPLIT_DEFAULT: bool = true;
#[cfg(not(target_os = "macos"))]
const SPLIT_DEFAULT: bool = false;

#[derive(Clone, Copy, Debug)]
pub struct RouteConfig {
    pub split_default: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        RouteConfig {
            split_default: SPLIT_DEFAULT,
        }
    }
}

/// What the route manager needs to know about the tunnel being set up.
#[derive(Clone, Debug)]
pub struct RouteSpec {
    /// Public IP of the VPN server; pinned to the original gateway so tunnel
    /// packets can still escape.
    pub server_ip: IpAddr,
    /// Inner gateway on the tunnel side.
    pub tunnel_gateway: Ipv4Addr,
    /// Inner IPv6 gateway, when the session carries IPv6.
    pub tunnel_gateway_v6: Option<Ipv6Addr>,
    pub tunnel_interface: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Family {
    V4,
    V6,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Dest {
    Default,
    Cidr(String),
    Host(IpAddr),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Gateway {
    Via(IpAddr),
    /// Gateway pinned to a specific interface (the scoped original default).
    ViaScoped(IpAddr, String),
}

#[derive(Clone, Debug)]
pub(crate) struct Route {
    pub(crate) family: Family,
    pub(crate) dest: Dest,
    pub(crate) gateway: Gateway,
}

/// One mutation the manager performed, recorded before the next one begins so
/// teardown can reverse exactly what was installed.
#[derive(Debug)]
enum Installed {
    Added(Route),
    /// The plain original default was deleted as part of the split-default
    /// strategy; the inverse re-adds it.
    RemovedOriginalDefault { gateway: IpAddr },
}

/// The set of routes the manager installed, in installation order.
#[derive(Debug, Default)]
pub struct RouteSet {
    entries: Vec<Installed>,
}

impl RouteSet {
    /// Whether the split-default strategy was applied.
    pub fn default_route_updated(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, Installed::RemovedOriginalDefault { .. }))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct RouteManager<E: Exec> {
    exec: E,
    config: RouteConfig,
}

impl<E: Exec> RouteManager<E> {
    pub fn new(exec: E, config: RouteConfig) -> Self {
        RouteManager { exec, config }
    }

    /// Read the system default route. Fails only when none exists.
    pub fn capture_default(&self) -> Result<DefaultRoute, Error> {
        Ok(platform::default_route(&self.exec)?)
    }

    /// Install the tunnel routes. Each route is recorded in the returned set
    /// before the next mutation begins; partial failure rolls everything
    /// back in reverse order.
    pub fn install(&self, spec: &RouteSpec, default: &DefaultRoute) -> Result<RouteSet, Error> {
        tracing::debug!(
            iface = %spec.tunnel_interface,
            gateway = %default.gateway,
            split_default = self.config.split_default,
            "installing tunnel routes"
        );
        let mut set = RouteSet::default();
        let tunnel_gw = IpAddr::V4(spec.tunnel_gateway);

        let res = (|| -> Result<(), Error> {
            if self.config.split_default {
                // retain the original default, scoped to its interface
                self.add(
                    &mut set,
                    Route {
                        family: Family::V4,
                        dest: Dest::Default,
                        gateway: Gateway::ViaScoped(default.gateway, default.interface.clone()),
                    },
                )?;
                // drop the plain original default
                set.entries.push(Installed::RemovedOriginalDefault {
                    gateway: default.gateway,
                });
                self.delete(&Route {
                    family: Family::V4,
                    dest: Dest::Default,
                    gateway: Gateway::Via(default.gateway),
                })?;
                // the tunnel takes over as the plain default
                self.add(
                    &mut set,
                    Route {
                        family: Family::V4,
                        dest: Dest::Default,
                        gateway: Gateway::Via(tunnel_gw),
                    },
                )?;
            } else {
                self.add(
                    &mut set,
                    Route {
                        family: Family::V4,
                        dest: Dest::Cidr("0.0.0.0/1".into()),
                        gateway: Gateway::Via(tunnel_gw),
                    },
                )?;
            }

            // keep the VPN server reachable through the original gateway
            self.add(
                &mut set,
                Route {
                    family: family_of(&spec.server_ip),
                    dest: Dest::Host(spec.server_ip),
                    gateway: Gateway::Via(default.gateway),
                },
            )?;

            self.add(
                &mut set,
                Route {
                    family: Family::V4,
                    dest: Dest::Cidr("128.0.0.0/1".into()),
                    gateway: Gateway::Via(tunnel_gw),
                },
            )?;

            if let Some(gw6) = spec.tunnel_gateway_v6 {
                for dest in ["::/1", "8000::/1"] {
                    self.add(
                        &mut set,
                        Route {
                            family: Family::V6,
                            dest: Dest::Cidr(dest.into()),
                            gateway: Gateway::Via(IpAddr::V6(gw6)),
                        },
                    )?;
                }
            }
            Ok(())
        })();

        match res {
            Ok(()) => Ok(set),
            Err(e) => {
                tracing::warn!(error = %e, "route installation failed, rolling back");
                self.remove(set);
                Err(e)
            }
        }
    }

    /// Remove an installed route set in reverse order. Failures are logged
    /// and skipped so cleanup always completes. On the split-default path the
    /// reverse order re-adds the plain original default before the scoped
    /// copy is deleted; a standalone scoped default stops forwarding.
    pub fn remove(&self, set: RouteSet) {
        for entry in set.entries.into_iter().rev() {
            let res = match &entry {
                Installed::Added(route) => self.delete(route),
                Installed::RemovedOriginalDefault { gateway } => self
                    .exec
                    .run(route_args::tool(), &as_strs(&route_args::add(&Route {
                        family: Family::V4,
                        dest: Dest::Default,
                        gateway: Gateway::Via(*gateway),
                    })))
                    .map(|_| ())
                    .map_err(Error::from),
            };
            if let Err(error) = res {
                tracing::warn!(%error, ?entry, "failed to reverse route entry, continuing anyway");
            }
        }
    }

    /// Re-read the system default and, when the underlying gateway moved,
    /// tear the set down and re-install it against the new default. Returns
    /// whether a reinstall happened.
    pub fn reconcile_on_default_change(
        &self,
        spec: &RouteSpec,
        set: &mut RouteSet,
        captured: &mut DefaultRoute,
    ) -> Result<bool, Error> {
        let observed = platform::default_route(&self.exec)?;
        let expected: IpAddr = if set.default_route_updated() {
            IpAddr::V4(spec.tunnel_gateway)
        } else {
            captured.gateway
        };
        if observed.gateway == expected {
            return Ok(false);
        }
        tracing::info!(old = %captured.gateway, new = %observed.gateway, "default gateway changed, reinstalling routes");

        self.remove(std::mem::take(set));
        *captured = self.capture_default()?;
        *set = self.install(spec, captured)?;
        Ok(true)
    }

    fn add(&self, set: &mut RouteSet, route: Route) -> Result<(), Error> {
        set.entries.push(Installed::Added(route.clone()));
        self.exec.run(route_args::tool(), &as_strs(&route_args::add(&route)))?;
        tracing::debug!(?route, "added route");
        Ok(())
    }

    fn delete(&self, route: &Route) -> Result<(), Error> {
        self.exec.run(route_args::tool(), &as_strs(&route_args::delete(route)))?;
        tracing::debug!(?route, "deleted route");
        Ok(())
    }
}

fn family_of(ip: &IpAddr) -> Family {
    match ip {
        IpAddr::V4(_) => Family::V4,
        IpAddr::V6(_) => Family::V6,
    }
}
