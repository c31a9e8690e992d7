//! Resolver configuration for the tunnel.
//!
//! All mutations go through the platform DNS script and are serialised by a
//! process-wide mutex holding the last-applied settings, so a redundant
//! `set_manual` is a no-op and `delete_manual` reverses exactly what was
//! installed.

use std::net::IpAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::platform::{self, Exec};

#[derive(Debug, Error)]
pub enum Error {
    #[error("DNS-over-HTTPS requires a template URL")]
    DohTemplateMissing,
    #[error("DNS-over-TLS is not supported on this platform")]
    DotUnsupported,
    #[error("resolver address family does not match the session (IPv6 disabled)")]
    IpFamilyMismatch,
    #[error(transparent)]
    Platform(#[from] platform::Error),
    #[error("DNS bridge panicked: {0}")]
    BridgePanic(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encryption {
    Plain,
    Dot,
    Doh,
}

#[derive(Clone, Copy, Debug)]
pub struct EncryptionAbilities {
    pub doh: bool,
    pub dot: bool,
}

/// What the OS can do. DoH rides on the script; DoT has no system hook on
/// either platform family.
#[cfg(target_os = "macos")]
pub fn encryption_abilities() -> EncryptionAbilities {
    EncryptionAbilities { doh: true, dot: false }
}

/// See the macOS variant; the script path on this platform family speaks
/// plain DNS only.
#[cfg(not(target_os = "macos"))]
pub fn encryption_abilities() -> EncryptionAbilities {
    EncryptionAbilities { doh: false, dot: false }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsSettings {
    ip: IpAddr,
    encryption: Encryption,
    doh_template: Option<String>,
}

impl DnsSettings {
    pub fn new(ip: IpAddr, encryption: Encryption, doh_template: Option<String>) -> Result<Self, Error> {
        match encryption {
            Encryption::Doh if doh_template.is_none() => return Err(Error::DohTemplateMissing),
            Encryption::Dot if !encryption_abilities().dot => return Err(Error::DotUnsupported),
            _ => (),
        }
        Ok(DnsSettings {
            ip,
            encryption,
            doh_template,
        })
    }

    pub fn plain(ip: IpAddr) -> Self {
        DnsSettings {
            ip,
            encryption: Encryption::Plain,
            doh_template: None,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    fn script_env(&self, vpn_interface: Option<&str>, local_ifaces: &[String]) -> Vec<(String, String)> {
        let encryption = match self.encryption {
            Encryption::Plain => "plain",
            Encryption::Dot => "dot",
            Encryption::Doh => "doh",
        };
        vec![
            ("SUMMITVPN_DNS_IP".to_string(), self.ip.to_string()),
            ("SUMMITVPN_DNS_ENCRYPTION".to_string(), encryption.to_string()),
            (
                "SUMMITVPN_DNS_DOH_TEMPLATE".to_string(),
                self.doh_template.clone().unwrap_or_default(),
            ),
            (
                "SUMMITVPN_VPN_IFACE".to_string(),
                vpn_interface.unwrap_or_default().to_string(),
            ),
            ("SUMMITVPN_LOCAL_IFACES".to_string(), local_ifaces.join(" ")),
        ]
    }
}

#[derive(Debug)]
struct Applied {
    settings: DnsSettings,
    vpn_interface: Option<String>,
    local_ifaces: Vec<String>,
}

/// Last applied resolver settings. One cell per process; every mutation runs
/// with this lock held.
static LAST_APPLIED: Mutex<Option<Applied>> = Mutex::new(None);

fn last_applied() -> MutexGuard<'static, Option<Applied>> {
    LAST_APPLIED.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct DnsManager<E: Exec> {
    exec: E,
}

impl<E: Exec> DnsManager<E> {
    pub fn new(exec: E) -> Self {
        DnsManager { exec }
    }

    /// Apply resolver settings. When the resolver lives in a directly
    /// attached network, the script is additionally pointed at every non-VPN
    /// interface holding that network so local lookups keep working.
    pub fn set_manual(
        &self,
        settings: &DnsSettings,
        vpn_interface: Option<&str>,
        ipv6_enabled: bool,
    ) -> Result<(), Error> {
        if settings.ip.is_ipv6() && !ipv6_enabled {
            return Err(Error::IpFamilyMismatch);
        }

        let mut last = last_applied();
        if last.as_ref().is_some_and(|a| a.settings == *settings) {
            tracing::debug!(ip = %settings.ip, "resolver settings already applied");
            return Ok(());
        }

        let local_ifaces = self.resolver_local_interfaces(settings, vpn_interface)?;
        let envs = settings.script_env(vpn_interface, &local_ifaces);

        self.invoke(&["-up_set_dns"], &envs)?;

        if let IpAddr::V6(ip6) = settings.ip {
            let ip6 = ip6.to_string();
            for iface in &local_ifaces {
                self.invoke(&["-up_init_ipv6_resolver", &ip6, iface], &envs)?;
            }
        }

        tracing::info!(ip = %settings.ip, ?local_ifaces, "resolver settings applied");
        *last = Some(Applied {
            settings: settings.clone(),
            vpn_interface: vpn_interface.map(str::to_string),
            local_ifaces,
        });
        Ok(())
    }

    /// Reverse exactly what `set_manual` installed. No-op when nothing is
    /// applied.
    pub fn delete_manual(&self) -> Result<(), Error> {
        let mut last = last_applied();
        let Some(applied) = last.as_ref() else {
            tracing::debug!("no resolver settings applied, nothing to restore");
            return Ok(());
        };

        let envs = applied
            .settings
            .script_env(applied.vpn_interface.as_deref(), &applied.local_ifaces);
        self.invoke(&["-down"], &envs)?;

        tracing::info!("resolver settings restored");
        *last = None;
        Ok(())
    }

    /// The lifecycle rebuilds DNS on reconnect, so suspending is a no-op on
    /// these platforms.
    pub fn pause(&self) -> Result<(), Error> {
        Ok(())
    }

    /// See [`DnsManager::pause`].
    pub fn resume(&self) -> Result<(), Error> {
        Ok(())
    }

    fn resolver_local_interfaces(
        &self,
        settings: &DnsSettings,
        vpn_interface: Option<&str>,
    ) -> Result<Vec<String>, Error> {
        let resolver = settings.ip;
        let mut ifaces: Vec<String> = Vec::new();
        for net in platform::local_networks(&self.exec)? {
            if Some(net.interface.as_str()) == vpn_interface {
                continue;
            }
            if net.contains(&resolver) && !ifaces.contains(&net.interface) {
                ifaces.push(net.interface);
            }
        }
        Ok(ifaces)
    }

    fn invoke(&self, args: &[&str], envs: &[(String, String)]) -> Result<(), Error> {
        let script = platform::dns_script_path();
        let res = catch_unwind(AssertUnwindSafe(|| self.exec.run_with_env(&script, args, envs)));
        match res {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(Error::BridgePanic(msg))
            }
        }
    }
}

/// Tests share the process-wide cell; serialise them and start from a clean
/// slate.
#[cfg(test)]
pub(crate) fn test_guard() -> MutexGuard<'static, ()> {
    static TEST_LOCK: Mutex<()> = Mutex::new(());
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    *last_applied() = None;
    guard
}
