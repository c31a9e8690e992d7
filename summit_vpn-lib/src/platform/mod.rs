//! Platform shim: the only place in the crate that talks to the operating
//! system directly.
//!
//! Components above this module never fork a subprocess themselves; they go
//! through [`Exec`], which production code implements with [`SystemExec`]
//! (absolute paths, argv arrays, no shell interpolation) and tests replace
//! with a recording executor.

use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::shell_command_ext::{self, Logs, ShellCommandExt};

#[cfg(test)]
pub(crate) mod mock;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Shell(#[from] shell_command_ext::Error),
    #[error("command failed [status: {0}]: {1}")]
    Command(i32, String),
    #[error("required tool missing or not executable: {0}")]
    ToolMissing(PathBuf),
    #[error("Unable to determine project directories")]
    ProjectDirs,
    #[error("no default route present")]
    NoDefaultRoute,
}

// ============================================================================
// Tool locations
// ============================================================================

pub const ENV_VAR_WG_TOOL: &str = "SUMMITVPN_WG_TOOL";
pub const ENV_VAR_WG_BINARY: &str = "SUMMITVPN_WG_BINARY";
pub const ENV_VAR_DNS_SCRIPT: &str = "SUMMITVPN_DNS_SCRIPT";

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        const DEFAULT_WG_TOOL: &str = "/usr/local/bin/wg";
        const DEFAULT_WG_BINARY: &str = "/usr/local/bin/wireguard-go";
        const DEFAULT_DNS_SCRIPT: &str = "/Library/Application Support/SummitVPN/dns.sh";
        pub(crate) const ROUTE_TOOL: &str = "/sbin/route";
        pub(crate) const IFCONFIG_TOOL: &str = "/sbin/ifconfig";
        /// Tunnel devices are named `utunN` on this platform.
        pub const TUNNEL_IFACE_PREFIX: &str = "utun";
    } else {
        const DEFAULT_WG_TOOL: &str = "/usr/bin/wg";
        const DEFAULT_WG_BINARY: &str = "/usr/bin/wireguard-go";
        const DEFAULT_DNS_SCRIPT: &str = "/opt/summitvpn/dns.sh";
        pub(crate) const IP_TOOL: &str = "/sbin/ip";
        /// Tunnel devices are named `wgN` on this platform.
        pub const TUNNEL_IFACE_PREFIX: &str = "wg";
    }
}

fn env_or(var: &str, default: &str) -> PathBuf {
    match std::env::var(var) {
        Ok(p) => PathBuf::from(p),
        Err(_) => PathBuf::from(default),
    }
}

pub fn wg_tool_path() -> PathBuf {
    env_or(ENV_VAR_WG_TOOL, DEFAULT_WG_TOOL)
}

pub fn wg_binary_path() -> PathBuf {
    env_or(ENV_VAR_WG_BINARY, DEFAULT_WG_BINARY)
}

pub fn dns_script_path() -> PathBuf {
    env_or(ENV_VAR_DNS_SCRIPT, DEFAULT_DNS_SCRIPT)
}

const WG_CONFIG_FILE: &str = "summit0.conf";

const DOMAIN: &str = "net";
const COMPANY: &str = "summitvpn";
const PRODUCT: &str = "summitvpn";

/// Location of the generated WireGuard config file pushed via `wg setconf`.
pub fn wg_config_file_path() -> Result<PathBuf, Error> {
    let p_dirs = directories::ProjectDirs::from(DOMAIN, COMPANY, PRODUCT).ok_or(Error::ProjectDirs)?;
    let cache_dir = p_dirs.cache_dir();
    std::fs::create_dir_all(cache_dir)?;
    Ok(cache_dir.join(WG_CONFIG_FILE))
}

/// Verify the WireGuard tooling this daemon shells out to is present and
/// executable before accepting connect requests.
pub fn check_tooling() -> Result<(), Error> {
    for tool in [wg_tool_path(), wg_binary_path()] {
        let meta = std::fs::metadata(&tool).map_err(|_| Error::ToolMissing(tool.clone()))?;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(Error::ToolMissing(tool));
        }
    }
    // the control tool must actually run, not just exist
    Command::new(wg_tool_path())
        .arg("--version")
        .run(Logs::Suppress)
        .map_err(|_| Error::ToolMissing(wg_tool_path()))?;
    Ok(())
}

// ============================================================================
// Exec seam
// ============================================================================

/// Handle to a long-running child process (the userspace WireGuard daemon).
///
/// The exit channel delivers the status code exactly once; it is meant for a
/// single consumer.
pub trait ChildProcess: Send {
    /// Lines read from the child's stdout and stderr.
    fn output_lines(&self) -> crossbeam_channel::Receiver<String>;
    /// Receives the exit status code when the process terminates.
    fn exited(&self) -> crossbeam_channel::Receiver<i32>;
    /// Request termination. Idempotent.
    fn kill(&mut self);
}

/// Abstraction over subprocess execution.
///
/// Implementors must be cheaply cloneable (every component holds its own
/// handle).
pub trait Exec: Send + Sync + Clone + 'static {
    /// Run a short-lived command to completion and return its trimmed stdout.
    fn run_with_env(&self, binary: &Path, args: &[&str], envs: &[(String, String)]) -> Result<String, Error>;

    /// Spawn a long-running process.
    fn spawn(&self, binary: &Path, args: &[&str]) -> Result<Box<dyn ChildProcess>, Error>;

    fn run(&self, binary: &Path, args: &[&str]) -> Result<String, Error> {
        self.run_with_env(binary, args, &[])
    }
}

/// Production [`Exec`] backed by `std::process::Command`.
#[derive(Clone)]
pub struct SystemExec;

impl Exec for SystemExec {
    fn run_with_env(&self, binary: &Path, args: &[&str], envs: &[(String, String)]) -> Result<String, Error> {
        let mut cmd = Command::new(binary);
        cmd.args(args);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        let output = cmd.output()?;
        if output.status.success() {
            if !output.stderr.is_empty() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::debug!(binary = %binary.display(), %stderr, "non empty stderr on successful command");
            }
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::debug!(binary = %binary.display(), ?args, status = ?output.status.code(), %stderr, "command failed");
            Err(Error::Command(output.status.code().unwrap_or(-1), stderr))
        }
    }

    fn spawn(&self, binary: &Path, args: &[&str]) -> Result<Box<dyn ChildProcess>, Error> {
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // wireguard-go writes its log (including the readiness marker) to
        // stderr, so both streams feed the same line channel
        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let name = binary.display().to_string();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    tracing::debug!(binary = %name, %line, "child output");
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        let kill_flag = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);
        let waiter_flag = kill_flag.clone();
        thread::spawn(move || {
            let mut kill_sent = false;
            loop {
                if waiter_flag.load(Ordering::SeqCst) && !kill_sent {
                    let _ = child.kill();
                    kill_sent = true;
                }
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let _ = exit_tx.send(status.code().unwrap_or(-1));
                        break;
                    }
                    Ok(None) => thread::sleep(Duration::from_millis(50)),
                    Err(error) => {
                        tracing::warn!(%error, "failed waiting on child process");
                        let _ = exit_tx.send(-1);
                        break;
                    }
                }
            }
        });

        Ok(Box::new(SystemChild {
            line_rx,
            exit_rx,
            kill_flag,
        }))
    }
}

struct SystemChild {
    line_rx: crossbeam_channel::Receiver<String>,
    exit_rx: crossbeam_channel::Receiver<i32>,
    kill_flag: Arc<AtomicBool>,
}

impl ChildProcess for SystemChild {
    fn output_lines(&self) -> crossbeam_channel::Receiver<String> {
        self.line_rx.clone()
    }

    fn exited(&self) -> crossbeam_channel::Receiver<i32> {
        self.exit_rx.clone()
    }

    fn kill(&mut self) {
        self.kill_flag.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// System lookups built on Exec
// ============================================================================

/// Borrow a rendered argv for the `&[&str]` exec interface.
pub(crate) fn as_strs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

/// The system's current default route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: IpAddr,
    pub interface: String,
}

/// An address directly attached to a local interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalNetwork {
    pub interface: String,
    pub addr: IpAddr,
    pub prefix: u8,
}

impl LocalNetwork {
    /// Whether `ip` falls inside this directly attached network.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = match self.prefix {
                    0 => 0,
                    p if p >= 32 => u32::MAX,
                    p => u32::MAX << (32 - p as u32),
                };
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = match self.prefix {
                    0 => 0,
                    p if p >= 128 => u128::MAX,
                    p => u128::MAX << (128 - p as u32),
                };
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {

        pub fn default_route<E: Exec>(exec: &E) -> Result<DefaultRoute, Error> {
            let output = exec.run(Path::new(ROUTE_TOOL), &["-n", "get", "default"])?;
            // the gateway value degrades to "index: N" when a point-to-point
            // default is active, filter that out via the suffix check
            let (interface, gateway) = parse_key_value_output(&output, "interface:", "gateway:", Some(":"))?;
            let gateway = gateway
                .and_then(|gw| gw.parse::<IpAddr>().ok())
                .ok_or(Error::NoDefaultRoute)?;
            Ok(DefaultRoute { gateway, interface })
        }

        pub fn enumerate_tunnel_interfaces<E: Exec>(exec: &E) -> Result<Vec<String>, Error> {
            let output = exec.run(Path::new(IFCONFIG_TOOL), &["-l"])?;
            Ok(filter_tunnel_names(&output))
        }

        pub fn local_networks<E: Exec>(exec: &E) -> Result<Vec<LocalNetwork>, Error> {
            let output = exec.run(Path::new(IFCONFIG_TOOL), &[])?;
            Ok(parse_ifconfig_networks(&output))
        }

    } else {

        pub fn default_route<E: Exec>(exec: &E) -> Result<DefaultRoute, Error> {
            let output = exec.run(Path::new(IP_TOOL), &["route", "show", "default"])?;
            let (interface, gateway) = parse_key_value_output(&output, "dev", "via", None)?;
            let gateway = gateway
                .and_then(|gw| gw.parse::<IpAddr>().ok())
                .ok_or(Error::NoDefaultRoute)?;
            Ok(DefaultRoute { gateway, interface })
        }

        pub fn enumerate_tunnel_interfaces<E: Exec>(exec: &E) -> Result<Vec<String>, Error> {
            let output = exec.run(Path::new(IP_TOOL), &["-o", "link", "show"])?;
            let names = output
                .lines()
                .filter_map(|line| line.split_whitespace().nth(1))
                .map(|name| name.trim_end_matches(':').split('@').next().unwrap_or_default().to_string())
                .collect::<Vec<String>>()
                .join(" ");
            Ok(filter_tunnel_names(&names))
        }

        pub fn local_networks<E: Exec>(exec: &E) -> Result<Vec<LocalNetwork>, Error> {
            let output = exec.run(Path::new(IP_TOOL), &["-o", "addr", "show"])?;
            Ok(parse_ip_addr_networks(&output))
        }

    }
}

/// Keep only names matching the platform tunnel pattern (prefix + index).
fn filter_tunnel_names(names: &str) -> Vec<String> {
    names
        .split_whitespace()
        .filter(|name| {
            name.strip_prefix(TUNNEL_IFACE_PREFIX)
                .is_some_and(|idx| !idx.is_empty() && idx.chars().all(|c| c.is_ascii_digit()))
        })
        .map(str::to_string)
        .collect()
}

/// Parses key-value pairs from command output to extract device and gateway.
///
/// Works for both Linux (`ip route show default`) and macOS
/// (`route -n get default`) command outputs by parameterizing the key names.
pub(crate) fn parse_key_value_output(
    output: &str,
    device_key: &str,
    gateway_key: &str,
    filter_suffix: Option<&str>,
) -> Result<(String, Option<String>), Error> {
    let parts: Vec<&str> = output.split_whitespace().collect();

    let device_index = parts.iter().position(|&x| x == device_key);
    let gateway_index = parts.iter().position(|&x| x == gateway_key);

    let device = match device_index.and_then(|idx| parts.get(idx + 1)) {
        Some(dev) => dev.to_string(),
        None => {
            tracing::debug!(%output, "Unable to determine default interface");
            return Err(Error::NoDefaultRoute);
        }
    };

    let gateway = gateway_index
        .and_then(|idx| parts.get(idx + 1))
        .filter(|gw| filter_suffix.is_none_or(|suffix| !gw.ends_with(suffix)))
        .map(|gw| gw.to_string());

    Ok((device, gateway))
}

#[cfg(any(target_os = "macos", test))]
fn parse_ifconfig_networks(output: &str) -> Vec<LocalNetwork> {
    let mut networks = Vec::new();
    let mut current_iface: Option<String> = None;
    for line in output.lines() {
        if !line.starts_with([' ', '\t']) {
            current_iface = line.split(':').next().map(str::to_string);
            continue;
        }
        let Some(iface) = current_iface.clone() else { continue };
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["inet", addr, "netmask", mask, ..] => {
                let Ok(addr) = addr.parse::<IpAddr>() else { continue };
                let Some(prefix) = parse_hex_netmask(mask) else { continue };
                networks.push(LocalNetwork {
                    interface: iface,
                    addr,
                    prefix,
                });
            }
            ["inet6", addr, "prefixlen", prefix, ..] => {
                let addr = addr.split('%').next().unwrap_or_default();
                let Ok(addr) = addr.parse::<IpAddr>() else { continue };
                let Ok(prefix) = prefix.parse::<u8>() else { continue };
                networks.push(LocalNetwork {
                    interface: iface,
                    addr,
                    prefix,
                });
            }
            _ => (),
        }
    }
    networks
}

#[cfg(any(target_os = "macos", test))]
fn parse_hex_netmask(mask: &str) -> Option<u8> {
    let raw = mask.strip_prefix("0x")?;
    let bits = u32::from_str_radix(raw, 16).ok()?;
    Some(bits.count_ones() as u8)
}

#[cfg(any(not(target_os = "macos"), test))]
fn parse_ip_addr_networks(output: &str) -> Vec<LocalNetwork> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let iface = parts.get(1)?.split('@').next()?.to_string();
            let family = *parts.get(2)?;
            if family != "inet" && family != "inet6" {
                return None;
            }
            let (addr, prefix) = parts.get(3)?.split_once('/')?;
            Some(LocalNetwork {
                interface: iface,
                addr: addr.parse().ok()?,
                prefix: prefix.parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_tunnel_names_by_pattern() {
        let names = format!(
            "lo0 en0 {p}0 {p}4 {p}abc bridge0 {p}12",
            p = TUNNEL_IFACE_PREFIX
        );
        let found = filter_tunnel_names(&names);
        assert_eq!(
            found,
            vec![
                format!("{}0", TUNNEL_IFACE_PREFIX),
                format!("{}4", TUNNEL_IFACE_PREFIX),
                format!("{}12", TUNNEL_IFACE_PREFIX)
            ]
        );
    }

    #[test]
    fn parses_route_get_output() -> anyhow::Result<()> {
        let output = r#"
           route to: default
        destination: default
               mask: default
            gateway: 192.168.178.1
          interface: en1
              flags: <UP,GATEWAY,DONE,STATIC,PRCLONING,GLOBAL>
        "#;

        let (device, gateway) = parse_key_value_output(output, "interface:", "gateway:", Some(":"))?;

        assert_eq!(device, "en1");
        assert_eq!(gateway, Some("192.168.178.1".to_string()));
        Ok(())
    }

    #[test]
    fn parses_route_get_without_gateway() -> anyhow::Result<()> {
        // When a tunnel holds the default, gateway shows as "index: N"
        let output = r#"
           route to: default
            gateway: index: 28
          interface: utun8
        "#;

        let (device, gateway) = parse_key_value_output(output, "interface:", "gateway:", Some(":"))?;

        assert_eq!(device, "utun8");
        assert_eq!(gateway, None);
        Ok(())
    }

    #[test]
    fn parses_ip_route_default_output() -> anyhow::Result<()> {
        let output = "default via 10.0.2.2 dev eth0 proto dhcp metric 100";
        let (device, gateway) = parse_key_value_output(output, "dev", "via", None)?;
        assert_eq!(device, "eth0");
        assert_eq!(gateway, Some("10.0.2.2".to_string()));
        Ok(())
    }

    #[test]
    fn parses_ifconfig_networks() {
        let output = "\
lo0: flags=8049<UP,LOOPBACK,RUNNING,MULTICAST> mtu 16384
\tinet 127.0.0.1 netmask 0xff000000
en0: flags=8863<UP,BROADCAST,SMART,RUNNING,SIMPLEX,MULTICAST> mtu 1500
\tinet 192.168.1.23 netmask 0xffffff00 broadcast 192.168.1.255
\tinet6 fe80::1c2b%en0 prefixlen 64 secured scopeid 0xb
";
        let nets = parse_ifconfig_networks(output);
        assert_eq!(nets.len(), 3);
        assert_eq!(nets[1].interface, "en0");
        assert_eq!(nets[1].prefix, 24);
        assert!(nets[1].contains(&"192.168.1.1".parse().unwrap()));
        assert!(!nets[1].contains(&"192.168.2.1".parse().unwrap()));
        assert_eq!(nets[2].prefix, 64);
    }

    #[test]
    fn parses_ip_addr_networks_output() {
        let output = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 192.168.1.23/24 brd 192.168.1.255 scope global dynamic eth0\\       valid_lft 86057sec
2: eth0    inet6 fe80::5054:ff:fe12:3456/64 scope link \\       valid_lft forever preferred_lft forever
";
        let nets = parse_ip_addr_networks(output);
        assert_eq!(nets.len(), 3);
        assert_eq!(nets[1].interface, "eth0");
        assert!(nets[1].contains(&"192.168.1.99".parse().unwrap()));
        assert_eq!(nets[2].prefix, 64);
    }

    #[test]
    fn hex_netmask_to_prefix() {
        assert_eq!(parse_hex_netmask("0xffffff00"), Some(24));
        assert_eq!(parse_hex_netmask("0xff000000"), Some(8));
        assert_eq!(parse_hex_netmask("255.255.255.0"), None);
    }
}
