//! Tunnel device control: allocation, userspace WireGuard process, peer
//! configuration and handshake observation.
//!
//! The controller owns one transient device per session. Interface-level
//! settings (addresses, MTU) go through the platform tools; the WireGuard
//! peer configuration is rendered to a config file and pushed with
//! `wg setconf`, which replaces the peer set wholesale so the connectivity
//! tester can re-point the same device at candidate after candidate.

use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

use crate::platform::{self, ChildProcess, Exec, as_strs};

#[derive(Debug, Error)]
pub enum Error {
    #[error("no free tunnel interface below index {0}")]
    InterfaceLimit(u16),
    #[error("tunnel process produced no readiness marker within {0:?}")]
    InitTimeout(Duration),
    #[error("tunnel process ended before becoming ready")]
    InitFailed,
    #[error("no handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("listen port still in use after {0} attempts")]
    ListenPortExhausted(u32),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Platform(#[from] platform::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Interface-level settings applied before the peer is configured.
#[derive(Clone, Debug)]
pub struct InterfaceSpec {
    pub local_v4: Ipv4Addr,
    /// Peer gateway inside the tunnel.
    pub gateway_v4: Ipv4Addr,
    pub local_v6: Option<Ipv6Addr>,
    /// 0 keeps the platform default.
    pub mtu: u16,
}

#[derive(Clone, Debug)]
pub struct PeerSpec {
    pub public_key: String,
    /// `host:port`
    pub endpoint: String,
    /// 0 disables keepalive.
    pub keepalive: u16,
}

const READY_MARKER: &str = "UAPI listener started";
const INIT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_TUNNEL_INDEX: u16 = 255;
const LISTEN_PORT_ATTEMPTS: u32 = 5;

pub struct TunnelDevice<E: Exec> {
    exec: E,
    name: String,
    private_key: String,
    listen_port: u16,
    /// Skip interface address and MTU setup; the device only exchanges
    /// handshakes and must leave the host untouched.
    test_only: bool,
    pub(crate) config_path: PathBuf,
    child: Option<Box<dyn ChildProcess>>,
}

impl<E: Exec> TunnelDevice<E> {
    /// Scan existing tunnel devices and claim the next free index.
    pub fn allocate(exec: E, private_key: String, test_only: bool) -> Result<Self, Error> {
        let existing = platform::enumerate_tunnel_interfaces(&exec)?;
        let name = next_free_name(&existing)?;
        let config_path = platform::wg_config_file_path()?;
        tracing::debug!(%name, "allocated tunnel interface");
        Ok(TunnelDevice {
            exec,
            name,
            private_key,
            listen_port: ephemeral_port(),
            test_only,
            config_path,
            child: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the userspace WireGuard process and wait for its readiness
    /// marker.
    pub fn start(&mut self) -> Result<(), Error> {
        let binary = platform::wg_binary_path();
        let mut child = self.exec.spawn(&binary, &["-f", &self.name])?;

        let lines = child.output_lines();
        let deadline = crossbeam_channel::after(INIT_TIMEOUT);
        loop {
            crossbeam_channel::select! {
                recv(lines) -> line => match line {
                    Ok(line) if line.contains(READY_MARKER) => break,
                    Ok(_) => continue,
                    Err(_) => {
                        child.kill();
                        return Err(Error::InitFailed);
                    }
                },
                recv(deadline) -> _ => {
                    child.kill();
                    return Err(Error::InitTimeout(INIT_TIMEOUT));
                }
            }
        }

        self.child = Some(child);
        Ok(())
    }

    /// Exit notification for the underlying process, once started.
    pub fn exited(&self) -> Option<crossbeam_channel::Receiver<i32>> {
        self.child.as_ref().map(|c| c.exited())
    }

    /// Assign addresses and MTU (skipped for test-only devices) and push the
    /// initial peer configuration.
    pub fn configure(&mut self, iface: &InterfaceSpec, peer: &PeerSpec) -> Result<(), Error> {
        if !self.test_only {
            for args in address_commands(&self.name, iface) {
                self.exec.run(interface_tool(), &as_strs(&args))?;
            }
        }
        self.set_peer(peer)
    }

    /// Replace the peer configuration on the running device.
    ///
    /// `wg setconf` rejects a listen port that is already bound; each retry
    /// regenerates the ephemeral port.
    pub fn set_peer(&mut self, peer: &PeerSpec) -> Result<(), Error> {
        let wg = platform::wg_tool_path();
        for _ in 0..LISTEN_PORT_ATTEMPTS {
            let config = render_config(&self.private_key, self.listen_port, peer);
            fs::write(&self.config_path, config.as_bytes())?;
            fs::set_permissions(&self.config_path, fs::Permissions::from_mode(0o600))?;

            let path = self.config_path.to_string_lossy().to_string();
            match self.exec.run(&wg, &["setconf", &self.name, &path]) {
                Ok(_) => return Ok(()),
                Err(platform::Error::Command(_, stderr)) if stderr.contains("Address already in use") => {
                    let stale = self.listen_port;
                    self.listen_port = ephemeral_port();
                    tracing::debug!(stale, fresh = self.listen_port, "listen port in use, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::ListenPortExhausted(LISTEN_PORT_ATTEMPTS))
    }

    /// Poll the control interface until any peer reports a handshake, the
    /// timeout expires, or `cancel` flips.
    pub fn wait_for_first_handshake(&self, timeout: Duration, cancel: &AtomicBool) -> Result<(), Error> {
        let wg = platform::wg_tool_path();
        let started = Instant::now();
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let output = self.exec.run(&wg, &["show", &self.name, "latest-handshakes"])?;
            if any_nonzero_handshake(&output) {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::HandshakeTimeout(timeout));
            }
            std::thread::sleep(HANDSHAKE_POLL_INTERVAL);
        }
    }

    /// Stop the userspace process and drop the rendered config. Idempotent;
    /// the process removes its own device on exit.
    pub fn teardown(&mut self) {
        if let Some(mut child) = self.child.take() {
            child.kill();
            tracing::debug!(name = %self.name, "tunnel device torn down");
        }
        let _ = fs::remove_file(&self.config_path);
    }
}

impl<E: Exec> Drop for TunnelDevice<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn next_free_name(existing: &[String]) -> Result<String, Error> {
    let used: Vec<u16> = existing
        .iter()
        .filter_map(|name| name.strip_prefix(platform::TUNNEL_IFACE_PREFIX))
        .filter_map(|idx| idx.parse().ok())
        .collect();
    (0..=MAX_TUNNEL_INDEX)
        .find(|idx| !used.contains(idx))
        .map(|idx| format!("{}{}", platform::TUNNEL_IFACE_PREFIX, idx))
        .ok_or(Error::InterfaceLimit(MAX_TUNNEL_INDEX))
}

fn ephemeral_port() -> u16 {
    rand::rng().random_range(49152u16..=65535)
}

fn any_nonzero_handshake(output: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .filter_map(|ts| ts.parse::<u64>().ok())
        .any(|ts| ts > 0)
}

fn render_config(private_key: &str, listen_port: u16, peer: &PeerSpec) -> String {
    let keepalive_line = if peer.keepalive > 0 {
        format!("PersistentKeepalive = {}\n", peer.keepalive)
    } else {
        String::new()
    };
    format!(
        "[Interface]
PrivateKey = {private_key}
ListenPort = {listen_port}

[Peer]
PublicKey = {public_key}
Endpoint = {endpoint}
AllowedIPs = 0.0.0.0/0, ::/0
{keepalive_line}",
        private_key = private_key,
        listen_port = listen_port,
        public_key = peer.public_key,
        endpoint = peer.endpoint,
        keepalive_line = keepalive_line,
    )
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {

        fn interface_tool() -> &'static std::path::Path {
            std::path::Path::new(platform::IFCONFIG_TOOL)
        }

        fn address_commands(name: &str, iface: &InterfaceSpec) -> Vec<Vec<String>> {
            let mut commands = vec![vec![
                name.to_string(),
                iface.local_v4.to_string(),
                iface.gateway_v4.to_string(),
                "up".to_string(),
            ]];
            if iface.mtu > 0 {
                commands.push(vec![name.to_string(), "mtu".to_string(), iface.mtu.to_string()]);
            }
            if let Some(v6) = iface.local_v6 {
                commands.push(vec![
                    name.to_string(),
                    "inet6".to_string(),
                    v6.to_string(),
                    "prefixlen".to_string(),
                    "64".to_string(),
                ]);
            }
            commands
        }

    } else {

        fn interface_tool() -> &'static std::path::Path {
            std::path::Path::new(platform::IP_TOOL)
        }

        fn address_commands(name: &str, iface: &InterfaceSpec) -> Vec<Vec<String>> {
            let mut commands = vec![
                vec![
                    "address".to_string(),
                    "add".to_string(),
                    iface.local_v4.to_string(),
                    "peer".to_string(),
                    iface.gateway_v4.to_string(),
                    "dev".to_string(),
                    name.to_string(),
                ],
                vec![
                    "link".to_string(),
                    "set".to_string(),
                    "up".to_string(),
                    "dev".to_string(),
                    name.to_string(),
                ],
            ];
            if iface.mtu > 0 {
                commands.push(vec![
                    "link".to_string(),
                    "set".to_string(),
                    "mtu".to_string(),
                    iface.mtu.to_string(),
                    "dev".to_string(),
                    name.to_string(),
                ]);
            }
            if let Some(v6) = iface.local_v6 {
                commands.push(vec![
                    "-6".to_string(),
                    "address".to_string(),
                    "add".to_string(),
                    format!("{v6}/64"),
                    "dev".to_string(),
                    name.to_string(),
                ]);
            }
            commands
        }

    }
}
