//! Connectivity tester: probes (server, host, port) candidates through a
//! throw-away WireGuard device to find a combination whose handshake
//! completes when the default one fails.
//!
//! The test device runs with interface setup disabled, so probing leaves the
//! host's routes and resolver untouched. Candidate order follows distance to
//! the user's current server; handshake failure at the nearest server most
//! likely reflects a port or protocol block rather than a server outage, so
//! by default only the nearest server is tried and ports are rotated instead.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::device::{self, PeerSpec, TunnelDevice};
use crate::platform::Exec;
use crate::tunnel::{SessionKind, TunnelSession, claim_session, lock};

mod geo;

#[derive(Debug, Error)]
pub enum Error {
    #[error("another tunnel session is active")]
    SessionBusy,
    #[error("no candidates to probe")]
    NoCandidates,
    #[error("all candidates exhausted without a handshake")]
    Exhausted,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Device(#[from] device::Error),
}

/// One physical endpoint within a server.
#[derive(Clone, Debug)]
pub struct Host {
    pub hostname: String,
    pub public_key: String,
    pub endpoint_ip: IpAddr,
}

/// A logical server (gateway identity) with its hosts and catalogue
/// coordinates.
#[derive(Clone, Debug)]
pub struct Server {
    pub gateway: String,
    pub latitude: f64,
    pub longitude: f64,
    pub hosts: Vec<Host>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortKind {
    Udp,
    Tcp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortInfo {
    pub port: u16,
    pub kind: PortKind,
}

impl Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            PortKind::Udp => write!(f, "{}/UDP", self.port),
            PortKind::Tcp => write!(f, "{}/TCP", self.port),
        }
    }
}

/// The user's current server and port choice; the probe order pivots on it.
#[derive(Clone, Debug)]
pub struct Selection {
    pub gateway: String,
    pub port: u16,
}

/// Published before each probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub server: String,
    pub host: String,
    pub port: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GoodConnectionInfo {
    pub gateway: String,
    pub host: String,
    pub port: u16,
    pub kind: PortKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerScanPolicy {
    /// Probe only the server nearest to the current selection.
    NearestOnly,
    /// Walk the whole ordered catalogue.
    All,
}

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_CONCURRENT_PROBES: usize = 10;

pub struct Tester<E: Exec> {
    exec: E,
    client_private_key: String,
    policy: ServerScanPolicy,
    probe_timeout: Duration,
    cancel: Arc<AtomicBool>,
    /// The tagged session backing the probe device while a test runs.
    session: Arc<Mutex<Option<TunnelSession>>>,
}

impl<E: Exec> Tester<E> {
    pub fn new(exec: E, client_private_key: String) -> Self {
        Tester {
            exec,
            client_private_key,
            policy: ServerScanPolicy::NearestOnly,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            cancel: Arc::new(AtomicBool::new(false)),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// The probe session while a test is running, `None` otherwise.
    pub fn session(&self) -> Option<TunnelSession> {
        lock(&self.session).clone()
    }

    pub fn with_policy(mut self, policy: ServerScanPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Cooperatively halt an ongoing `test` or `test_ports` run.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Iterate candidates and return the first whose handshake completes.
    /// A status event is published (lossily) before each probe.
    pub fn test(
        &self,
        servers: &[Server],
        selection: &Selection,
        ports: &[PortInfo],
        status: &crossbeam_channel::Sender<StatusEvent>,
    ) -> Result<GoodConnectionInfo, Error> {
        self.cancel.store(false, Ordering::SeqCst);
        let _guard = claim_session(SessionKind::Test).ok_or(Error::SessionBusy)?;

        let servers = order_servers(servers, &selection.gateway, self.policy);
        let ports = order_ports(ports, selection.port);
        if servers.is_empty() || servers.iter().all(|s| s.hosts.is_empty()) || ports.is_empty() {
            return Err(Error::NoCandidates);
        }

        // the tagged session is what keeps route and resolver setup out of
        // the probe path
        let mut session = TunnelSession::probe();
        let mut probe_device = TunnelDevice::allocate(
            self.exec.clone(),
            self.client_private_key.clone(),
            session.is_test_connection,
        )?;
        session.interface = probe_device.name().to_string();
        *lock(&self.session) = Some(session);

        let res = (|| {
            probe_device.start()?;
            self.probe_candidates(&mut probe_device, &servers, &ports, status)
        })();
        if res.is_ok() {
            if let Some(session) = lock(&self.session).as_mut() {
                session.handshake_time = Some(SystemTime::now());
            }
        }
        probe_device.teardown();
        *lock(&self.session) = None;
        res
    }

    fn probe_candidates(
        &self,
        device: &mut TunnelDevice<E>,
        servers: &[Server],
        ports: &[PortInfo],
        status: &crossbeam_channel::Sender<StatusEvent>,
    ) -> Result<GoodConnectionInfo, Error> {
        for server in servers {
            for host in &server.hosts {
                for port in ports {
                    if self.cancel.load(Ordering::SeqCst) {
                        return Err(Error::Cancelled);
                    }
                    // lossy publish: liveness over completeness
                    let _ = status.try_send(StatusEvent {
                        server: server.gateway.clone(),
                        host: host.hostname.clone(),
                        port: port.to_string(),
                    });

                    device.set_peer(&PeerSpec {
                        public_key: host.public_key.clone(),
                        endpoint: endpoint_string(host.endpoint_ip, port.port),
                        keepalive: 0,
                    })?;
                    match device.wait_for_first_handshake(self.probe_timeout, &self.cancel) {
                        Ok(()) => {
                            tracing::info!(gateway = %server.gateway, host = %host.hostname, %port, "workable candidate found");
                            return Ok(GoodConnectionInfo {
                                gateway: server.gateway.clone(),
                                host: host.hostname.clone(),
                                port: port.port,
                                kind: port.kind,
                            });
                        }
                        Err(device::Error::HandshakeTimeout(_)) => continue,
                        Err(device::Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Err(Error::Exhausted)
    }

    /// Port-reachability probe against a fixed server: TCP ports get a plain
    /// connect with timeout, at most [`MAX_CONCURRENT_PROBES`] in flight.
    /// `true` means any probe succeeded and is sticky.
    pub fn test_ports<F>(&self, ports: &[PortInfo], geolookup: F) -> Result<HashMap<PortInfo, bool>, Error>
    where
        F: FnOnce() -> Option<IpAddr>,
    {
        self.cancel.store(false, Ordering::SeqCst);
        let server_ip = geolookup().ok_or(Error::NoCandidates)?;

        let results: Arc<Mutex<HashMap<PortInfo, bool>>> =
            Arc::new(Mutex::new(ports.iter().map(|p| (*p, false)).collect()));

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<PortInfo>();
        let mut tcp_jobs = 0;
        for port in ports.iter().filter(|p| p.kind == PortKind::Tcp) {
            tcp_jobs += 1;
            let _ = job_tx.send(*port);
        }
        drop(job_tx);

        let mut workers = Vec::new();
        for _ in 0..MAX_CONCURRENT_PROBES.min(tcp_jobs) {
            let job_rx = job_rx.clone();
            let results = results.clone();
            let cancel = self.cancel.clone();
            workers.push(thread::spawn(move || {
                while let Ok(port) = job_rx.recv() {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let reachable = probe_tcp(server_ip, port.port);
                    let mut merged = lock(&results);
                    let entry = merged.entry(port).or_insert(false);
                    *entry = *entry || reachable;
                }
            }));
        }
        for worker in workers {
            let _ = worker.join();
        }

        if self.cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        // TODO: probe WG-UDP ports through the test device the way test()
        // does instead of reporting them unreachable
        let merged = lock(&results).clone();
        Ok(merged)
    }
}

fn probe_tcp(ip: IpAddr, port: u16) -> bool {
    TcpStream::connect_timeout(&SocketAddr::new(ip, port), TCP_PROBE_TIMEOUT).is_ok()
}

fn endpoint_string(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(ip) => format!("{ip}:{port}"),
        IpAddr::V6(ip) => format!("[{ip}]:{port}"),
    }
}

/// Order servers by great-circle distance to the currently selected server;
/// unknown selection keeps catalogue order.
fn order_servers(servers: &[Server], selected_gateway: &str, policy: ServerScanPolicy) -> Vec<Server> {
    let mut ordered: Vec<Server> = servers.to_vec();
    if let Some(reference) = servers.iter().find(|s| s.gateway == selected_gateway) {
        let (lat, lon) = (reference.latitude, reference.longitude);
        ordered.sort_by(|a, b| {
            let da = geo::haversine_km(lat, lon, a.latitude, a.longitude);
            let db = geo::haversine_km(lat, lon, b.latitude, b.longitude);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    match policy {
        ServerScanPolicy::NearestOnly => ordered.truncate(1),
        ServerScanPolicy::All => (),
    }
    ordered
}

/// Currently selected port first, remaining UDP ports after, zero entries
/// skipped.
fn order_ports(ports: &[PortInfo], selected_port: u16) -> Vec<PortInfo> {
    let usable = ports.iter().copied().filter(|p| p.port != 0 && p.kind == PortKind::Udp);
    let (mut ordered, rest): (Vec<PortInfo>, Vec<PortInfo>) = usable.partition(|p| p.port == selected_port);
    ordered.extend(rest);
    ordered
}
