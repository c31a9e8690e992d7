//! Tunnel lifecycle: composes the device controller, route manager and DNS
//! manager into the CONNECTING / CONNECTED / PAUSED / RECONNECTING /
//! DISCONNECTED lifecycle.
//!
//! `connect` blocks for the lifetime of the tunnel. Every acquiring mutation
//! registers its release on an explicit LIFO stack before it can fail
//! observably, so any exit path unwinds to the pre-connect state. Pause is
//! modelled as teardown-and-wait: the device, routes and DNS come down, the
//! call blocks until resume, then returns `ReconnectionRequired` so the owner
//! re-runs the whole connect sequence.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use crate::device::{self, InterfaceSpec, PeerSpec, TunnelDevice};
use crate::dns::{self, DnsManager, DnsSettings};
use crate::event::{State, StateEvent};
use crate::platform::{DefaultRoute, Exec};
use crate::routing::{self, RouteConfig, RouteManager, RouteSet, RouteSpec};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid connection parameters: {0}")]
    Config(String),
    #[error(transparent)]
    Device(#[from] device::Error),
    #[error(transparent)]
    Routing(#[from] routing::Error),
    #[error(transparent)]
    Dns(#[from] dns::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("tunnel process exited unexpectedly [status: {0}]")]
    TunnelExited(i32),
    #[error("reconnection required after pause/resume")]
    ReconnectionRequired,
    #[error("another tunnel session is active")]
    SessionBusy,
}

/// Coarse classification for the UI layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Resource,
    Timeout,
    Os,
    Cancelled,
    ReconnectionRequired,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Config,
            Error::Dns(dns::Error::DohTemplateMissing)
            | Error::Dns(dns::Error::DotUnsupported)
            | Error::Dns(dns::Error::IpFamilyMismatch) => ErrorCategory::Config,
            Error::Device(device::Error::InterfaceLimit(_))
            | Error::Device(device::Error::ListenPortExhausted(_))
            | Error::SessionBusy => ErrorCategory::Resource,
            Error::Device(device::Error::InitTimeout(_))
            | Error::Device(device::Error::HandshakeTimeout(_)) => ErrorCategory::Timeout,
            Error::Device(device::Error::Cancelled) | Error::Cancelled => ErrorCategory::Cancelled,
            Error::ReconnectionRequired => ErrorCategory::ReconnectionRequired,
            _ => ErrorCategory::Os,
        }
    }
}

// ============================================================================
// Session slot
// ============================================================================

/// At most one tunnel session exists per process; connectivity-test sessions
/// are tagged and cannot coexist with a real one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionKind {
    Real,
    Test,
}

static SESSION_SLOT: Mutex<Option<SessionKind>> = Mutex::new(None);

pub(crate) struct SessionGuard;

pub(crate) fn claim_session(kind: SessionKind) -> Option<SessionGuard> {
    let mut slot = lock(&SESSION_SLOT);
    if slot.is_some() {
        return None;
    }
    *slot = Some(kind);
    Some(SessionGuard)
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *lock(&SESSION_SLOT) = None;
    }
}

/// Serialises tests that go through the process-wide session slot.
#[cfg(test)]
pub(crate) fn session_test_guard() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Parameters and session data
// ============================================================================

/// Multihop exit descriptor. The tunnel still terminates its outer UDP flow
/// at the entry server, but the peer config is built from the exit host's
/// key and the entry server forwards based on the port.
#[derive(Clone, Debug)]
pub struct MultihopExit {
    /// Logical name of the exit server (e.g. `ch-zrh.wg.summitvpn.net`).
    pub host_name: String,
    /// WireGuard public key of the exit host.
    pub public_key: String,
    /// Entry-server port that forwards to this exit host.
    pub port: u16,
}

/// Immutable once a connect attempt begins.
#[derive(Clone, Debug)]
pub struct ConnectionParameters {
    pub client_ipv4: Ipv4Addr,
    pub client_ipv6: Option<Ipv6Addr>,
    pub client_private_key: String,
    pub host_public_key: String,
    /// Routable public IP of the VPN server.
    pub host_ip: IpAddr,
    /// Peer gateway inside the tunnel.
    pub host_local_ipv4: Ipv4Addr,
    pub host_local_ipv6: Option<Ipv6Addr>,
    pub host_port: u16,
    /// 0 keeps the platform default.
    pub mtu: u16,
    pub multihop: Option<MultihopExit>,
    pub dns: Option<DnsSettings>,
}

impl ConnectionParameters {
    pub fn validate(&self) -> Result<(), Error> {
        if self.host_port == 0 {
            return Err(Error::Config("host port must be in 1-65535".into()));
        }
        if !looks_like_wg_key(&self.client_private_key) {
            return Err(Error::Config("client private key is not a WireGuard key".into()));
        }
        if !looks_like_wg_key(&self.host_public_key) {
            return Err(Error::Config("host public key is not a WireGuard key".into()));
        }
        if let Some(multihop) = &self.multihop {
            if multihop.port == 0 {
                return Err(Error::Config("multihop port must be in 1-65535".into()));
            }
            if !looks_like_wg_key(&multihop.public_key) {
                return Err(Error::Config("multihop exit public key is not a WireGuard key".into()));
            }
        }
        Ok(())
    }

    /// Port the outer UDP flow targets; multihop uses the entry server's
    /// forwarding port.
    fn effective_port(&self) -> u16 {
        self.multihop.as_ref().map(|m| m.port).unwrap_or(self.host_port)
    }

    pub fn peer_endpoint(&self) -> String {
        match self.host_ip {
            IpAddr::V4(ip) => format!("{}:{}", ip, self.effective_port()),
            IpAddr::V6(ip) => format!("[{}]:{}", ip, self.effective_port()),
        }
    }

    fn interface_spec(&self) -> InterfaceSpec {
        InterfaceSpec {
            local_v4: self.client_ipv4,
            gateway_v4: self.host_local_ipv4,
            local_v6: self.client_ipv6,
            mtu: self.mtu,
        }
    }

    fn peer_spec(&self) -> PeerSpec {
        // multihop swaps in the exit host's key; the entry server only
        // forwards the flow
        let public_key = match &self.multihop {
            Some(multihop) => multihop.public_key.clone(),
            None => self.host_public_key.clone(),
        };
        PeerSpec {
            public_key,
            endpoint: self.peer_endpoint(),
            keepalive: KEEPALIVE_SECS,
        }
    }

    fn route_spec(&self, tunnel_interface: String) -> RouteSpec {
        RouteSpec {
            server_ip: self.host_ip,
            tunnel_gateway: self.host_local_ipv4,
            tunnel_gateway_v6: self.host_local_ipv6,
            tunnel_interface,
        }
    }
}

/// A 32-byte key in canonical base64 is 44 characters with one padding byte.
fn looks_like_wg_key(key: &str) -> bool {
    key.len() == 44
        && key.ends_with('=')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

#[derive(Clone, Debug)]
pub struct TunnelSession {
    pub interface: String,
    /// Default route at connect time; `None` for test sessions, which never
    /// touch the routing table.
    pub captured_default: Option<DefaultRoute>,
    pub default_route_updated: bool,
    /// Tags a connectivity-test session: interface addressing is skipped on
    /// the device and the route and resolver managers are bypassed.
    pub is_test_connection: bool,
    pub handshake_time: Option<SystemTime>,
    pub multihop_exit_host: Option<String>,
    pub ipv6_enabled: bool,
}

impl TunnelSession {
    fn real(captured_default: DefaultRoute, params: &ConnectionParameters) -> Self {
        TunnelSession {
            interface: String::new(),
            captured_default: Some(captured_default),
            default_route_updated: false,
            is_test_connection: false,
            handshake_time: None,
            multihop_exit_host: params.multihop.as_ref().map(|m| m.host_name.clone()),
            ipv6_enabled: params.client_ipv6.is_some(),
        }
    }

    /// Session backing a connectivity-test device.
    pub(crate) fn probe() -> Self {
        TunnelSession {
            interface: String::new(),
            captured_default: None,
            default_route_updated: false,
            is_test_connection: true,
            handshake_time: None,
            multihop_exit_host: None,
            ipv6_enabled: false,
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

const KEEPALIVE_SECS: u16 = 25;
const NETWORK_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Control {
    Disconnect,
    Pause,
    Resume,
}

struct ActiveRoutes {
    spec: RouteSpec,
    set: RouteSet,
    captured: DefaultRoute,
}

/// Deferred cleanup actions, unwound in reverse order of registration. Each
/// action logs its own failures; unwinding never aborts early.
struct CleanupStack {
    items: Vec<(&'static str, Box<dyn FnOnce() + Send>)>,
}

impl CleanupStack {
    fn new() -> Self {
        CleanupStack { items: Vec::new() }
    }

    fn push(&mut self, label: &'static str, action: impl FnOnce() + Send + 'static) {
        self.items.push((label, Box::new(action)));
    }

    fn unwind(&mut self) {
        while let Some((label, action)) = self.items.pop() {
            tracing::debug!(step = label, "running cleanup");
            action();
        }
    }
}

pub struct Lifecycle<E: Exec> {
    exec: E,
    route_config: RouteConfig,
    handshake_timeout: Duration,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    going_to_stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    routes: Arc<Mutex<Option<ActiveRoutes>>>,
    session: Arc<Mutex<Option<TunnelSession>>>,
}

impl<E: Exec> Lifecycle<E> {
    pub fn new(exec: E, route_config: RouteConfig, handshake_timeout: Duration) -> Self {
        let (control_tx, control_rx) = crossbeam_channel::bounded(8);
        Lifecycle {
            exec,
            route_config,
            handshake_timeout,
            control_tx,
            control_rx,
            going_to_stop: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            routes: Arc::new(Mutex::new(None)),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Bring the tunnel up and block until it is torn down again. Publishes
    /// state events on `events` for the lifetime of the call.
    pub fn connect(&self, params: &ConnectionParameters, events: &Sender<StateEvent>) -> Result<(), Error> {
        params.validate()?;
        let _session_guard = claim_session(SessionKind::Real).ok_or(Error::SessionBusy)?;

        self.going_to_stop.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        while self.control_rx.try_recv().is_ok() {}

        let result = self.run_connect(params, events);

        match &result {
            Ok(()) => emit(events, StateEvent::new(State::Disconnected)),
            Err(Error::ReconnectionRequired) => (),
            Err(Error::Cancelled) => emit(events, StateEvent::new(State::Disconnected)),
            Err(e) => emit(events, StateEvent::with_message(State::Disconnected, e.to_string())),
        }
        result
    }

    /// Request teardown. Safe to call at any time; `connect` returns promptly
    /// and no new OS mutations happen after the flag is observed.
    pub fn disconnect(&self) {
        self.going_to_stop.store(true, Ordering::SeqCst);
        let _ = self.control_tx.try_send(Control::Disconnect);
    }

    pub fn pause(&self) {
        let _ = self.control_tx.try_send(Control::Pause);
    }

    pub fn resume(&self) {
        let _ = self.control_tx.try_send(Control::Resume);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<TunnelSession> {
        lock(&self.session).clone()
    }

    /// Called by the default-route watcher. Reconciles the installed route
    /// set against the currently observed default gateway; serialises with
    /// connect/disconnect teardown on the routes cell.
    pub fn on_routing_changed(&self) -> Result<bool, Error> {
        let mut guard = lock(&self.routes);
        let Some(active) = guard.as_mut() else {
            return Ok(false);
        };
        let manager = RouteManager::new(self.exec.clone(), self.route_config);
        let spec = active.spec.clone();
        let changed = manager.reconcile_on_default_change(&spec, &mut active.set, &mut active.captured)?;
        if changed {
            if let Some(session) = lock(&self.session).as_mut() {
                session.captured_default = Some(active.captured.clone());
            }
        }
        Ok(changed)
    }

    fn run_connect(&self, params: &ConnectionParameters, events: &Sender<StateEvent>) -> Result<(), Error> {
        emit(events, StateEvent::new(State::Connecting));

        let route_manager = RouteManager::new(self.exec.clone(), self.route_config);
        let captured = self.wait_for_default_route(&route_manager, events)?;

        let mut cleanup = CleanupStack::new();
        let res = match self.establish(params, events, &route_manager, &captured, &mut cleanup) {
            Ok(device) => self.watch(&device, events, &mut cleanup),
            Err(e) => Err(e),
        };

        cleanup.unwind();
        *lock(&self.routes) = None;
        *lock(&self.session) = None;
        res
    }

    /// Step 1: wait (with retries) until a default route exists or
    /// cancellation is requested.
    fn wait_for_default_route(
        &self,
        route_manager: &RouteManager<E>,
        events: &Sender<StateEvent>,
    ) -> Result<DefaultRoute, Error> {
        loop {
            if self.cancelled() {
                return Err(Error::Cancelled);
            }
            match route_manager.capture_default() {
                Ok(default) => return Ok(default),
                Err(error) => {
                    tracing::info!(%error, "no usable default route, retrying");
                    emit(events, StateEvent::with_message(State::Reconnecting, "waiting for network"));
                    if self.sleep_cancelled(NETWORK_RETRY_INTERVAL) {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }

    /// Steps 3-7: device up, peer configured, first handshake seen, routes
    /// and DNS installed, CONNECTED published.
    fn establish(
        &self,
        params: &ConnectionParameters,
        events: &Sender<StateEvent>,
        route_manager: &RouteManager<E>,
        captured: &DefaultRoute,
        cleanup: &mut CleanupStack,
    ) -> Result<Arc<Mutex<TunnelDevice<E>>>, Error> {
        let mut session = TunnelSession::real(captured.clone(), params);
        let device = Arc::new(Mutex::new(TunnelDevice::allocate(
            self.exec.clone(),
            params.client_private_key.clone(),
            session.is_test_connection,
        )?));
        {
            let device = device.clone();
            cleanup.push("tunnel device", move || lock(&device).teardown());
        }

        lock(&device).start()?;
        if self.cancelled() {
            return Err(Error::Cancelled);
        }

        lock(&device).configure(&params.interface_spec(), &params.peer_spec())?;
        lock(&device)
            .wait_for_first_handshake(self.handshake_timeout, &self.going_to_stop)
            .map_err(|e| match e {
                device::Error::Cancelled => Error::Cancelled,
                other => Error::Device(other),
            })?;

        let interface = lock(&device).name().to_string();
        session.interface = interface.clone();
        session.handshake_time = Some(SystemTime::now());
        if let Some(exit_host) = &session.multihop_exit_host {
            tracing::info!(%exit_host, "multihop session, peer configured for the exit host");
        }
        *lock(&self.session) = Some(session);

        {
            let routes = self.routes.clone();
            let exec = self.exec.clone();
            let config = self.route_config;
            cleanup.push("routes", move || {
                if let Some(active) = lock(&routes).take() {
                    RouteManager::new(exec, config).remove(active.set);
                }
            });
        }
        let spec = params.route_spec(interface.clone());
        let set = route_manager.install(&spec, captured)?;
        let default_route_updated = set.default_route_updated();
        *lock(&self.routes) = Some(ActiveRoutes {
            spec,
            set,
            captured: captured.clone(),
        });
        if let Some(session) = lock(&self.session).as_mut() {
            session.default_route_updated = default_route_updated;
        }

        if let Some(settings) = &params.dns {
            {
                let exec = self.exec.clone();
                cleanup.push("dns", move || {
                    let _ = DnsManager::new(exec).delete_manual().map_err(|error| {
                        tracing::warn!(%error, "failed restoring resolver settings");
                    });
                });
            }
            DnsManager::new(self.exec.clone()).set_manual(settings, Some(&interface), params.client_ipv6.is_some())?;
        }

        emit(events, StateEvent::with_message(State::Connected, params.peer_endpoint()));
        Ok(device)
    }

    /// Step 8: block on the control endpoint's exit and on control messages.
    fn watch(
        &self,
        device: &Arc<Mutex<TunnelDevice<E>>>,
        events: &Sender<StateEvent>,
        cleanup: &mut CleanupStack,
    ) -> Result<(), Error> {
        let exit_rx = lock(device).exited().unwrap_or_else(crossbeam_channel::never);
        loop {
            crossbeam_channel::select! {
                recv(exit_rx) -> code => {
                    if self.cancelled() {
                        return Ok(());
                    }
                    let code = code.unwrap_or(-1);
                    tracing::warn!(code, "tunnel process exited unexpectedly");
                    return Err(Error::TunnelExited(code));
                }
                recv(self.control_rx) -> control => match control {
                    Ok(Control::Disconnect) => return Ok(()),
                    Ok(Control::Pause) => {
                        tracing::info!("pausing: tearing tunnel down, keeping lifecycle alive");
                        self.paused.store(true, Ordering::SeqCst);
                        cleanup.unwind();
                        *lock(&self.routes) = None;
                        emit(events, StateEvent::new(State::Paused));
                        let resumed = self.wait_while_paused();
                        self.paused.store(false, Ordering::SeqCst);
                        return if resumed { Err(Error::ReconnectionRequired) } else { Ok(()) };
                    }
                    Ok(Control::Resume) => {
                        tracing::debug!("resume ignored while not paused");
                    }
                    Err(_) => return Ok(()),
                }
            }
        }
    }

    /// Returns true on resume, false on disconnect.
    fn wait_while_paused(&self) -> bool {
        loop {
            match self.control_rx.recv() {
                Ok(Control::Resume) => return true,
                Ok(Control::Disconnect) => return false,
                Ok(Control::Pause) => continue,
                Err(_) => return false,
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.going_to_stop.load(Ordering::SeqCst)
    }

    /// Sleep in cancel-checked slices; returns true when cancelled.
    fn sleep_cancelled(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
        }
    }
}

fn emit(events: &Sender<StateEvent>, event: StateEvent) {
    tracing::info!(%event, "connection state");
    let _ = events.send(event).map_err(|error| {
        tracing::warn!(%error, "state event receiver gone");
    });
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{RecordingExec, SpawnScript};
    use std::thread;

    const KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    fn params() -> ConnectionParameters {
        ConnectionParameters {
            client_ipv4: "10.8.0.2".parse().unwrap(),
            client_ipv6: None,
            client_private_key: KEY.into(),
            host_public_key: KEY.into(),
            host_ip: "185.93.1.7".parse().unwrap(),
            host_local_ipv4: "10.8.0.1".parse().unwrap(),
            host_local_ipv6: None,
            host_port: 2049,
            mtu: 0,
            multihop: None,
            dns: None,
        }
    }

    const EXIT_KEY: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB=";

    fn multihop() -> MultihopExit {
        MultihopExit {
            host_name: "ch-zrh.wg.summitvpn.net".into(),
            public_key: EXIT_KEY.into(),
            port: 53,
        }
    }

    #[cfg(target_os = "macos")]
    fn script_default_route(exec: &RecordingExec, gateway: &str, iface: &str) {
        exec.respond(
            "route -n get default",
            &format!("gateway: {gateway}\n interface: {iface}"),
        );
    }

    #[cfg(not(target_os = "macos"))]
    fn script_default_route(exec: &RecordingExec, gateway: &str, iface: &str) {
        exec.respond(
            "ip route show default",
            &format!("default via {gateway} dev {iface}"),
        );
    }

    #[cfg(target_os = "macos")]
    fn script_no_default_route(exec: &RecordingExec) {
        exec.respond_err("route -n get default", 1, "route: not in table");
    }

    #[cfg(not(target_os = "macos"))]
    fn script_no_default_route(exec: &RecordingExec) {
        // `ip route show default` prints nothing when no default exists
        exec.respond("ip route show default", "");
    }

    fn connected_exec() -> RecordingExec {
        let exec = RecordingExec::new();
        script_default_route(&exec, "192.168.1.1", "en0");
        exec.respond("wg show", "PUBKEY\t1717171717");
        exec.push_spawn(SpawnScript::default());
        exec
    }

    fn lifecycle(exec: &RecordingExec) -> Arc<Lifecycle<RecordingExec>> {
        Arc::new(Lifecycle::new(
            exec.clone(),
            RouteConfig { split_default: false },
            Duration::from_millis(200),
        ))
    }

    fn spawn_connect(
        lifecycle: &Arc<Lifecycle<RecordingExec>>,
    ) -> (
        thread::JoinHandle<Result<(), Error>>,
        crossbeam_channel::Receiver<StateEvent>,
    ) {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let lifecycle = lifecycle.clone();
        let handle = thread::spawn(move || lifecycle.connect(&params(), &events_tx));
        (handle, events_rx)
    }

    fn wait_for_state(events: &crossbeam_channel::Receiver<StateEvent>, state: State) -> StateEvent {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
                if event.state == state {
                    return event;
                }
            }
        }
        panic!("state {state} not observed in time");
    }

    fn route_adds(exec: &RecordingExec) -> usize {
        exec.commands()
            .iter()
            .filter(|c| (c.starts_with("route") || c.starts_with("ip route")) && c.contains(" add"))
            .count()
    }

    fn route_deletes(exec: &RecordingExec) -> usize {
        exec.commands()
            .iter()
            .filter(|c| (c.starts_with("route") || c.starts_with("ip route")) && c.contains(" del"))
            .count()
    }

    #[test]
    fn happy_connect_then_disconnect() -> anyhow::Result<()> {
        let _session = session_test_guard();
        let exec = connected_exec();
        let lc = lifecycle(&exec);

        let (handle, events) = spawn_connect(&lc);
        let connected = wait_for_state(&events, State::Connected);
        assert_eq!(connected.message.as_deref(), Some("185.93.1.7:2049"));

        lc.disconnect();
        handle.join().unwrap()?;
        wait_for_state(&events, State::Disconnected);

        // routes installed then removed, device killed
        assert_eq!(route_adds(&exec), 3);
        assert_eq!(route_deletes(&exec), 3);
        assert_eq!(exec.state.lock().unwrap().kill_count, 1);
        Ok(())
    }

    #[test]
    fn connect_applies_and_restores_dns() -> anyhow::Result<()> {
        let _session = session_test_guard();
        let _dns = crate::dns::test_guard();
        let exec = connected_exec();
        let lc = lifecycle(&exec);

        let (events_tx, _events_rx) = crossbeam_channel::unbounded();
        let mut p = params();
        p.dns = Some(DnsSettings::plain("10.8.0.1".parse()?));
        let handle = {
            let lc = lc.clone();
            thread::spawn(move || lc.connect(&p, &events_tx))
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while exec.commands_matching("dns.sh -up_set_dns").is_empty() {
            assert!(Instant::now() < deadline, "resolver never configured");
            thread::sleep(Duration::from_millis(10));
        }

        lc.disconnect();
        handle.join().unwrap()?;

        assert_eq!(exec.commands_matching("dns.sh -up_set_dns").len(), 1);
        assert_eq!(exec.commands_matching("dns.sh -down").len(), 1);
        Ok(())
    }

    #[test]
    fn handshake_timeout_unwinds_everything() {
        let _session = session_test_guard();
        let exec = RecordingExec::new();
        script_default_route(&exec, "192.168.1.1", "en0");
        exec.respond("wg show", "PUBKEY\t0");
        exec.push_spawn(SpawnScript::default());
        let lc = lifecycle(&exec);

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let res = lc.connect(&params(), &events_tx);

        assert!(matches!(
            res,
            Err(Error::Device(device::Error::HandshakeTimeout(_)))
        ));
        assert!(matches!(
            res.as_ref().unwrap_err().category(),
            ErrorCategory::Timeout
        ));
        // no routes were ever installed, the device is gone
        assert_eq!(route_adds(&exec), 0);
        assert_eq!(exec.state.lock().unwrap().kill_count, 1);
        let last = events_rx.try_iter().last().unwrap();
        assert_eq!(last.state, State::Disconnected);
        assert!(last.message.is_some());
    }

    #[test]
    fn pause_then_resume_requests_reconnection() -> anyhow::Result<()> {
        let _session = session_test_guard();
        let exec = connected_exec();
        let lc = lifecycle(&exec);

        let (handle, events) = spawn_connect(&lc);
        wait_for_state(&events, State::Connected);

        lc.pause();
        wait_for_state(&events, State::Paused);
        assert!(lc.is_paused());
        // tunnel fully down while paused
        assert_eq!(route_deletes(&exec), route_adds(&exec));
        assert_eq!(exec.state.lock().unwrap().kill_count, 1);

        lc.resume();
        let res = handle.join().unwrap();
        assert!(matches!(res, Err(Error::ReconnectionRequired)));
        assert!(!lc.is_paused());
        Ok(())
    }

    #[test]
    fn pause_then_disconnect_finishes_cleanly() -> anyhow::Result<()> {
        let _session = session_test_guard();
        let exec = connected_exec();
        let lc = lifecycle(&exec);

        let (handle, events) = spawn_connect(&lc);
        wait_for_state(&events, State::Connected);

        lc.pause();
        wait_for_state(&events, State::Paused);
        lc.disconnect();
        handle.join().unwrap()?;
        wait_for_state(&events, State::Disconnected);
        Ok(())
    }

    #[test]
    fn gateway_change_reinstalls_routes_while_connected() -> anyhow::Result<()> {
        let _session = session_test_guard();
        let exec = RecordingExec::new();
        // first capture sees the old gateway, every later read the new one
        script_default_route(&exec, "192.168.1.1", "en0");
        script_default_route(&exec, "172.16.0.1", "en1");
        exec.respond("wg show", "PUBKEY\t1717171717");
        exec.push_spawn(SpawnScript::default());
        let lc = lifecycle(&exec);

        let (handle, events) = spawn_connect(&lc);
        wait_for_state(&events, State::Connected);
        let installs_before = route_adds(&exec);

        let changed = lc.on_routing_changed()?;
        assert!(changed);
        assert_eq!(route_adds(&exec), installs_before * 2);
        assert_eq!(route_deletes(&exec), installs_before);
        // session stays connected
        assert!(events.try_iter().all(|e| e.state != State::Disconnected));
        let session = lc.session().expect("session alive");
        assert_eq!(
            session.captured_default.map(|d| d.gateway),
            Some("172.16.0.1".parse::<IpAddr>()?)
        );

        lc.disconnect();
        handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn tunnel_process_death_disconnects() -> anyhow::Result<()> {
        let _session = session_test_guard();
        let exec = connected_exec();
        let lc = lifecycle(&exec);

        let (handle, events) = spawn_connect(&lc);
        wait_for_state(&events, State::Connected);

        // the wireguard process dies underneath us
        let exit_tx = exec.state.lock().unwrap().spawn_exits[0].clone();
        let _ = exit_tx.send(1);

        let res = handle.join().unwrap();
        assert!(matches!(res, Err(Error::TunnelExited(1))));
        wait_for_state(&events, State::Disconnected);
        // routes still restored
        assert_eq!(route_deletes(&exec), route_adds(&exec));
        Ok(())
    }

    #[test]
    fn disconnect_during_network_wait_cancels_promptly() {
        let _session = session_test_guard();
        let exec = RecordingExec::new();
        script_no_default_route(&exec);
        let lc = lifecycle(&exec);

        let (handle, events) = spawn_connect(&lc);
        wait_for_state(&events, State::Reconnecting);

        let started = Instant::now();
        lc.disconnect();
        let res = handle.join().unwrap();

        assert!(matches!(res, Err(Error::Cancelled)));
        // one polling interval, not the full 5s retry
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn route_install_failure_rolls_back_device() {
        let _session = session_test_guard();
        let exec = RecordingExec::new();
        script_default_route(&exec, "192.168.1.1", "en0");
        exec.respond("wg show", "PUBKEY\t1717171717");
        exec.push_spawn(SpawnScript::default());
        // every route mutation fails
        exec.respond_err(route_tool_prefix(), 1, "simulated failure");
        let lc = lifecycle(&exec);

        let (events_tx, _events_rx) = crossbeam_channel::unbounded();
        let res = lc.connect(&params(), &events_tx);

        assert!(matches!(res, Err(Error::Routing(_))));
        assert_eq!(exec.state.lock().unwrap().kill_count, 1);
        assert!(lc.session().is_none());
    }

    #[cfg(target_os = "macos")]
    fn route_tool_prefix() -> &'static str {
        "route -n add"
    }

    #[cfg(not(target_os = "macos"))]
    fn route_tool_prefix() -> &'static str {
        "ip route add"
    }

    #[test]
    fn rejects_invalid_parameters() {
        let mut p = params();
        p.host_port = 0;
        assert!(matches!(p.validate(), Err(Error::Config(_))));

        let mut p = params();
        p.client_private_key = "not-a-key".into();
        let err = p.validate().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Config);

        let mut p = params();
        p.multihop = Some(MultihopExit {
            public_key: "not-a-key".into(),
            ..multihop()
        });
        assert!(matches!(p.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn multihop_builds_peer_from_exit_host() {
        let mut p = params();
        p.multihop = Some(multihop());
        assert!(p.validate().is_ok());
        // the exit host's key, the entry server's forwarding port
        assert_eq!(p.peer_spec().public_key, EXIT_KEY);
        assert_eq!(p.peer_endpoint(), "185.93.1.7:53");

        let single_hop = params();
        assert_eq!(single_hop.peer_spec().public_key, KEY);
        assert_eq!(single_hop.peer_endpoint(), "185.93.1.7:2049");
    }

    #[test]
    fn multihop_exit_recorded_in_session() -> anyhow::Result<()> {
        let _session = session_test_guard();
        let exec = connected_exec();
        let lc = lifecycle(&exec);

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let mut p = params();
        p.multihop = Some(multihop());
        let handle = {
            let lc = lc.clone();
            thread::spawn(move || lc.connect(&p, &events_tx))
        };

        let connected = wait_for_state(&events_rx, State::Connected);
        assert_eq!(connected.message.as_deref(), Some("185.93.1.7:53"));
        let session = lc.session().expect("session alive");
        assert_eq!(session.multihop_exit_host.as_deref(), Some("ch-zrh.wg.summitvpn.net"));
        assert!(!session.is_test_connection);

        lc.disconnect();
        handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn formats_ipv6_endpoint_with_brackets() {
        let mut p = params();
        p.host_ip = "2001:db8::7".parse().unwrap();
        assert_eq!(p.peer_endpoint(), "[2001:db8::7]:2049");
    }

    #[test]
    fn second_session_is_rejected() {
        let _session = session_test_guard();
        let _first = claim_session(SessionKind::Real).expect("slot free");
        assert!(claim_session(SessionKind::Test).is_none());
    }
}
