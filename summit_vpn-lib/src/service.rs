//! Daemon-facing facade over the tunnel lifecycle, DNS manager and
//! connectivity tester.
//!
//! `connect` blocks until the session is gone and transparently re-runs the
//! connect sequence when a pause/resume cycle asks for it. Connectivity tests
//! run on their own thread and report through a [`TestEventSink`]; status
//! events travel over a bounded channel and are dropped on overflow.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::dns::{self, DnsManager, DnsSettings};
use crate::event::StateEvent;
use crate::platform::Exec;
use crate::routing::RouteConfig;
use crate::tester::{self, GoodConnectionInfo, PortInfo, Selection, Server, StatusEvent, Tester};
use crate::tunnel::{self, ConnectionParameters, Lifecycle, TunnelSession, lock};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const STATUS_CHANNEL_CAPACITY: usize = 16;

/// Receives connectivity-test progress and the final verdict.
pub trait TestEventSink: Send + Sync {
    fn on_status(&self, event: StatusEvent);
    fn on_result(&self, result: Result<GoodConnectionInfo, tester::Error>);
}

pub struct Service<E: Exec> {
    exec: E,
    lifecycle: Arc<Lifecycle<E>>,
    tester: Mutex<Option<Arc<Tester<E>>>>,
    dns_op_lock: Mutex<()>,
}

impl<E: Exec> Service<E> {
    pub fn new(exec: E, route_config: RouteConfig, handshake_timeout: Duration) -> Self {
        Service {
            lifecycle: Arc::new(Lifecycle::new(exec.clone(), route_config, handshake_timeout)),
            tester: Mutex::new(None),
            dns_op_lock: Mutex::new(()),
            exec,
        }
    }

    /// Bring the tunnel up and block until it is disconnected. A
    /// pause/resume cycle re-runs the whole connect sequence.
    pub fn connect(&self, params: &ConnectionParameters, events: &Sender<StateEvent>) -> Result<(), tunnel::Error> {
        loop {
            match self.lifecycle.connect(params, events) {
                Err(tunnel::Error::ReconnectionRequired) => {
                    tracing::info!("resumed after pause, reconnecting");
                }
                other => return other,
            }
        }
    }

    pub fn disconnect(&self) {
        self.lifecycle.disconnect();
    }

    pub fn pause(&self) {
        self.lifecycle.pause();
    }

    pub fn resume(&self) {
        self.lifecycle.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.lifecycle.is_paused()
    }

    pub fn session(&self) -> Option<TunnelSession> {
        self.lifecycle.session()
    }

    /// Called by the external default-route watcher.
    pub fn on_routing_changed(&self) -> Result<bool, tunnel::Error> {
        self.lifecycle.on_routing_changed()
    }

    pub fn set_manual_dns(&self, settings: &DnsSettings) -> Result<(), dns::Error> {
        let _guard = lock(&self.dns_op_lock);
        let session = self.lifecycle.session();
        let (interface, ipv6_enabled) = match &session {
            Some(s) => (Some(s.interface.clone()), s.ipv6_enabled),
            // outside a session there is no family constraint to enforce
            None => (None, settings.ip().is_ipv6()),
        };
        DnsManager::new(self.exec.clone()).set_manual(settings, interface.as_deref(), ipv6_enabled)
    }

    pub fn reset_manual_dns(&self) -> Result<(), dns::Error> {
        let _guard = lock(&self.dns_op_lock);
        DnsManager::new(self.exec.clone()).delete_manual()
    }

    pub fn dns_encryption_abilities(&self) -> dns::EncryptionAbilities {
        dns::encryption_abilities()
    }

    /// Start a connectivity test. Progress and the final result are
    /// delivered to `sink` from a background thread; a previously running
    /// test is stopped first.
    pub fn connection_test_start(
        &self,
        params: &ConnectionParameters,
        servers: Vec<Server>,
        selection: Selection,
        ports: Vec<PortInfo>,
        sink: Arc<dyn TestEventSink>,
    ) {
        let tester = Arc::new(Tester::new(self.exec.clone(), params.client_private_key.clone()));
        if let Some(previous) = lock(&self.tester).replace(tester.clone()) {
            previous.stop();
        }

        let (status_tx, status_rx) = crossbeam_channel::bounded(STATUS_CHANNEL_CAPACITY);
        let forward_sink = sink.clone();
        let forwarder = thread::spawn(move || {
            for event in status_rx.iter() {
                forward_sink.on_status(event);
            }
        });

        thread::spawn(move || {
            let result = tester.test(&servers, &selection, &ports, &status_tx);
            drop(status_tx);
            let _ = forwarder.join();
            sink.on_result(result);
        });
    }

    pub fn connection_test_stop(&self) {
        if let Some(tester) = lock(&self.tester).as_ref() {
            tester.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::State;
    use crate::platform::mock::{RecordingExec, SpawnScript};
    use crate::tester::PortKind;
    use crate::tunnel::session_test_guard;
    use std::net::IpAddr;
    use std::time::Instant;

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

    #[cfg(target_os = "macos")]
    fn script_default_route(exec: &RecordingExec) {
        exec.respond("route -n get default", "gateway: 192.168.1.1\n interface: en0");
    }

    #[cfg(not(target_os = "macos"))]
    fn script_default_route(exec: &RecordingExec) {
        exec.respond("ip route show default", "default via 192.168.1.1 dev eth0");
    }

    fn service(exec: &RecordingExec) -> Arc<Service<RecordingExec>> {
        Arc::new(Service::new(
            exec.clone(),
            RouteConfig { split_default: false },
            Duration::from_millis(200),
        ))
    }

    fn wait_for_state(
        events: &crossbeam_channel::Receiver<StateEvent>,
        state: State,
    ) -> StateEvent {
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

    #[test]
    fn pause_resume_reconnects_transparently() -> anyhow::Result<()> {
        let _session = session_test_guard();
        let exec = RecordingExec::new();
        script_default_route(&exec);
        exec.respond("wg show", "PUBKEY\t1717171717");
        exec.push_spawn(SpawnScript::default());
        exec.push_spawn(SpawnScript::default());
        let svc = service(&exec);

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let handle = {
            let svc = svc.clone();
            thread::spawn(move || svc.connect(&params(), &events_tx))
        };

        wait_for_state(&events_rx, State::Connected);
        svc.pause();
        wait_for_state(&events_rx, State::Paused);
        svc.resume();
        // the facade re-runs the connect sequence
        wait_for_state(&events_rx, State::Connected);

        svc.disconnect();
        handle.join().unwrap()?;
        wait_for_state(&events_rx, State::Disconnected);

        // two full tunnels came and went
        assert_eq!(exec.state.lock().unwrap().kill_count, 2);
        Ok(())
    }

    struct RecordingSink {
        statuses: Mutex<Vec<StatusEvent>>,
        result: Mutex<Option<Result<GoodConnectionInfo, tester::Error>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink {
                statuses: Mutex::new(Vec::new()),
                result: Mutex::new(None),
            }
        }
    }

    impl TestEventSink for RecordingSink {
        fn on_status(&self, event: StatusEvent) {
            lock(&self.statuses).push(event);
        }

        fn on_result(&self, result: Result<GoodConnectionInfo, tester::Error>) {
            *lock(&self.result) = Some(result);
        }
    }

    #[test]
    fn connection_test_reports_through_sink() -> anyhow::Result<()> {
        let _session = session_test_guard();
        let exec = RecordingExec::new();
        exec.push_spawn(SpawnScript::default());
        exec.respond("wg show", "PUBKEY\t1717171717");
        let svc = service(&exec);
        let sink = Arc::new(RecordingSink::new());

        let servers = vec![Server {
            gateway: "us-nyc".into(),
            latitude: 40.71,
            longitude: -74.0,
            hosts: vec![tester::Host {
                hostname: "us-nyc-host1".into(),
                public_key: KEY.into(),
                endpoint_ip: "185.93.1.7".parse::<IpAddr>()?,
            }],
        }];
        let ports = vec![PortInfo {
            port: 2049,
            kind: PortKind::Udp,
        }];
        svc.connection_test_start(
            &params(),
            servers,
            Selection {
                gateway: "us-nyc".into(),
                port: 2049,
            },
            ports,
            sink.clone(),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while lock(&sink.result).is_none() {
            assert!(Instant::now() < deadline, "no test result in time");
            thread::sleep(Duration::from_millis(10));
        }

        let result = lock(&sink.result).take().unwrap()?;
        assert_eq!(result.gateway, "us-nyc");
        assert_eq!(result.port, 2049);
        assert_eq!(lock(&sink.statuses).len(), 1);
        Ok(())
    }
}
