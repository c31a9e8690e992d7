use clap::{Parser, Subcommand};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use summit_vpn_lib::dns::{DnsSettings, Encryption};
use summit_vpn_lib::tunnel::{self, ConnectionParameters, MultihopExit};

/// Summit VPN system service - manages WireGuard tunnels for Summit VPN
/// connections
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Establish a tunnel and keep it up until interrupted
    Connect(ConnectArgs),
    /// Verify the WireGuard tooling this service depends on
    Check,
}

#[derive(Clone, Debug, clap::Args)]
pub struct ConnectArgs {
    /// Public IP of the VPN server
    #[arg(long, env = "SUMMITVPN_HOST_IP")]
    pub host_ip: IpAddr,

    /// WireGuard public key of the VPN server
    #[arg(long, env = "SUMMITVPN_HOST_PUBLIC_KEY")]
    pub host_public_key: String,

    /// UDP port of the VPN server
    #[arg(long, env = "SUMMITVPN_HOST_PORT", default_value_t = 2049)]
    pub host_port: u16,

    /// Peer gateway address inside the tunnel
    #[arg(long, env = "SUMMITVPN_HOST_LOCAL_IP")]
    pub host_local_ip: Ipv4Addr,

    /// Peer IPv6 gateway address inside the tunnel
    #[arg(long, env = "SUMMITVPN_HOST_LOCAL_IPV6")]
    pub host_local_ipv6: Option<Ipv6Addr>,

    /// Local tunnel address assigned to this client
    #[arg(long, env = "SUMMITVPN_CLIENT_IP")]
    pub client_ip: Ipv4Addr,

    /// Local tunnel IPv6 address assigned to this client
    #[arg(long, env = "SUMMITVPN_CLIENT_IPV6")]
    pub client_ipv6: Option<Ipv6Addr>,

    /// WireGuard private key of this client
    #[arg(long, env = "SUMMITVPN_CLIENT_PRIVATE_KEY")]
    pub private_key: String,

    /// Tunnel MTU, 0 keeps the platform default
    #[arg(long, env = "SUMMITVPN_MTU", default_value_t = 0)]
    pub mtu: u16,

    /// Resolver to install while connected (plain DNS)
    #[arg(long, env = "SUMMITVPN_DNS")]
    pub dns: Option<IpAddr>,

    /// DNS-over-HTTPS template; switches the resolver to DoH
    #[arg(long, env = "SUMMITVPN_DOH_TEMPLATE")]
    pub doh_template: Option<String>,

    /// Exit server name for multihop setups
    #[arg(long, env = "SUMMITVPN_EXIT_HOST", requires = "exit_public_key")]
    pub exit_host: Option<String>,

    /// WireGuard public key of the multihop exit host
    #[arg(long, env = "SUMMITVPN_EXIT_PUBLIC_KEY", requires = "exit_host")]
    pub exit_public_key: Option<String>,

    /// Entry-server port forwarding to the exit host (defaults to --host-port)
    #[arg(long, env = "SUMMITVPN_EXIT_PORT")]
    pub exit_port: Option<u16>,

    /// How long to wait for the first handshake
    #[arg(long, env = "SUMMITVPN_HANDSHAKE_TIMEOUT", default_value = "15s", value_parser = humantime::parse_duration)]
    pub handshake_timeout: Duration,
}

pub fn parse() -> Cli {
    Cli::parse()
}

impl ConnectArgs {
    pub fn connection_parameters(&self) -> Result<ConnectionParameters, tunnel::Error> {
        let dns = match (self.dns, &self.doh_template) {
            (Some(ip), Some(template)) => Some(
                DnsSettings::new(ip, Encryption::Doh, Some(template.clone()))
                    .map_err(tunnel::Error::Dns)?,
            ),
            (Some(ip), None) => Some(DnsSettings::plain(ip)),
            (None, _) => None,
        };
        let multihop = match (&self.exit_host, &self.exit_public_key) {
            (Some(host_name), Some(public_key)) => Some(MultihopExit {
                host_name: host_name.clone(),
                public_key: public_key.clone(),
                port: self.exit_port.unwrap_or(self.host_port),
            }),
            _ => None,
        };
        let params = ConnectionParameters {
            client_ipv4: self.client_ip,
            client_ipv6: self.client_ipv6,
            client_private_key: self.private_key.clone(),
            host_public_key: self.host_public_key.clone(),
            host_ip: self.host_ip,
            host_local_ipv4: self.host_local_ip,
            host_local_ipv6: self.host_local_ipv6,
            host_port: self.host_port,
            mtu: self.mtu,
            multihop,
            dns,
        };
        params.validate()?;
        Ok(params)
    }
}
