use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::bail;

use crate::protocol::packet::HEADER_LEN;


#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind_ip: IpAddr,
    /// The port for daemon-to-daemon traffic. This is also the port assumed for peers that are
    ///  given as a bare IP address.
    pub daemon_port: u16,
    pub client_port: u16,
    pub recv_buffer_size: usize,
    /// time to wait for the ACK of a chat message before it is re-sent
    pub ack_timeout: Duration,
}

impl DaemonConfig {
    pub const DEFAULT_DAEMON_PORT: u16 = 7777;
    pub const DEFAULT_CLIENT_PORT: u16 = 7778;

    pub fn new(bind_ip: IpAddr) -> DaemonConfig {
        DaemonConfig {
            bind_ip,
            daemon_port: Self::DEFAULT_DAEMON_PORT,
            client_port: Self::DEFAULT_CLIENT_PORT,
            recv_buffer_size: 4096,
            ack_timeout: Duration::from_secs(5),
        }
    }

    pub fn daemon_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.daemon_port)
    }

    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.client_port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_buffer_size < HEADER_LEN {
            bail!("receive buffer size {} can not hold a packet header of {} bytes", self.recv_buffer_size, HEADER_LEN);
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if self.bind_ip.is_ipv6() {
            bail!("only IPv4 is supported");
        }
        if self.bind_ip.is_unspecified() {
            bail!("bind address {} is unspecified", self.bind_ip);
        }
        Ok(())
    }
}
