//! The SIMP daemon: it relays chat between its single local client and at most one peer daemon.
//!
//! The daemon owns two UDP sockets, one facing the peer daemon and one facing the local client.
//!  A single task receives from both and owns the [session::Session], so all state changes are
//!  serialized without locks. The retransmission deadline of the chat message in flight is the
//!  third event source of that loop.

pub mod config;
pub mod send_socket;
pub mod delivery_queue;
pub mod handshake;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info};

use crate::daemon::config::DaemonConfig;
use crate::daemon::session::Session;


pub struct Daemon {
    config: Arc<DaemonConfig>,
    peer_socket: Arc<UdpSocket>,
    client_socket: Arc<UdpSocket>,
}

impl Daemon {
    pub async fn bind(config: DaemonConfig) -> anyhow::Result<Daemon> {
        config.validate()?;

        let peer_socket = Arc::new(UdpSocket::bind(config.daemon_addr()).await?);
        let client_socket = Arc::new(UdpSocket::bind(config.client_addr()).await?);
        info!("listening for daemons on {:?}, for the client on {:?}", peer_socket.local_addr()?, client_socket.local_addr()?);

        Ok(Daemon {
            config: Arc::new(config),
            peer_socket,
            client_socket,
        })
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.peer_socket.local_addr()?)
    }

    pub fn client_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.client_socket.local_addr()?)
    }

    /// Runs the daemon until the surrounding task is dropped. Receive errors are logged and do
    ///  not terminate the loop.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut session = Session::new(
            self.config.clone(),
            self.peer_addr()?,
            Arc::new(self.peer_socket.clone()),
            Arc::new(self.client_socket.clone()),
        );

        let mut peer_buf = vec![0u8; self.config.recv_buffer_size];
        let mut client_buf = vec![0u8; self.config.recv_buffer_size];

        loop {
            let retransmit_deadline = session.retransmit_deadline();

            select! {
                r = self.peer_socket.recv_from(&mut peer_buf) => {
                    match r {
                        Ok((len, from)) => session.on_peer_datagram(&peer_buf[..len], from).await,
                        Err(e) => error!("error receiving from daemon socket: {}", e),
                    }
                }
                r = self.client_socket.recv_from(&mut client_buf) => {
                    match r {
                        Ok((len, from)) => session.on_client_datagram(&client_buf[..len], from).await,
                        Err(e) => error!("error receiving from client socket: {}", e),
                    }
                }
                _ = wait_until(retransmit_deadline) => {
                    session.on_retransmit_deadline(Instant::now()).await;
                }
            }

            session.pump_delivery(Instant::now()).await;
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn loopback_config() -> DaemonConfig {
        DaemonConfig {
            daemon_port: 0,
            client_port: 0,
            ..DaemonConfig::new(Ipv4Addr::LOCALHOST.into())
        }
    }

    struct TestClient {
        socket: UdpSocket,
        daemon: SocketAddr,
    }
    impl TestClient {
        async fn new(daemon: &Daemon) -> TestClient {
            TestClient {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                daemon: daemon.client_addr().unwrap(),
            }
        }

        async fn send(&self, buf: &[u8]) {
            self.socket.send_to(buf, self.daemon).await.unwrap();
        }

        async fn expect(&self, expected: &[u8]) {
            let mut buf = [0u8; 4096];
            let (len, from) = timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf)).await
                .expect("timed out waiting for the daemon")
                .unwrap();
            assert_eq!(from, self.daemon);
            assert_eq!(String::from_utf8_lossy(&buf[..len]), String::from_utf8_lossy(expected));
        }

        async fn log_in(&self, username: &str) {
            self.send(b"\x00\x01").await;
            self.expect(b"\x00\x00").await;
            self.expect(b"\x00\x01Please enter a username: ").await;
            self.send(format!("\x00\x01{}", username).as_bytes()).await;
            self.expect(b"\x05\x01Do you want to wait for connection or start one? [wait/start]: ").await;
        }
    }

    #[tokio::test]
    async fn test_chat_between_two_daemons() {
        let daemon_a = Arc::new(Daemon::bind(loopback_config()).await.unwrap());
        let daemon_b = Arc::new(Daemon::bind(loopback_config()).await.unwrap());
        let addr_a = daemon_a.peer_addr().unwrap();
        let addr_b = daemon_b.peer_addr().unwrap();

        let alice = TestClient::new(&daemon_a).await;
        let bob = TestClient::new(&daemon_b).await;

        let handle_a = tokio::spawn({
            let daemon = daemon_a.clone();
            async move { daemon.run().await }
        });
        let handle_b = tokio::spawn({
            let daemon = daemon_b.clone();
            async move { daemon.run().await }
        });

        alice.log_in("alice").await;
        bob.log_in("bob").await;
        bob.send(b"\x05\x00wait").await;

        alice.send(b"\x05\x00start").await;
        alice.expect(b"\x05\x01Enter the other daemon's IP address: ").await;
        alice.send(format!("\x05\x00{}", addr_b).as_bytes()).await;

        bob.expect(format!("\x04\x01Request from user alice address: 127.0.0.1:{}. Do you want to accept? [y/n]: ", addr_a.port()).as_bytes()).await;
        bob.send(b"\x09\x01y").await;

        alice.expect(b"\x06\x00Connection established").await;
        bob.expect(b"\x06\x00Connection established").await;

        alice.send(b"\x01\x01hello bob").await;
        bob.expect(b"\x01\x00hello bob").await;
        bob.send(b"\x01\x01hi alice").await;
        alice.expect(b"\x01\x00hi alice").await;

        alice.send(b"\x03\x00").await;
        bob.expect(b"\x03\x00").await;
        alice.expect(b"\x03\x00").await;

        // a detached client can attach again
        bob.log_in("bob").await;

        handle_a.abort();
        handle_b.abort();
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = DaemonConfig {
            recv_buffer_size: 10,
            ..loopback_config()
        };
        assert!(Daemon::bind(config).await.is_err());
    }
}
