use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::daemon::send_socket::SendSocket;


/// Records all datagrams instead of sending them
#[derive(Debug, Default)]
pub struct TrackingSendSocket {
    tracker: RwLock<Vec<(SocketAddr, Vec<u8>)>>,
}
impl TrackingSendSocket {
    /// returns sent datagrams, clearing the internal buffer
    pub async fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut lock = self.tracker.write().await;
        std::mem::take(&mut *lock)
    }
}

#[async_trait]
impl SendSocket for TrackingSendSocket {
    async fn do_send(&self, to: SocketAddr, buf: &[u8]) {
        self.tracker.write().await.push((to, buf.to_vec()));
    }
}
