use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::daemon::config::DaemonConfig;
use crate::daemon::delivery_queue::DeliveryQueue;
use crate::daemon::handshake::{Effect, Handshake, HandshakeState, SynDisposition, BUSY_NOTICE};
use crate::daemon::send_socket::SendSocket;
use crate::protocol::client_frame::{ClientFrame, ClientFrameType};
use crate::protocol::packet::{ChatOperation, ControlOperation, Operation, Packet, PacketError, SequenceRole, USER_FIELD_LEN};

pub const USERNAME_PROMPT: &str = "Please enter a username: ";
pub const WAIT_OR_START_PROMPT: &str = "Do you want to wait for connection or start one? [wait/start]: ";
pub const PEER_ADDRESS_PROMPT: &str = "Enter the other daemon's IP address: ";


/// Rejections that are reported to the local client as an `error` frame or a repeated prompt
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Error: There is no active chat session")]
    NoActiveSession,
    #[error("The daemon already connected to a client")]
    SecondClientRejected,
    #[error("{}", BUSY_NOTICE)]
    PeerBusy,
    #[error("Error: {0:?} is not a valid IP address")]
    InvalidPeerAddress(String),
    #[error("Error: a username must have 1 to {} ASCII characters", USER_FIELD_LEN)]
    InvalidUsername(String),
    #[error("Error: message can not be sent: {0}")]
    InvalidChatPayload(PacketError),
}

/// The prompt the attached client is currently expected to answer
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ClientDialog {
    Username,
    WaitOrStart,
    PeerAddress,
    /// no prompt is outstanding: the client waits, or answers a connection request, or chats
    Settled,
}

#[derive(Debug)]
struct AttachedClient {
    addr: SocketAddr,
    username: Option<String>,
    dialog: ClientDialog,
}

/// A SYN that arrived before a client was ready to answer it
#[derive(Debug, Clone, Eq, PartialEq)]
struct InboundRequest {
    from_user: String,
    from_addr: SocketAddr,
}

/// The session record of a daemon: at most one local client, at most one peer daemon.
///
/// A `Session` is owned by a single task which feeds it datagrams from both sockets and the
///  expiry of the retransmission deadline. It is never shared, so it needs no locking.
pub struct Session {
    config: Arc<DaemonConfig>,
    peer_socket: Arc<dyn SendSocket>,
    client_socket: Arc<dyn SendSocket>,
    client: Option<AttachedClient>,
    pending_request: Option<InboundRequest>,
    handshake: Handshake,
    delivery: DeliveryQueue,
}

impl Session {
    /// `self_addr` is this daemon's peer-facing address. It breaks the tie when two daemons
    ///  start a handshake with each other at the same time.
    pub fn new(config: Arc<DaemonConfig>, self_addr: SocketAddr, peer_socket: Arc<dyn SendSocket>, client_socket: Arc<dyn SendSocket>) -> Session {
        let delivery = DeliveryQueue::new(config.ack_timeout);
        Session {
            config,
            peer_socket,
            client_socket,
            client: None,
            pending_request: None,
            handshake: Handshake::new(self_addr),
            delivery,
        }
    }

    /// the username for outgoing packets, empty while no client has named itself
    fn username(&self) -> String {
        self.client.as_ref()
            .and_then(|c| c.username.clone())
            .unwrap_or_default()
    }

    fn is_attached_client(&self, addr: SocketAddr) -> bool {
        self.client.as_ref()
            .map(|c| c.addr == addr)
            .unwrap_or(false)
    }

    fn set_dialog(&mut self, dialog: ClientDialog) {
        if let Some(client) = &mut self.client {
            client.dialog = dialog;
        }
    }

    pub async fn on_client_datagram(&mut self, buf: &[u8], from: SocketAddr) {
        let frame = match ClientFrame::deser(buf) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed client datagram from {:?}: {}", from, e);
                return;
            }
        };
        debug!("received {:?} from client {:?}", frame, from);

        if !self.is_attached_client(from) {
            if frame.frame_type == ClientFrameType::Connect {
                self.on_client_connect(from).await;
            }
            else {
                warn!("dropping {:?} from {:?} which is not the attached client", frame, from);
            }
            return;
        }

        let dialog = self.client.as_ref()
            .map(|c| c.dialog)
            .unwrap_or(ClientDialog::Settled);

        match (frame.frame_type, dialog) {
            (ClientFrameType::Connect, ClientDialog::Username) => self.on_username(&frame.payload).await,
            (ClientFrameType::WaitOrStart, ClientDialog::WaitOrStart) => self.on_wait_or_start(&frame.payload).await,
            (ClientFrameType::WaitOrStart, ClientDialog::PeerAddress) => self.on_peer_address(&frame.payload).await,
            (ClientFrameType::Chat, _) => self.on_client_chat(&frame.payload).await,
            (ClientFrameType::Quit, _) => self.on_client_quit().await,
            (ClientFrameType::Answer, _) => self.on_client_answer(&frame.payload).await,
            (ClientFrameType::Reask, _) => self.on_reask().await,
            (frame_type, dialog) => {
                debug!("ignoring client frame {:?} while expecting {:?}", frame_type, dialog);
            }
        }
    }

    async fn on_client_connect(&mut self, from: SocketAddr) {
        if let Some(client) = &self.client {
            warn!("rejecting client {:?}: client {:?} is already attached", from, client.addr);
            let frame = ClientFrame::notification(ClientFrameType::Error, SessionError::SecondClientRejected.to_string());
            self.send_frame(from, &frame).await;
            return;
        }

        info!("client {:?} attached", from);
        self.client = Some(AttachedClient {
            addr: from,
            username: None,
            dialog: ClientDialog::Username,
        });
        self.send_frame(from, &ClientFrame::notification(ClientFrameType::Connect, "")).await;
        self.send_frame(from, &ClientFrame::prompt(ClientFrameType::Connect, USERNAME_PROMPT)).await;
    }

    async fn on_username(&mut self, username: &str) {
        let username = username.trim();
        if let Err(e) = validate_username(username) {
            info!("client sent invalid username {:?}", username);
            self.send_to_client(ClientFrame::prompt(ClientFrameType::Connect, format!("{}\n{}", e, USERNAME_PROMPT))).await;
            return;
        }

        info!("client is {:?}", username);
        if let Some(client) = &mut self.client {
            client.username = Some(username.to_string());
        }
        self.handshake.on_client_ready();

        match self.pending_request.take() {
            Some(request) => self.surface_request(request).await,
            None => self.offer_client_choice().await,
        }
    }

    async fn offer_client_choice(&mut self) {
        self.set_dialog(ClientDialog::WaitOrStart);
        self.send_to_client(ClientFrame::prompt(ClientFrameType::WaitOrStart, WAIT_OR_START_PROMPT)).await;
    }

    async fn on_wait_or_start(&mut self, answer: &str) {
        match answer.trim() {
            "start" => {
                self.set_dialog(ClientDialog::PeerAddress);
                self.send_to_client(ClientFrame::prompt(ClientFrameType::WaitOrStart, PEER_ADDRESS_PROMPT)).await;
            }
            "wait" => {
                info!("client waits for a connection request");
                self.set_dialog(ClientDialog::Settled);
            }
            other => {
                debug!("client answered {:?} to wait / start - asking again", other);
                self.offer_client_choice().await;
            }
        }
    }

    async fn on_peer_address(&mut self, raw: &str) {
        let peer = match parse_peer_addr(raw, self.config.daemon_port) {
            Ok(peer) => peer,
            Err(e) => {
                self.send_to_client(ClientFrame::prompt(ClientFrameType::WaitOrStart, format!("{}\n{}", e, PEER_ADDRESS_PROMPT))).await;
                return;
            }
        };

        info!("client requests a chat with {:?}", peer);
        self.set_dialog(ClientDialog::Settled);
        let effects = self.handshake.start(peer, &self.username());
        self.apply(effects).await;
    }

    async fn on_client_chat(&mut self, text: &str) {
        let result = if self.handshake.is_established() {
            self.delivery.enqueue(&self.username(), text)
                .map_err(SessionError::InvalidChatPayload)
        }
        else {
            Err(SessionError::NoActiveSession)
        };

        if let Err(e) = result {
            warn!("rejecting chat message from client: {}", e);
            self.send_to_client(ClientFrame::notification(ClientFrameType::Error, e.to_string())).await;
        }
    }

    async fn on_client_quit(&mut self) {
        info!("client quits");
        let effects = self.handshake.quit(&self.username());
        self.apply(effects).await;
    }

    async fn on_client_answer(&mut self, answer: &str) {
        let accept = answer == "y";
        let effects = self.handshake.answer(accept, &self.username());
        self.apply(effects).await;
    }

    async fn on_reask(&mut self) {
        let dialog = self.client.as_ref().map(|c| c.dialog);
        if self.handshake.state() == &HandshakeState::AwaitingClientChoice && dialog != Some(ClientDialog::WaitOrStart) {
            self.offer_client_choice().await;
        }
    }

    async fn surface_request(&mut self, request: InboundRequest) {
        self.set_dialog(ClientDialog::Settled);
        let effects = self.handshake.surface_request(request.from_addr, &request.from_user);
        self.apply(effects).await;
    }

    pub async fn on_peer_datagram(&mut self, buf: &[u8], from: SocketAddr) {
        let packet = match Packet::deser(buf) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping malformed datagram from {:?}: {}", from, e);
                return;
            }
        };
        debug!("received {:?} from {:?}", packet, from);

        match packet.operation {
            Operation::Chat(ChatOperation::Message) => self.on_peer_chat(packet, from).await,
            Operation::Control(ControlOperation::Syn) => self.on_syn(packet, from).await,
            Operation::Control(operation) => {
                let effects = self.handshake.on_peer_control(operation, from, &packet.payload, &self.username());
                self.apply(effects).await;
            }
        }
    }

    async fn on_peer_chat(&mut self, packet: Packet, from: SocketAddr) {
        if !self.handshake.is_connected_to(from) {
            warn!("dropping chat message from {:?} which is not connected", from);
            return;
        }

        self.send_to_client(ClientFrame::notification(ClientFrameType::Chat, packet.payload)).await;
        let ack = Packet::control(ControlOperation::Ack, SequenceRole::Response, &self.username(), "");
        self.send_to_peer(from, &ack).await;
    }

    async fn on_syn(&mut self, packet: Packet, from: SocketAddr) {
        let request = InboundRequest {
            from_user: packet.user,
            from_addr: from,
        };

        match self.handshake.classify_syn(from) {
            SynDisposition::Surface => {
                info!("connection request from {} at {:?}", request.from_user, from);
                self.surface_request(request).await;
            }
            SynDisposition::Buffer => {
                let is_other_request_waiting = self.pending_request.as_ref()
                    .map(|pending| pending.from_addr != from)
                    .unwrap_or(false);

                if is_other_request_waiting {
                    self.reply_busy(from).await;
                }
                else {
                    info!("connection request from {} at {:?} waits for a client", request.from_user, from);
                    self.pending_request = Some(request);
                }
            }
            SynDisposition::Busy => self.reply_busy(from).await,
            SynDisposition::Ignore => {
                debug!("ignoring SYN from {:?} in state {:?}", from, self.handshake.state());
            }
        }
    }

    async fn reply_busy(&self, to: SocketAddr) {
        info!("rejecting connection request from {:?}: {}", to, SessionError::PeerBusy);
        let reply = Handshake::busy_reply(&self.username());
        self.send_to_peer(to, &reply).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SendToPeer { to, packet } => self.send_to_peer(to, &packet).await,
                Effect::NotifyClient(frame) => self.send_to_client(frame).await,
                Effect::OfferClientChoice => self.offer_client_choice().await,
                Effect::Established => {
                    info!("chat session with {:?} established", self.handshake.peer());
                }
                Effect::ChatAcknowledged => {
                    self.delivery.on_ack();
                }
                Effect::Closed => self.reset(),
            }
        }
    }

    fn reset(&mut self) {
        info!("session ended, detaching client");
        self.delivery.clear();
        self.client = None;
        self.pending_request = None;
        self.handshake.reset();
    }

    /// Puts the next chat message on the wire if the previous one was acknowledged
    pub async fn pump_delivery(&mut self, now: Instant) {
        if !self.handshake.is_established() {
            return;
        }
        let Some(peer) = self.handshake.peer() else {
            return;
        };

        if let Some(packet) = self.delivery.next_to_send(now) {
            self.send_to_peer(peer, &packet).await;
        }
    }

    /// The point in time at which the in-flight chat message is re-sent if no ACK arrived
    pub fn retransmit_deadline(&self) -> Option<Instant> {
        if self.handshake.is_established() {
            self.delivery.retransmit_deadline()
        }
        else {
            None
        }
    }

    pub async fn on_retransmit_deadline(&mut self, now: Instant) {
        if self.delivery.on_timeout(now) {
            self.pump_delivery(now).await;
        }
    }

    async fn send_to_peer(&self, to: SocketAddr, packet: &Packet) {
        match packet.encode() {
            Ok(buf) => {
                debug!("sending {:?} to {:?}", packet, to);
                self.peer_socket.do_send(to, &buf).await;
            }
            Err(e) => error!("can not encode {:?}: {}", packet, e),
        }
    }

    async fn send_to_client(&self, frame: ClientFrame) {
        match &self.client {
            Some(client) => self.send_frame(client.addr, &frame).await,
            None => debug!("no client attached, discarding {:?}", frame),
        }
    }

    async fn send_frame(&self, to: SocketAddr, frame: &ClientFrame) {
        debug!("sending {:?} to client {:?}", frame, to);
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        self.client_socket.do_send(to, &buf).await;
    }
}

fn validate_username(username: &str) -> Result<(), SessionError> {
    if username.is_empty() {
        return Err(SessionError::InvalidUsername(username.to_string()));
    }
    Packet::chat(username, "").validate()
        .map_err(|_| SessionError::InvalidUsername(username.to_string()))
}

/// A peer is given either as `ip:port` or as a bare IP address, using the default daemon port
fn parse_peer_addr(raw: &str, default_port: u16) -> Result<SocketAddr, SessionError> {
    let raw = raw.trim();
    raw.parse::<SocketAddr>()
        .or_else(|_| raw.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, default_port)))
        .map_err(|_| SessionError::InvalidPeerAddress(raw.to_string()))
}
