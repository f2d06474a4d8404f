use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::protocol::client_frame::{ClientFrame, ClientFrameType};
use crate::protocol::packet::{ControlOperation, Packet, SequenceRole};

pub const BUSY_NOTICE: &str = "User is busy in another chat";
pub const DECLINE_NOTICE: &str = "Error: The other client declined your request";
pub const ESTABLISHED_NOTICE: &str = "Connection established";


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeState {
    /// no client that could answer a request, no peer
    Idle,
    /// a client is attached and may choose between waiting and starting a connection
    AwaitingClientChoice,
    /// SYN was sent, waiting for SYNACK, FIN (declined) or ERROR (busy)
    Requesting { peer: SocketAddr },
    /// SYN was received and surfaced to the client, waiting for its yes / no
    PendingAccept { peer: SocketAddr, from_user: String },
    /// The handshake is complete. On the accepting side, `confirmed` stays false between
    ///  sending SYNACK and receiving the final ACK.
    Connected { peer: SocketAddr, confirmed: bool },
    /// FIN was sent, waiting for the matching ACK
    Closing { peer: SocketAddr },
}

/// What the session needs to do as a consequence of a handshake transition
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Effect {
    SendToPeer { to: SocketAddr, packet: Packet },
    NotifyClient(ClientFrame),
    /// the client should be offered to wait or start a connection (again)
    OfferClientChoice,
    /// chat messages can flow now
    Established,
    /// the ACK is for the chat message in flight rather than for the handshake
    ChatAcknowledged,
    /// the session ended, and the session record must be reset
    Closed,
}

/// How to react to an incoming SYN in the current state
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SynDisposition {
    /// ask the client right away
    Surface,
    /// keep the request until a client is ready to answer it
    Buffer,
    /// answer with ERROR, leaving the current session alone
    Busy,
    Ignore,
}


#[derive(Debug)]
pub struct Handshake {
    self_addr: SocketAddr,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(self_addr: SocketAddr) -> Handshake {
        Handshake {
            self_addr,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match &self.state {
            HandshakeState::Idle | HandshakeState::AwaitingClientChoice => None,
            HandshakeState::Requesting { peer } |
            HandshakeState::PendingAccept { peer, .. } |
            HandshakeState::Connected { peer, .. } |
            HandshakeState::Closing { peer } => Some(*peer),
        }
    }

    /// `true` once both sides consider the handshake complete
    pub fn is_established(&self) -> bool {
        matches!(self.state, HandshakeState::Connected { confirmed: true, .. })
    }

    pub fn is_connected_to(&self, addr: SocketAddr) -> bool {
        matches!(self.state, HandshakeState::Connected { peer, .. } if peer == addr)
    }

    pub fn reset(&mut self) {
        self.set_state(HandshakeState::Idle);
    }

    fn set_state(&mut self, new_state: HandshakeState) {
        if new_state != self.state {
            info!("handshake state {:?} -> {:?}", self.state, new_state);
            self.state = new_state;
        }
    }

    /// The local client is attached and has a username, so it can make decisions
    pub fn on_client_ready(&mut self) {
        if self.state == HandshakeState::Idle {
            self.set_state(HandshakeState::AwaitingClientChoice);
        }
    }

    pub fn start(&mut self, peer: SocketAddr, user: &str) -> Vec<Effect> {
        match self.state {
            HandshakeState::Idle | HandshakeState::AwaitingClientChoice => {
                self.set_state(HandshakeState::Requesting { peer });
                vec![Effect::SendToPeer {
                    to: peer,
                    packet: Packet::control(ControlOperation::Syn, SequenceRole::Request, user, ""),
                }]
            }
            _ => {
                warn!("client requested a connection to {:?} in state {:?} - ignoring", peer, self.state);
                vec![]
            }
        }
    }

    pub fn classify_syn(&self, from: SocketAddr) -> SynDisposition {
        match &self.state {
            HandshakeState::Idle => SynDisposition::Buffer,
            HandshakeState::AwaitingClientChoice => SynDisposition::Surface,
            HandshakeState::Requesting { peer } if *peer == from => {
                // both sides started at the same time: the lower address yields and treats the
                //  peer's SYN as an incoming request, the other one waits for the SYNACK
                if self.self_addr < from {
                    SynDisposition::Surface
                }
                else {
                    SynDisposition::Ignore
                }
            }
            HandshakeState::PendingAccept { peer, .. } |
            HandshakeState::Connected { peer, .. } |
            HandshakeState::Closing { peer } if *peer == from => SynDisposition::Ignore,
            _ => SynDisposition::Busy,
        }
    }

    /// Builds the ERROR reply for a SYN that arrives while this daemon is busy
    pub fn busy_reply(user: &str) -> Packet {
        Packet::control(ControlOperation::Error, SequenceRole::Response, user, BUSY_NOTICE)
    }

    /// Asks the client whether it accepts a connection request
    pub fn surface_request(&mut self, peer: SocketAddr, from_user: &str) -> Vec<Effect> {
        let prompt = format!("Request from user {} address: {}:{}. Do you want to accept? [y/n]: ", from_user, peer.ip(), peer.port());
        self.set_state(HandshakeState::PendingAccept { peer, from_user: from_user.to_string() });
        vec![Effect::NotifyClient(ClientFrame::prompt(ClientFrameType::ConnectionRequest, prompt))]
    }

    pub fn answer(&mut self, accept: bool, user: &str) -> Vec<Effect> {
        let HandshakeState::PendingAccept { peer, from_user } = &self.state else {
            debug!("client answered while no request is pending - ignoring");
            return vec![];
        };
        let peer = *peer;

        if accept {
            info!("client accepted connection request from {} at {:?}", from_user, peer);
            self.set_state(HandshakeState::Connected { peer, confirmed: false });
            vec![Effect::SendToPeer {
                to: peer,
                packet: Packet::control(ControlOperation::SynAck, SequenceRole::Response, user, ""),
            }]
        }
        else {
            info!("client declined connection request from {} at {:?}", from_user, peer);
            self.set_state(HandshakeState::AwaitingClientChoice);
            vec![
                Effect::SendToPeer {
                    to: peer,
                    packet: Packet::control(ControlOperation::Fin, SequenceRole::Response, user, DECLINE_NOTICE),
                },
                Effect::OfferClientChoice,
            ]
        }
    }

    /// Handles every control packet except SYN (see [Handshake::classify_syn])
    pub fn on_peer_control(&mut self, operation: ControlOperation, from: SocketAddr, payload: &str, user: &str) -> Vec<Effect> {
        if self.peer() != Some(from) {
            warn!("received {:?} from {:?} which is not the current peer - ignoring", operation, from);
            return vec![];
        }

        match (self.state.clone(), operation) {
            // crossing SYNs that were both accepted lead to crossing SYNACKs, each side in the
            //  unconfirmed state
            (HandshakeState::Requesting { .. } | HandshakeState::Connected { confirmed: false, .. }, ControlOperation::SynAck) => {
                let mut effects = vec![Effect::SendToPeer {
                    to: from,
                    packet: Packet::control(ControlOperation::Ack, SequenceRole::Request, user, ""),
                }];
                effects.extend(self.confirm(from));
                effects
            }
            (HandshakeState::Requesting { .. }, ControlOperation::Fin | ControlOperation::Error) => {
                let notice = match (payload.is_empty(), operation) {
                    (false, _) => payload,
                    (true, ControlOperation::Error) => BUSY_NOTICE,
                    (true, _) => DECLINE_NOTICE,
                };
                info!("connection request to {:?} was rejected: {}", from, notice);
                self.set_state(HandshakeState::AwaitingClientChoice);
                vec![
                    Effect::NotifyClient(ClientFrame::notification(ClientFrameType::Error, notice)),
                    Effect::OfferClientChoice,
                ]
            }
            (HandshakeState::Connected { confirmed: false, .. }, ControlOperation::Ack) => self.confirm(from),
            (HandshakeState::Connected { confirmed: true, .. }, ControlOperation::Ack) => {
                vec![Effect::ChatAcknowledged]
            }
            (HandshakeState::Connected { .. } | HandshakeState::Closing { .. }, ControlOperation::Fin) => {
                info!("peer {:?} closed the session", from);
                self.reset();
                vec![
                    Effect::SendToPeer {
                        to: from,
                        packet: Packet::control(ControlOperation::Ack, SequenceRole::Response, user, ""),
                    },
                    Effect::NotifyClient(ClientFrame::notification(ClientFrameType::Quit, payload)),
                    Effect::Closed,
                ]
            }
            (HandshakeState::Closing { .. }, ControlOperation::Ack) => {
                info!("peer {:?} acknowledged the end of the session", from);
                self.reset();
                vec![
                    Effect::NotifyClient(ClientFrame::notification(ClientFrameType::Quit, "")),
                    Effect::Closed,
                ]
            }
            (state, operation) => {
                warn!("unexpected {:?} from {:?} in state {:?} - ignoring", operation, from, state);
                vec![]
            }
        }
    }

    fn confirm(&mut self, peer: SocketAddr) -> Vec<Effect> {
        self.set_state(HandshakeState::Connected { peer, confirmed: true });
        vec![
            Effect::NotifyClient(ClientFrame::notification(ClientFrameType::ConnectionEstablished, ESTABLISHED_NOTICE)),
            Effect::Established,
        ]
    }

    /// The local client wants to end the session, or leave if there is none
    pub fn quit(&mut self, user: &str) -> Vec<Effect> {
        match self.state.clone() {
            HandshakeState::Connected { peer, .. } => {
                self.set_state(HandshakeState::Closing { peer });
                vec![Effect::SendToPeer {
                    to: peer,
                    packet: Packet::control(ControlOperation::Fin, SequenceRole::Request, user, ""),
                }]
            }
            HandshakeState::Closing { .. } => {
                debug!("client quit while FIN is already in flight - ignoring");
                vec![]
            }
            HandshakeState::PendingAccept { peer, .. } => {
                self.reset();
                vec![
                    Effect::SendToPeer {
                        to: peer,
                        packet: Packet::control(ControlOperation::Fin, SequenceRole::Response, user, DECLINE_NOTICE),
                    },
                    Effect::NotifyClient(ClientFrame::notification(ClientFrameType::Quit, "")),
                    Effect::Closed,
                ]
            }
            HandshakeState::Idle | HandshakeState::AwaitingClientChoice | HandshakeState::Requesting { .. } => {
                self.reset();
                vec![
                    Effect::NotifyClient(ClientFrame::notification(ClientFrameType::Quit, "")),
                    Effect::Closed,
                ]
            }
        }
    }
}
