//! Wire formats spoken by a SIMP daemon.
//!
//! There are two of them, on two separate UDP sockets:
//!
//! * [packet::Packet] is the SIMP protocol between two daemons (default port 7777): a fixed
//!    39 byte header followed by an ASCII payload. Control packets (SYN, SYNACK, ACK, FIN, ERROR)
//!    drive the three-way handshake and the teardown, chat packets carry messages and are
//!    acknowledged one at a time (stop-and-wait).
//! * [client_frame::ClientFrame] is the framing between a daemon and its single local client
//!    (default port 7778): frame type, response flag, UTF-8 payload.
//!
//! Neither format has any notion of authentication or encryption.

pub mod packet;
pub mod client_frame;
