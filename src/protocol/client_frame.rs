use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};


#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ClientFrameType {
    Connect = 0x00,
    Chat = 0x01,
    Error = 0x02,
    Quit = 0x03,
    ConnectionRequest = 0x04,
    WaitOrStart = 0x05,
    ConnectionEstablished = 0x06,
    Reask = 0x07,
    Answer = 0x09,
}

/// A datagram between the daemon and its local client:
///
/// ```ascii
/// 0: frame type (u8)
/// 1: response flag (u8) - 0x01 if the sender waits for an answer
/// 2: payload, UTF-8
/// ```
///
/// NB: The response flag is carried for compatibility only, no behavior depends on it. Any value
///      other than `0x01` reads as "no response expected", and clients may even omit the flag
///      (and the payload) entirely, e.g. a bare `[0x07]` reask.
#[derive(Clone, Eq, PartialEq)]
pub struct ClientFrame {
    pub frame_type: ClientFrameType,
    pub expects_response: bool,
    pub payload: String,
}

impl Debug for ClientFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let flag = if self.expects_response { "?" } else { "" };
        write!(f, "CLNT{{{:?}{} {:?}}}", self.frame_type, flag, self.payload)
    }
}

impl ClientFrame {
    const FLAG_EXPECTS_RESPONSE: u8 = 0x01;
    const FLAG_NONE: u8 = 0x00;

    pub fn notification(frame_type: ClientFrameType, payload: impl Into<String>) -> ClientFrame {
        ClientFrame {
            frame_type,
            expects_response: false,
            payload: payload.into(),
        }
    }

    pub fn prompt(frame_type: ClientFrameType, payload: impl Into<String>) -> ClientFrame {
        ClientFrame {
            frame_type,
            expects_response: true,
            payload: payload.into(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type.into());
        buf.put_u8(if self.expects_response { Self::FLAG_EXPECTS_RESPONSE } else { Self::FLAG_NONE });
        buf.put_slice(self.payload.as_bytes());
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<ClientFrame> {
        let (&raw_type, rest) = buf.split_first()
            .ok_or_else(|| anyhow!("empty client frame"))?;
        let frame_type = ClientFrameType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid client frame type {:#04x}", raw_type))?;

        let (expects_response, payload) = match rest.split_first() {
            None => (false, &[][..]),
            Some((&flag, payload)) => (flag == Self::FLAG_EXPECTS_RESPONSE, payload),
        };

        Ok(ClientFrame {
            frame_type,
            expects_response,
            payload: String::from_utf8(payload.to_vec())?,
        })
    }
}
