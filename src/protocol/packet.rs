use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Size of the fixed part of a SIMP packet: kind, operation, sequence role, user, payload length
pub const HEADER_LEN: usize = 1 + 1 + 1 + USER_FIELD_LEN + 4;
pub const USER_FIELD_LEN: usize = 32;


#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PacketError {
    #[error("packet has {0} bytes, less than the {} byte header", HEADER_LEN)]
    TooShort(usize),
    #[error("invalid packet kind {0:#04x}")]
    InvalidKind(u8),
    #[error("invalid operation {operation:#04x} for packet kind {kind:?}")]
    InvalidOperation { kind: Kind, operation: u8 },
    #[error("invalid sequence role {0:#04x}")]
    InvalidSequenceRole(u8),
    #[error("user name has {0} bytes, at most {} are allowed", USER_FIELD_LEN)]
    UserTooLong(usize),
    #[error("user name contains non-ASCII characters")]
    NonAsciiUser,
    #[error("user name contains a NUL byte, which is reserved for padding")]
    NulInUser,
    #[error("payload contains non-ASCII characters")]
    NonAsciiPayload,
    #[error("payload has {0} bytes, too many for the length field")]
    PayloadTooLong(usize),
    #[error("declared payload length {declared} does not match the {actual} bytes received")]
    LengthMismatch { declared: u32, actual: usize },
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Kind {
    Control = 0x01,
    Chat = 0x02,
}

/// Control operations are bit flags on the wire. `SynAck` is the OR of `Syn` and `Ack`, and it
///  is encoded as a single byte `0x06` like any other operation.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ControlOperation {
    Error = 0x01,
    Syn = 0x02,
    Ack = 0x04,
    SynAck = 0x06,
    Fin = 0x08,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ChatOperation {
    Message = 0x01,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Operation {
    Control(ControlOperation),
    Chat(ChatOperation),
}
impl Operation {
    pub fn kind(&self) -> Kind {
        match self {
            Operation::Control(_) => Kind::Control,
            Operation::Chat(_) => Kind::Chat,
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            Operation::Control(op) => op.into(),
            Operation::Chat(op) => op.into(),
        }
    }

    fn from_raw(kind: Kind, raw: u8) -> Result<Operation, PacketError> {
        let invalid = || PacketError::InvalidOperation { kind, operation: raw };
        match kind {
            Kind::Control => ControlOperation::try_from(raw)
                .map(Operation::Control)
                .map_err(|_| invalid()),
            Kind::Chat => ChatOperation::try_from(raw)
                .map(Operation::Chat)
                .map_err(|_| invalid()),
        }
    }
}

/// Marks which side initiated a packet. This is *not* a sequence number: there is at most one
///  packet in flight at any time.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum SequenceRole {
    Request = 0x00,
    Response = 0x01,
}


/// A SIMP packet as exchanged between daemons:
///
/// ```ascii
///  0: kind (u8)
///  1: operation (u8), interpreted relative to kind
///  2: sequence role (u8)
///  3: user name, ASCII, right-padded with zero bytes (32 bytes)
/// 35: payload length (u32 BE)
/// 39: payload, ASCII
/// ```
///
/// The payload length is not stored: it is always derived from the payload when encoding.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub operation: Operation,
    pub sequence_role: SequenceRole,
    pub user: String,
    pub payload: String,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let op = match self.operation {
            Operation::Control(op) => format!("{:?}", op),
            Operation::Chat(op) => format!("Chat/{:?}", op),
        };
        write!(f, "SIMP{{{}/{:?} user:{:?} len:{} payload:{:?}}}", op, self.sequence_role, self.user, self.payload.len(), self.payload)
    }
}

impl Packet {
    pub fn control(operation: ControlOperation, sequence_role: SequenceRole, user: &str, payload: &str) -> Packet {
        Packet {
            operation: Operation::Control(operation),
            sequence_role,
            user: user.to_string(),
            payload: payload.to_string(),
        }
    }

    pub fn chat(user: &str, payload: &str) -> Packet {
        Packet {
            operation: Operation::Chat(ChatOperation::Message),
            sequence_role: SequenceRole::Request,
            user: user.to_string(),
            payload: payload.to_string(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.operation.kind()
    }

    /// Checks the field constraints that are not expressed in the types, i.e. the ones `ser`
    ///  can fail on
    pub fn validate(&self) -> Result<(), PacketError> {
        if !self.user.is_ascii() {
            return Err(PacketError::NonAsciiUser);
        }
        if self.user.contains('\0') {
            return Err(PacketError::NulInUser);
        }
        if self.user.len() > USER_FIELD_LEN {
            return Err(PacketError::UserTooLong(self.user.len()));
        }
        if !self.payload.is_ascii() {
            return Err(PacketError::NonAsciiPayload);
        }
        if u32::try_from(self.payload.len()).is_err() {
            return Err(PacketError::PayloadTooLong(self.payload.len()));
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        self.validate()?;

        buf.reserve(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind().into());
        buf.put_u8(self.operation.to_raw());
        buf.put_u8(self.sequence_role.into());

        buf.put_slice(self.user.as_bytes());
        buf.put_bytes(0, USER_FIELD_LEN - self.user.len());

        // fits, see validate()
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(self.payload.as_bytes());
        Ok(())
    }

    pub fn encode(&self) -> Result<BytesMut, PacketError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.ser(&mut buf)?;
        Ok(buf)
    }

    pub fn deser(mut buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::TooShort(buf.len()));
        }

        // the header length is checked above, so the fixed size reads can not underflow
        let raw_kind = buf.get_u8();
        let kind = Kind::try_from(raw_kind)
            .map_err(|_| PacketError::InvalidKind(raw_kind))?;
        let operation = Operation::from_raw(kind, buf.get_u8())?;

        let raw_role = buf.get_u8();
        let sequence_role = SequenceRole::try_from(raw_role)
            .map_err(|_| PacketError::InvalidSequenceRole(raw_role))?;

        let user_field = &buf[..USER_FIELD_LEN];
        let user_len = user_field.iter()
            .rposition(|&b| b != 0)
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let user = ascii_string(&user_field[..user_len], PacketError::NonAsciiUser)?;
        buf.advance(USER_FIELD_LEN);

        let declared = buf.get_u32();
        if declared as usize != buf.remaining() {
            return Err(PacketError::LengthMismatch { declared, actual: buf.remaining() });
        }
        let payload = ascii_string(buf, PacketError::NonAsciiPayload)?;

        Ok(Packet {
            operation,
            sequence_role,
            user,
            payload,
        })
    }
}

fn ascii_string(raw: &[u8], err: PacketError) -> Result<String, PacketError> {
    if !raw.is_ascii() {
        return Err(err);
    }
    // ASCII is always valid UTF-8
    Ok(raw.iter().map(|&b| b as char).collect())
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn header(kind: u8, op: u8, role: u8, user: &[u8], len: u32) -> Vec<u8> {
        let mut result = vec![kind, op, role];
        result.extend_from_slice(user);
        result.resize(3 + USER_FIELD_LEN, 0);
        result.extend_from_slice(&len.to_be_bytes());
        result
    }

    #[rstest]
    #[case::syn(Packet::control(ControlOperation::Syn, SequenceRole::Request, "alice", ""))]
    #[case::synack(Packet::control(ControlOperation::SynAck, SequenceRole::Response, "bob", ""))]
    #[case::fin_with_payload(Packet::control(ControlOperation::Fin, SequenceRole::Response, "bob", "Error: The other client declined your request"))]
    #[case::error(Packet::control(ControlOperation::Error, SequenceRole::Response, "", "User is busy in another chat"))]
    #[case::chat(Packet::chat("alice", "hello there"))]
    #[case::full_length_user(Packet::chat("abcdefghijklmnopqrstuvwxyz012345", "x"))]
    fn test_round_trip(#[case] packet: Packet) {
        let buf = packet.encode().unwrap();
        assert_eq!(buf.len(), HEADER_LEN + packet.payload.len());
        assert_eq!(Packet::deser(&buf).unwrap(), packet);
    }

    #[test]
    fn test_ser_layout() {
        let buf = Packet::chat("ab", "hi").encode().unwrap();

        let mut expected = header(0x02, 0x01, 0x00, b"ab", 2);
        expected.extend_from_slice(b"hi");
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::just_below_header(HEADER_LEN - 1)]
    fn test_deser_too_short(#[case] len: usize) {
        let buf = vec![1u8; len];
        assert_eq!(Packet::deser(&buf), Err(PacketError::TooShort(len)));
    }

    #[rstest]
    #[case::kind_zero(header(0x00, 0x02, 0x00, b"a", 0), PacketError::InvalidKind(0))]
    #[case::kind_three(header(0x03, 0x02, 0x00, b"a", 0), PacketError::InvalidKind(3))]
    #[case::control_op(header(0x01, 0x03, 0x00, b"a", 0), PacketError::InvalidOperation { kind: Kind::Control, operation: 3 })]
    #[case::control_op_zero(header(0x01, 0x00, 0x00, b"a", 0), PacketError::InvalidOperation { kind: Kind::Control, operation: 0 })]
    #[case::chat_syn(header(0x02, 0x02, 0x00, b"a", 0), PacketError::InvalidOperation { kind: Kind::Chat, operation: 2 })]
    #[case::role(header(0x01, 0x02, 0x02, b"a", 0), PacketError::InvalidSequenceRole(2))]
    #[case::length_too_big(header(0x01, 0x02, 0x00, b"a", 5), PacketError::LengthMismatch { declared: 5, actual: 0 })]
    #[case::non_ascii_user(header(0x01, 0x02, 0x00, &[0xc3, 0xa4], 0), PacketError::NonAsciiUser)]
    fn test_deser_invalid(#[case] buf: Vec<u8>, #[case] expected: PacketError) {
        assert_eq!(Packet::deser(&buf), Err(expected));
    }

    #[test]
    fn test_deser_length_too_small() {
        let mut buf = header(0x02, 0x01, 0x00, b"a", 1);
        buf.extend_from_slice(b"abc");
        assert_eq!(Packet::deser(&buf), Err(PacketError::LengthMismatch { declared: 1, actual: 3 }));
    }

    #[test]
    fn test_synack_from_or_of_syn_and_ack() {
        let syn = Packet::control(ControlOperation::Syn, SequenceRole::Response, "bob", "").encode().unwrap();
        let ack = Packet::control(ControlOperation::Ack, SequenceRole::Response, "bob", "").encode().unwrap();

        let combined: Vec<u8> = syn.iter().zip(ack.iter())
            .map(|(a, b)| a | b)
            .collect();

        let decoded = Packet::deser(&combined).unwrap();
        assert_eq!(decoded, Packet::control(ControlOperation::SynAck, SequenceRole::Response, "bob", ""));
        assert_eq!(combined, Packet::control(ControlOperation::SynAck, SequenceRole::Response, "bob", "").encode().unwrap().as_ref());
    }

    #[test]
    fn test_user_padding_is_stripped() {
        let buf = header(0x01, 0x04, 0x01, b"carol", 0);
        assert_eq!(Packet::deser(&buf).unwrap().user, "carol");
    }

    #[rstest]
    #[case::user_too_long(Packet::chat("abcdefghijklmnopqrstuvwxyz0123456", "x"), PacketError::UserTooLong(33))]
    #[case::non_ascii_user(Packet::chat("jürgen", "x"), PacketError::NonAsciiUser)]
    #[case::trailing_nul_in_user(Packet::chat("ab\0", "x"), PacketError::NulInUser)]
    #[case::inner_nul_in_user(Packet::chat("a\0b", "x"), PacketError::NulInUser)]
    #[case::non_ascii_payload(Packet::chat("alice", "grüße"), PacketError::NonAsciiPayload)]
    fn test_ser_invalid(#[case] packet: Packet, #[case] expected: PacketError) {
        assert_eq!(packet.encode(), Err(expected));
    }
}
