//! Wire protocol between the replication service and clients.
//!
//! Every message starts with a one-unit type code followed by the body.
//! Binary frames carry a `postcard` body after a single code byte; text frames
//! carry JSON after a single `char` whose scalar value is the code.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::marble::{MarbleId, RosterEntry};
use crate::round::RoundStatus;
use crate::snapshot::Snapshot;

pub const PROTOCOL_VERSION: u16 = 1;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown message code {0}")]
    UnknownCode(u32),

    #[error("Unexpected message type `{0}`")]
    UnexpectedType(MessageType),

    #[error("Malformed binary body: {0}")]
    Binary(#[from] postcard::Error),

    #[error("Malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed route table. Codes are stable within a protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0,
    SnapshotRequest = 1,
    Snapshot = 2,
    StatusRequest = 3,
    Status = 4,
    RosterRequest = 5,
    Roster = 6,
    Error = 7,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        Self::Hello,
        Self::SnapshotRequest,
        Self::Snapshot,
        Self::StatusRequest,
        Self::Status,
        Self::RosterRequest,
        Self::Roster,
        Self::Error,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn route(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::SnapshotRequest => "snapshot.request",
            Self::Snapshot => "snapshot",
            Self::StatusRequest => "round.status.request",
            Self::Status => "round.status",
            Self::RosterRequest => "roster.request",
            Self::Roster => "roster",
            Self::Error => "error",
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        Self::ALL
            .get(usize::from(code))
            .copied()
            .ok_or(ProtocolError::UnknownCode(u32::from(code)))
    }

    pub fn from_route(route: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.route() == route)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.route())
    }
}

/// One row of the route table as published to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteEntry {
    pub route: String,
    pub code: u8,
}

pub fn route_table() -> Vec<RouteEntry> {
    MessageType::ALL
        .into_iter()
        .map(|ty| RouteEntry {
            route: ty.route().to_string(),
            code: ty.code(),
        })
        .collect()
}

/// How a frame is carried on the socket. Responses mirror the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Binary,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

impl Frame {
    pub fn framing(&self) -> Framing {
        match self {
            Self::Binary(_) => Framing::Binary,
            Self::Text(_) => Framing::Text,
        }
    }

    /// Splits the frame into its type and decodes the body as `T`.
    fn decode_body<T: DeserializeOwned>(&self) -> Result<(MessageType, T), ProtocolError> {
        match self {
            Self::Binary(bytes) => {
                let (ty, body) = decode_binary(bytes)?;
                Ok((ty, postcard::from_bytes(body)?))
            }
            Self::Text(text) => {
                let (ty, body) = decode_text(text)?;
                Ok((ty, serde_json::from_str(body)?))
            }
        }
    }

    fn message_type(&self) -> Result<MessageType, ProtocolError> {
        match self {
            Self::Binary(bytes) => decode_binary(bytes).map(|(ty, _)| ty),
            Self::Text(text) => decode_text(text).map(|(ty, _)| ty),
        }
    }
}

pub fn encode_binary<T: Serialize + ?Sized>(
    ty: MessageType,
    body: &T,
) -> Result<Vec<u8>, ProtocolError> {
    let out = vec![ty.code()];
    Ok(postcard::to_extend(body, out)?)
}

/// Strips the code byte and returns the type with the remaining body.
pub fn decode_binary(bytes: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
    let (&code, body) = bytes.split_first().ok_or(ProtocolError::Empty)?;
    Ok((MessageType::from_code(code)?, body))
}

pub fn encode_text<T: Serialize + ?Sized>(
    ty: MessageType,
    body: &T,
) -> Result<String, ProtocolError> {
    let mut out = String::new();
    out.push(char::from(ty.code()));
    out.push_str(&serde_json::to_string(body)?);
    Ok(out)
}

/// Strips the code character and returns the type with the remaining body.
pub fn decode_text(text: &str) -> Result<(MessageType, &str), ProtocolError> {
    let first = text.chars().next().ok_or(ProtocolError::Empty)?;
    let code = u8::try_from(u32::from(first))
        .map_err(|_| ProtocolError::UnknownCode(u32::from(first)))?;
    Ok((MessageType::from_code(code)?, &text[first.len_utf8()..]))
}

fn encode<T: Serialize + ?Sized>(
    ty: MessageType,
    body: &T,
    framing: Framing,
) -> Result<Frame, ProtocolError> {
    match framing {
        Framing::Binary => encode_binary(ty, body).map(Frame::Binary),
        Framing::Text => encode_text(ty, body).map(Frame::Text),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct SnapshotRequestBody {
    seq: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    SnapshotRequest { seq: u32 },
    StatusRequest,
    RosterRequest,
}

impl ClientMessage {
    pub fn message_type(self) -> MessageType {
        match self {
            Self::SnapshotRequest { .. } => MessageType::SnapshotRequest,
            Self::StatusRequest => MessageType::StatusRequest,
            Self::RosterRequest => MessageType::RosterRequest,
        }
    }

    pub fn encode(self, framing: Framing) -> Result<Frame, ProtocolError> {
        match self {
            Self::SnapshotRequest { seq } => {
                encode(self.message_type(), &SnapshotRequestBody { seq }, framing)
            }
            Self::StatusRequest | Self::RosterRequest => encode(self.message_type(), &(), framing),
        }
    }

    /// Decodes a client frame. Server-to-client types are rejected.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.message_type()? {
            MessageType::SnapshotRequest => {
                let (_, body) = frame.decode_body::<SnapshotRequestBody>()?;
                Ok(Self::SnapshotRequest { seq: body.seq })
            }
            // Unit bodies are not inspected.
            MessageType::StatusRequest => Ok(Self::StatusRequest),
            MessageType::RosterRequest => Ok(Self::RosterRequest),
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    pub version: u16,
    pub routes: Vec<RouteEntry>,
    pub tickrate: u32,
    pub steps: u32,
}

impl Hello {
    pub fn new(tickrate: u32, steps: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            routes: route_table(),
            tickrate,
            steps,
        }
    }
}

/// Snapshot response as decoded by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotFrame {
    pub seq: u32,
    pub server_time_ms: u64,
    pub frame: u64,
    pub ids: Vec<MarbleId>,
    pub positions: Vec<f32>,
    pub rotations: Vec<f32>,
}

// Same layout as `SnapshotFrame`, borrowing from a shared snapshot.
#[derive(Serialize)]
struct SnapshotFrameRef<'a> {
    seq: u32,
    server_time_ms: u64,
    frame: u64,
    ids: &'a [MarbleId],
    positions: &'a [f32],
    rotations: &'a [f32],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Hello(Hello),
    Snapshot(SnapshotFrame),
    Status(RoundStatus),
    Roster(Vec<RosterEntry>),
    Error(ErrorBody),
}

impl ServerMessage {
    pub fn error(reason: impl fmt::Display) -> Self {
        Self::Error(ErrorBody {
            reason: reason.to_string(),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hello(_) => MessageType::Hello,
            Self::Snapshot(_) => MessageType::Snapshot,
            Self::Status(_) => MessageType::Status,
            Self::Roster(_) => MessageType::Roster,
            Self::Error(_) => MessageType::Error,
        }
    }

    pub fn encode(&self, framing: Framing) -> Result<Frame, ProtocolError> {
        let ty = self.message_type();
        match self {
            Self::Hello(body) => encode(ty, body, framing),
            Self::Snapshot(body) => encode(ty, body, framing),
            Self::Status(body) => encode(ty, body, framing),
            Self::Roster(body) => encode(ty, body, framing),
            Self::Error(body) => encode(ty, body, framing),
        }
    }

    /// Encodes a snapshot response without copying the snapshot buffers.
    pub fn encode_snapshot(
        seq: u32,
        snapshot: &Snapshot,
        framing: Framing,
    ) -> Result<Frame, ProtocolError> {
        let body = SnapshotFrameRef {
            seq,
            server_time_ms: u64::try_from(snapshot.server_time().as_millis()).unwrap_or(u64::MAX),
            frame: snapshot.frame(),
            ids: snapshot.ids(),
            positions: snapshot.positions(),
            rotations: snapshot.rotations(),
        };
        encode(MessageType::Snapshot, &body, framing)
    }

    /// Decodes a server frame. Client-to-server types are rejected.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.message_type()? {
            MessageType::Hello => Ok(Self::Hello(frame.decode_body()?.1)),
            MessageType::Snapshot => Ok(Self::Snapshot(frame.decode_body()?.1)),
            MessageType::Status => Ok(Self::Status(frame.decode_body()?.1)),
            MessageType::Roster => Ok(Self::Roster(frame.decode_body()?.1)),
            MessageType::Error => Ok(Self::Error(frame.decode_body()?.1)),
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{PhysicsConfig, TrackConfig};
    use crate::marble::{Color, EntityTable, MarbleEntity};
    use crate::physics::PhysicsWorld;
    use crate::snapshot::SnapshotEncoder;

    #[test]
    fn test_route_table_is_closed_and_stable() {
        for (index, ty) in MessageType::ALL.iter().enumerate() {
            assert_eq!(usize::from(ty.code()), index);
            assert_eq!(MessageType::from_route(ty.route()), Some(*ty));
        }
        assert_eq!(MessageType::from_route("round.status"), Some(MessageType::Status));
        assert_eq!(MessageType::from_route("chat"), None);
        assert_eq!(route_table().len(), 8);
    }

    #[test]
    fn test_unknown_codes_are_rejected() {
        assert!(matches!(
            decode_binary(&[42, 1, 2]),
            Err(ProtocolError::UnknownCode(42))
        ));
        assert!(matches!(decode_binary(&[]), Err(ProtocolError::Empty)));
        assert!(matches!(
            decode_text("\u{2603}{}"),
            Err(ProtocolError::UnknownCode(0x2603))
        ));
        assert!(matches!(decode_text(""), Err(ProtocolError::Empty)));
    }

    #[test]
    fn test_decode_strips_exactly_one_unit() {
        let bytes = encode_binary(MessageType::Error, "x").unwrap();
        let (ty, body) = decode_binary(&bytes).unwrap();
        assert_eq!(ty, MessageType::Error);
        assert_eq!(body.len(), bytes.len() - 1);

        let text = encode_text(MessageType::Roster, &Vec::<u8>::new()).unwrap();
        assert!(text.starts_with('\u{6}'));
        assert_eq!(decode_text(&text).unwrap(), (MessageType::Roster, "[]"));
    }

    #[test]
    fn test_client_request_framing() {
        for framing in [Framing::Binary, Framing::Text] {
            let frame = ClientMessage::SnapshotRequest { seq: 77 }.encode(framing).unwrap();
            assert_eq!(frame.framing(), framing);
            assert_eq!(
                ClientMessage::decode(&frame).unwrap(),
                ClientMessage::SnapshotRequest { seq: 77 }
            );
        }

        let text = Frame::Text(format!("{}{{\"seq\":3}}", char::from(1u8)));
        assert_eq!(
            ClientMessage::decode(&text).unwrap(),
            ClientMessage::SnapshotRequest { seq: 3 }
        );
    }

    #[test]
    fn test_server_types_rejected_from_clients() {
        let frame = ServerMessage::error("nope").encode(Framing::Binary).unwrap();
        assert!(matches!(
            ClientMessage::decode(&frame),
            Err(ProtocolError::UnexpectedType(MessageType::Error))
        ));
    }

    #[test]
    fn test_malformed_body() {
        let frame = Frame::Text(format!("{}{{\"seq\":\"a\"}}", char::from(1u8)));
        assert!(matches!(
            ClientMessage::decode(&frame),
            Err(ProtocolError::Json(_))
        ));
        let frame = Frame::Binary(vec![1]);
        assert!(matches!(
            ClientMessage::decode(&frame),
            Err(ProtocolError::Binary(_))
        ));
    }

    #[test]
    fn test_snapshot_response_matches_world() {
        let physics = PhysicsConfig {
            seed: Some(3),
            ..PhysicsConfig::default()
        };
        let mut world = PhysicsWorld::new(&physics, &TrackConfig::default());
        let mut table = EntityTable::new();
        for _ in 0..4 {
            table.insert_with(|id| MarbleEntity {
                id,
                owner_id: None,
                display_name: format!("m{id}"),
                color: Color::CYAN,
                size: 0.25,
                mass: 1.0,
                body: world.spawn_body(0.25, 1.0, u128::from(id)),
                finished: false,
                finish_time: None,
            });
        }
        world.open_gates();
        world.step_n(30);
        let snapshot = SnapshotEncoder::encode(
            &table,
            &world,
            world.current_frame(),
            Duration::from_millis(1_500),
        );

        for framing in [Framing::Binary, Framing::Text] {
            let frame = ServerMessage::encode_snapshot(9, &snapshot, framing).unwrap();
            let ServerMessage::Snapshot(decoded) = ServerMessage::decode(&frame).unwrap() else {
                panic!("expected a snapshot");
            };
            assert_eq!(decoded.seq, 9);
            assert_eq!(decoded.frame, 30);
            assert_eq!(decoded.server_time_ms, 1_500);
            assert_eq!(decoded.ids, vec![0, 1, 2, 3]);

            for (row, marble) in table.iter().enumerate() {
                let expected = world.query_transform(marble.body).unwrap();
                for axis in 0..3 {
                    assert!((decoded.positions[row * 3 + axis] - expected.position[axis]).abs() < 1e-5);
                }
                for axis in 0..4 {
                    assert!((decoded.rotations[row * 4 + axis] - expected.rotation[axis]).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_hello_carries_route_table() {
        let frame = ServerMessage::Hello(Hello::new(15, 120))
            .encode(Framing::Text)
            .unwrap();
        let ServerMessage::Hello(hello) = ServerMessage::decode(&frame).unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(hello.version, PROTOCOL_VERSION);
        assert_eq!(hello.routes, route_table());
        assert_eq!(hello.tickrate, 15);
    }
}
