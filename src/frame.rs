//! SPDY/3.1 frame types and binary serialization.
//!
//! Every frame carries an 8-byte common header. Control frames set the
//! high bit and carry (version, type, flags, 24-bit length); data frames
//! carry (31-bit stream id, flags, 24-bit length).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::settings::Setting;

/// Common frame header size (8 bytes).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Protocol version carried by every control frame.
pub const SPDY_VERSION: u16 = 3;

/// Stream id 0 addresses the session itself (WINDOW_UPDATE, PING, ...).
pub const SESSION_STREAM_ID: u32 = 0;

/// Initial flow-control window for both levels, per the protocol.
pub const DEFAULT_INITIAL_WINDOW_SIZE: i32 = 65_535;

/// Largest payload a single inbound frame may carry (24-bit length).
pub const MAX_FRAME_PAYLOAD: usize = 0xff_ffff;

/// Cap on outbound DATA chunks: 16 KiB minus the frame header.
pub const MAX_DATA_CHUNK: usize = 16 * 1024 - FRAME_HEADER_SIZE;

/// Control frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    SynStream,
    SynReply,
    RstStream,
    Settings,
    Ping,
    GoAway,
    Headers,
    WindowUpdate,
    Unknown(u16),
}

impl From<u16> for ControlType {
    fn from(v: u16) -> Self {
        match v {
            1 => Self::SynStream,
            2 => Self::SynReply,
            3 => Self::RstStream,
            4 => Self::Settings,
            6 => Self::Ping,
            7 => Self::GoAway,
            8 => Self::Headers,
            9 => Self::WindowUpdate,
            other => Self::Unknown(other),
        }
    }
}

impl From<ControlType> for u16 {
    fn from(t: ControlType) -> u16 {
        match t {
            ControlType::SynStream => 1,
            ControlType::SynReply => 2,
            ControlType::RstStream => 3,
            ControlType::Settings => 4,
            ControlType::Ping => 6,
            ControlType::GoAway => 7,
            ControlType::Headers => 8,
            ControlType::WindowUpdate => 9,
            ControlType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    /// Last frame in this direction on the stream.
    pub const FIN: u8 = 0x01;
    /// SYN_STREAM only: the pushed stream is one-directional.
    pub const UNIDIRECTIONAL: u8 = 0x02;
    /// SETTINGS only: drop previously persisted settings for the origin.
    pub const CLEAR_SETTINGS: u8 = 0x01;
    /// SETTINGS entry: sender asks receiver to persist the value.
    pub const SETTINGS_PERSIST_VALUE: u8 = 0x01;
    /// SETTINGS entry: value was previously persisted. Illegal from a server.
    pub const SETTINGS_PERSISTED: u8 = 0x02;
}

/// RST_STREAM status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    ProtocolError,
    InvalidStream,
    RefusedStream,
    UnsupportedVersion,
    Cancel,
    InternalError,
    FlowControlError,
    StreamInUse,
    StreamAlreadyClosed,
}

impl From<u32> for StreamStatus {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::ProtocolError,
            2 => Self::InvalidStream,
            3 => Self::RefusedStream,
            4 => Self::UnsupportedVersion,
            5 => Self::Cancel,
            6 => Self::InternalError,
            7 => Self::FlowControlError,
            8 => Self::StreamInUse,
            9 => Self::StreamAlreadyClosed,
            _ => Self::ProtocolError,
        }
    }
}

impl From<StreamStatus> for u32 {
    fn from(s: StreamStatus) -> u32 {
        match s {
            StreamStatus::ProtocolError => 1,
            StreamStatus::InvalidStream => 2,
            StreamStatus::RefusedStream => 3,
            StreamStatus::UnsupportedVersion => 4,
            StreamStatus::Cancel => 5,
            StreamStatus::InternalError => 6,
            StreamStatus::FlowControlError => 7,
            StreamStatus::StreamInUse => 8,
            StreamStatus::StreamAlreadyClosed => 9,
        }
    }
}

/// GOAWAY status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayStatus {
    Ok,
    ProtocolError,
    InternalError,
}

impl From<u32> for GoAwayStatus {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::ProtocolError,
            _ => Self::InternalError,
        }
    }
}

impl From<GoAwayStatus> for u32 {
    fn from(s: GoAwayStatus) -> u32 {
        match s {
            GoAwayStatus::Ok => 0,
            GoAwayStatus::ProtocolError => 1,
            GoAwayStatus::InternalError => 2,
        }
    }
}

/// Parsed 8-byte common header.
#[derive(Debug, Clone, Copy)]
pub enum RawHeader {
    Control {
        version: u16,
        kind: ControlType,
        flags: u8,
        length: usize,
    },
    Data {
        stream_id: u32,
        flags: u8,
        length: usize,
    },
}

impl RawHeader {
    /// Parse a common header. Requires at least 8 bytes.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let length = ((buf[5] as usize) << 16) | ((buf[6] as usize) << 8) | (buf[7] as usize);
        let flags = buf[4];
        if buf[0] & 0x80 != 0 {
            let version = (((buf[0] & 0x7f) as u16) << 8) | buf[1] as u16;
            let kind = ControlType::from(((buf[2] as u16) << 8) | buf[3] as u16);
            Some(Self::Control {
                version,
                kind,
                flags,
                length,
            })
        } else {
            let stream_id = ((buf[0] as u32 & 0x7f) << 24)
                | ((buf[1] as u32) << 16)
                | ((buf[2] as u32) << 8)
                | (buf[3] as u32);
            Some(Self::Data {
                stream_id,
                flags,
                length,
            })
        }
    }
}

fn put_control_header(buf: &mut BytesMut, kind: ControlType, frame_flags: u8, length: usize) {
    buf.put_u16(0x8000 | SPDY_VERSION);
    buf.put_u16(kind.into());
    buf.put_u8(frame_flags);
    buf.put_u8((length >> 16) as u8);
    buf.put_u8((length >> 8) as u8);
    buf.put_u8(length as u8);
}

/// SYN_STREAM frame. The header block is already compressed.
#[derive(Debug, Clone)]
pub struct SynStreamFrame {
    pub stream_id: u32,
    pub associated_stream_id: u32,
    pub priority: u8,
    pub last: bool,
    pub unidirectional: bool,
    pub header_block: Bytes,
}

impl SynStreamFrame {
    pub fn serialize(&self) -> BytesMut {
        let payload_len = 10 + self.header_block.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let mut frame_flags = 0u8;
        if self.last {
            frame_flags |= flags::FIN;
        }
        if self.unidirectional {
            frame_flags |= flags::UNIDIRECTIONAL;
        }

        put_control_header(&mut buf, ControlType::SynStream, frame_flags, payload_len);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
        buf.put_u32(self.associated_stream_id & 0x7fff_ffff);
        // Priority occupies the top 3 bits; the slot byte is unused.
        buf.put_u8((self.priority & 0x7) << 5);
        buf.put_u8(0);
        buf.extend_from_slice(&self.header_block);
        buf
    }

    /// Parse the fixed 10-byte prelude; the remainder of the payload is the
    /// compressed header block.
    pub fn parse_prelude(mut prelude: Bytes) -> Option<(u32, u32, u8, u8)> {
        if prelude.remaining() < 10 {
            return None;
        }
        let stream_id = prelude.get_u32() & 0x7fff_ffff;
        let associated = prelude.get_u32() & 0x7fff_ffff;
        let priority = prelude.get_u8() >> 5;
        let slot = prelude.get_u8();
        Some((stream_id, associated, priority, slot))
    }
}

/// SYN_REPLY frame. The header block is already compressed.
#[derive(Debug, Clone)]
pub struct SynReplyFrame {
    pub stream_id: u32,
    pub last: bool,
    pub header_block: Bytes,
}

impl SynReplyFrame {
    pub fn serialize(&self) -> BytesMut {
        let payload_len = 4 + self.header_block.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        let frame_flags = if self.last { flags::FIN } else { 0 };
        put_control_header(&mut buf, ControlType::SynReply, frame_flags, payload_len);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
        buf.extend_from_slice(&self.header_block);
        buf
    }
}

/// HEADERS frame. The header block is already compressed.
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub last: bool,
    pub header_block: Bytes,
}

impl HeadersFrame {
    pub fn serialize(&self) -> BytesMut {
        let payload_len = 4 + self.header_block.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        let frame_flags = if self.last { flags::FIN } else { 0 };
        put_control_header(&mut buf, ControlType::Headers, frame_flags, payload_len);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
        buf.extend_from_slice(&self.header_block);
        buf
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub status: StreamStatus,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, status: StreamStatus) -> Self {
        Self { stream_id, status }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        put_control_header(&mut buf, ControlType::RstStream, 0, 8);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
        buf.put_u32(self.status.into());
        buf
    }

    pub fn parse(mut payload: Bytes) -> Option<Self> {
        if payload.remaining() != 8 {
            return None;
        }
        let stream_id = payload.get_u32() & 0x7fff_ffff;
        let status = StreamStatus::from(payload.get_u32());
        Some(Self { stream_id, status })
    }
}

/// SETTINGS frame.
#[derive(Debug, Clone, Default)]
pub struct SettingsFrame {
    pub clear_persisted: bool,
    pub entries: Vec<Setting>,
}

impl SettingsFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: u32, value: u32) -> &mut Self {
        self.entries.push(Setting {
            id,
            value,
            persist_value: false,
            persisted: false,
        });
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let payload_len = 4 + self.entries.len() * 8;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        let frame_flags = if self.clear_persisted {
            flags::CLEAR_SETTINGS
        } else {
            0
        };
        put_control_header(&mut buf, ControlType::Settings, frame_flags, payload_len);
        buf.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            let mut entry_flags = 0u8;
            if entry.persist_value {
                entry_flags |= flags::SETTINGS_PERSIST_VALUE;
            }
            if entry.persisted {
                entry_flags |= flags::SETTINGS_PERSISTED;
            }
            buf.put_u8(entry_flags);
            buf.put_u8((entry.id >> 16) as u8);
            buf.put_u8((entry.id >> 8) as u8);
            buf.put_u8(entry.id as u8);
            buf.put_u32(entry.value);
        }
        buf
    }

    pub fn parse(frame_flags: u8, mut payload: Bytes) -> Option<Self> {
        if payload.remaining() < 4 {
            return None;
        }
        let count = payload.get_u32() as usize;
        if payload.remaining() != count * 8 {
            return None;
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let entry_flags = payload.get_u8();
            let id = ((payload.get_u8() as u32) << 16)
                | ((payload.get_u8() as u32) << 8)
                | payload.get_u8() as u32;
            let value = payload.get_u32();
            entries.push(Setting {
                id,
                value,
                persist_value: entry_flags & flags::SETTINGS_PERSIST_VALUE != 0,
                persisted: entry_flags & flags::SETTINGS_PERSISTED != 0,
            });
        }
        Some(Self {
            clear_persisted: frame_flags & flags::CLEAR_SETTINGS != 0,
            entries,
        })
    }
}

/// PING frame.
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub id: u32,
}

impl PingFrame {
    pub fn new(id: u32) -> Self {
        Self { id }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        put_control_header(&mut buf, ControlType::Ping, 0, 4);
        buf.put_u32(self.id);
        buf
    }

    pub fn parse(mut payload: Bytes) -> Option<Self> {
        if payload.remaining() != 4 {
            return None;
        }
        Some(Self {
            id: payload.get_u32(),
        })
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone, Copy)]
pub struct GoAwayFrame {
    pub last_good_stream_id: u32,
    pub status: GoAwayStatus,
}

impl GoAwayFrame {
    pub fn new(last_good_stream_id: u32, status: GoAwayStatus) -> Self {
        Self {
            last_good_stream_id,
            status,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        put_control_header(&mut buf, ControlType::GoAway, 0, 8);
        buf.put_u32(self.last_good_stream_id & 0x7fff_ffff);
        buf.put_u32(self.status.into());
        buf
    }

    pub fn parse(mut payload: Bytes) -> Option<Self> {
        if payload.remaining() != 8 {
            return None;
        }
        let last_good_stream_id = payload.get_u32() & 0x7fff_ffff;
        let status = GoAwayStatus::from(payload.get_u32());
        Some(Self {
            last_good_stream_id,
            status,
        })
    }
}

/// WINDOW_UPDATE frame. Stream id 0 addresses the session window.
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub delta: i32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, delta: i32) -> Self {
        Self { stream_id, delta }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        put_control_header(&mut buf, ControlType::WindowUpdate, 0, 8);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
        buf.put_u32(self.delta as u32 & 0x7fff_ffff);
        buf
    }

    pub fn parse(mut payload: Bytes) -> Option<Self> {
        if payload.remaining() != 8 {
            return None;
        }
        let stream_id = payload.get_u32() & 0x7fff_ffff;
        let delta = (payload.get_u32() & 0x7fff_ffff) as i32;
        Some(Self { stream_id, delta })
    }
}

/// DATA frame.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub last: bool,
    pub payload: Bytes,
}

impl DataFrame {
    pub fn new(stream_id: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            last: false,
            payload,
        }
    }

    pub fn last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.stream_id & 0x7fff_ffff);
        buf.put_u8(if self.last { flags::FIN } else { 0 });
        let length = self.payload.len();
        buf.put_u8((length >> 16) as u8);
        buf.put_u8((length >> 8) as u8);
        buf.put_u8(length as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }
}
