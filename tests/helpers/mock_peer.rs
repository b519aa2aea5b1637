#![allow(dead_code)]

//! A scripted SPDY/3.1 peer for testing edge cases and protocol
//! violations. Frames are hand-built bytes so the crate's own encoder is
//! never on the peer side of an assertion; header blocks go through a
//! peer-owned zlib state.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use spindle::header::SPDY_DICTIONARY;

pub const SYN_STREAM: u16 = 1;
pub const SYN_REPLY: u16 = 2;
pub const RST_STREAM: u16 = 3;
pub const SETTINGS: u16 = 4;
pub const PING: u16 = 6;
pub const GOAWAY: u16 = 7;
pub const HEADERS: u16 = 8;
pub const WINDOW_UPDATE: u16 = 9;

/// One frame as read off the wire.
#[derive(Debug)]
pub struct RawFrame {
    pub control: bool,
    /// Control type; 0 for data frames.
    pub kind: u16,
    /// Stream id for data frames (control payloads carry their own).
    pub stream_id: u32,
    pub flags: u8,
    pub payload: Bytes,
}

pub struct MockPeer {
    io: DuplexStream,
    buf: BytesMut,
    deflater: Compress,
    deflater_primed: bool,
    inflater: Decompress,
}

impl MockPeer {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(16 * 1024),
            deflater: Compress::new(Compression::default(), true),
            deflater_primed: false,
            inflater: Decompress::new(true),
        }
    }

    /// Consume the client's startup frames: SETTINGS then PING.
    /// Sessions configured with a larger session window also send a
    /// WINDOW_UPDATE, which callers read themselves.
    pub async fn handshake(&mut self) {
        let settings = self.read_frame().await.expect("client SETTINGS");
        assert_eq!(settings.kind, SETTINGS);
        let ping = self.read_frame().await.expect("client PING");
        assert_eq!(ping.kind, PING);
        assert_eq!(ping_id(&ping), 1);
    }

    pub async fn read_frame(&mut self) -> std::io::Result<RawFrame> {
        while self.buf.len() < 8 {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client closed",
                ));
            }
        }
        let length = ((self.buf[5] as usize) << 16)
            | ((self.buf[6] as usize) << 8)
            | (self.buf[7] as usize);
        while self.buf.len() < 8 + length {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client closed mid-frame",
                ));
            }
        }
        let head = self.buf.split_to(8);
        let payload = self.buf.split_to(length).freeze();
        if head[0] & 0x80 != 0 {
            Ok(RawFrame {
                control: true,
                kind: ((head[2] as u16) << 8) | head[3] as u16,
                stream_id: 0,
                flags: head[4],
                payload,
            })
        } else {
            let stream_id = ((head[0] as u32 & 0x7f) << 24)
                | ((head[1] as u32) << 16)
                | ((head[2] as u32) << 8)
                | (head[3] as u32);
            Ok(RawFrame {
                control: false,
                kind: 0,
                stream_id,
                flags: head[4],
                payload,
            })
        }
    }

    /// Read the next frame and assert it is the given control type.
    pub async fn expect_control(&mut self, kind: u16) -> RawFrame {
        let frame = self.read_frame().await.expect("frame from client");
        assert!(frame.control, "expected control frame, got {:?}", frame);
        assert_eq!(frame.kind, kind, "unexpected control frame {:?}", frame);
        frame
    }

    /// Read the client's SYN_STREAM; returns (id, assoc, priority, fin,
    /// unidirectional, compressed header block).
    pub async fn read_syn_stream(&mut self) -> (u32, u32, u8, bool, bool, Bytes) {
        let frame = self.expect_control(SYN_STREAM).await;
        let mut payload = frame.payload.clone();
        let stream_id = payload.get_u32() & 0x7fff_ffff;
        let assoc = payload.get_u32() & 0x7fff_ffff;
        let priority = payload.get_u8() >> 5;
        let _slot = payload.get_u8();
        (
            stream_id,
            assoc,
            priority,
            frame.flags & 0x01 != 0,
            frame.flags & 0x02 != 0,
            payload,
        )
    }

    // --- outbound frames -------------------------------------------------

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.expect("peer write");
        self.io.flush().await.expect("peer flush");
    }

    pub async fn send_syn_stream(
        &mut self,
        stream_id: u32,
        assoc: u32,
        priority: u8,
        fin: bool,
        unidirectional: bool,
        headers: &[(&str, &str)],
    ) {
        let block = self.compress_headers(headers);
        let mut payload = BytesMut::with_capacity(10 + block.len());
        payload.put_u32(stream_id);
        payload.put_u32(assoc);
        payload.put_u8((priority & 0x7) << 5);
        payload.put_u8(0);
        payload.extend_from_slice(&block);
        let mut flags = 0u8;
        if fin {
            flags |= 0x01;
        }
        if unidirectional {
            flags |= 0x02;
        }
        let frame = control_frame(SYN_STREAM, flags, &payload);
        self.send_raw(&frame).await;
    }

    pub async fn send_syn_reply(&mut self, stream_id: u32, fin: bool, headers: &[(&str, &str)]) {
        let block = self.compress_headers(headers);
        self.send_syn_reply_block(stream_id, fin, &block).await;
    }

    /// SYN_REPLY with a caller-supplied header block (for malformed-block
    /// tests).
    pub async fn send_syn_reply_block(&mut self, stream_id: u32, fin: bool, block: &[u8]) {
        let mut payload = BytesMut::with_capacity(4 + block.len());
        payload.put_u32(stream_id);
        payload.extend_from_slice(block);
        let frame = control_frame(SYN_REPLY, if fin { 0x01 } else { 0 }, &payload);
        self.send_raw(&frame).await;
    }

    pub async fn send_headers(&mut self, stream_id: u32, fin: bool, headers: &[(&str, &str)]) {
        let block = self.compress_headers(headers);
        let mut payload = BytesMut::with_capacity(4 + block.len());
        payload.put_u32(stream_id);
        payload.extend_from_slice(&block);
        let frame = control_frame(HEADERS, if fin { 0x01 } else { 0 }, &payload);
        self.send_raw(&frame).await;
    }

    pub async fn send_data(&mut self, stream_id: u32, fin: bool, payload: &[u8]) {
        let mut frame = BytesMut::with_capacity(8 + payload.len());
        frame.put_u32(stream_id & 0x7fff_ffff);
        frame.put_u8(if fin { 0x01 } else { 0 });
        frame.put_u8((payload.len() >> 16) as u8);
        frame.put_u8((payload.len() >> 8) as u8);
        frame.put_u8(payload.len() as u8);
        frame.extend_from_slice(payload);
        self.send_raw(&frame).await;
    }

    pub async fn send_rst(&mut self, stream_id: u32, status: u32) {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(stream_id);
        payload.put_u32(status);
        let frame = control_frame(RST_STREAM, 0, &payload);
        self.send_raw(&frame).await;
    }

    pub async fn send_ping(&mut self, id: u32) {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(id);
        let frame = control_frame(PING, 0, &payload);
        self.send_raw(&frame).await;
    }

    pub async fn send_goaway(&mut self, last_good: u32, status: u32) {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(last_good);
        payload.put_u32(status);
        let frame = control_frame(GOAWAY, 0, &payload);
        self.send_raw(&frame).await;
    }

    pub async fn send_window_update(&mut self, stream_id: u32, delta: u32) {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(stream_id);
        payload.put_u32(delta);
        let frame = control_frame(WINDOW_UPDATE, 0, &payload);
        self.send_raw(&frame).await;
    }

    /// Entries are (id, value, entry_flags); entry flag 0x1 = persist
    /// value, 0x2 = persisted.
    pub async fn send_settings(&mut self, entries: &[(u32, u32, u8)], clear: bool) {
        let mut payload = BytesMut::with_capacity(4 + entries.len() * 8);
        payload.put_u32(entries.len() as u32);
        for (id, value, entry_flags) in entries {
            payload.put_u8(*entry_flags);
            payload.put_u8((id >> 16) as u8);
            payload.put_u8((id >> 8) as u8);
            payload.put_u8(*id as u8);
            payload.put_u32(*value);
        }
        let frame = control_frame(SETTINGS, if clear { 0x01 } else { 0 }, &payload);
        self.send_raw(&frame).await;
    }

    // --- header block plumbing -------------------------------------------

    pub fn compress_headers(&mut self, headers: &[(&str, &str)]) -> Vec<u8> {
        let mut plain = BytesMut::with_capacity(64);
        plain.put_u32(headers.len() as u32);
        for (name, value) in headers {
            plain.put_u32(name.len() as u32);
            plain.extend_from_slice(name.as_bytes());
            plain.put_u32(value.len() as u32);
            plain.extend_from_slice(value.as_bytes());
        }
        self.compress_raw(&plain)
    }

    /// Compress arbitrary plaintext through the peer's shared deflate
    /// state (for forging malformed blocks).
    pub fn compress_raw(&mut self, plain: &[u8]) -> Vec<u8> {
        if !self.deflater_primed {
            self.deflater
                .set_dictionary(SPDY_DICTIONARY)
                .expect("peer dictionary");
            self.deflater_primed = true;
        }
        let mut out = Vec::with_capacity(plain.len() + 128);
        let mut input = plain;
        loop {
            let before = self.deflater.total_in();
            self.deflater
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .expect("peer deflate");
            let consumed = (self.deflater.total_in() - before) as usize;
            input = &input[consumed..];
            if input.is_empty() && out.len() < out.capacity() {
                break;
            }
            out.reserve(out.capacity().max(256));
        }
        out
    }

    pub fn decompress_headers(&mut self, block: &[u8]) -> Vec<(String, String)> {
        let mut raw = Vec::new();
        let mut input = block;
        loop {
            let before = self.inflater.total_in();
            let mut out = Vec::with_capacity(4096);
            let result = self
                .inflater
                .decompress_vec(input, &mut out, FlushDecompress::Sync);
            // NEED_DICT still consumes the zlib header bytes.
            let consumed = (self.inflater.total_in() - before) as usize;
            let produced = out.len();
            raw.extend_from_slice(&out);
            input = &input[consumed..];
            match result {
                Ok(_) => {
                    if input.is_empty() && produced < 4096 {
                        break;
                    }
                    if consumed == 0 && produced == 0 {
                        break;
                    }
                }
                Err(e) if e.needs_dictionary().is_some() => {
                    self.inflater
                        .set_dictionary(SPDY_DICTIONARY)
                        .expect("peer dictionary");
                }
                Err(e) => panic!("peer inflate failed: {}", e),
            }
        }

        let mut cursor = &raw[..];
        let count = cursor.get_u32();
        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_len = cursor.get_u32() as usize;
            let name = String::from_utf8(cursor[..name_len].to_vec()).expect("header name");
            cursor.advance(name_len);
            let value_len = cursor.get_u32() as usize;
            let value = String::from_utf8(cursor[..value_len].to_vec()).expect("header value");
            cursor.advance(value_len);
            headers.push((name, value));
        }
        headers
    }
}

pub fn control_frame(kind: u16, flags: u8, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u16(0x8003);
    buf.put_u16(kind);
    buf.put_u8(flags);
    buf.put_u8((payload.len() >> 16) as u8);
    buf.put_u8((payload.len() >> 8) as u8);
    buf.put_u8(payload.len() as u8);
    buf.extend_from_slice(payload);
    buf
}

// --- payload accessors for frames read from the client -------------------

pub fn ping_id(frame: &RawFrame) -> u32 {
    let mut payload = frame.payload.clone();
    payload.get_u32()
}

pub fn rst_fields(frame: &RawFrame) -> (u32, u32) {
    let mut payload = frame.payload.clone();
    (payload.get_u32() & 0x7fff_ffff, payload.get_u32())
}

pub fn goaway_fields(frame: &RawFrame) -> (u32, u32) {
    let mut payload = frame.payload.clone();
    (payload.get_u32() & 0x7fff_ffff, payload.get_u32())
}

pub fn window_update_fields(frame: &RawFrame) -> (u32, u32) {
    let mut payload = frame.payload.clone();
    (payload.get_u32() & 0x7fff_ffff, payload.get_u32() & 0x7fff_ffff)
}

pub fn settings_entries(frame: &RawFrame) -> Vec<(u32, u32, u8)> {
    let mut payload = frame.payload.clone();
    let count = payload.get_u32();
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let flags = payload.get_u8();
        let id = ((payload.get_u8() as u32) << 16)
            | ((payload.get_u8() as u32) << 8)
            | payload.get_u8() as u32;
        let value = payload.get_u32();
        entries.push((id, value, flags));
    }
    entries
}
