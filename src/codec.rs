//! Frame-level pull decoder and encoder.
//!
//! The decoder is fed arbitrary byte chunks and appends typed events as
//! whole frames become decodable; header blocks stream through the zlib
//! decoder as their bytes arrive, and DATA payloads are assembled across
//! reads so each frame reaches the session as one unit for exact
//! flow-control accounting. Recoverable problems surface as
//! `FrameEvent::Skipped`; anything returned as `Err` is fatal to the
//! session.

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::{
    flags, ControlType, DataFrame, GoAwayFrame, GoAwayStatus, HeadersFrame, PingFrame, RawHeader,
    RstStreamFrame, SettingsFrame, StreamStatus, SynReplyFrame, SynStreamFrame, WindowUpdateFrame,
    FRAME_HEADER_SIZE, SPDY_VERSION,
};
use crate::header::{BlockOutcome, HeaderDecoder, HeaderEncoder};
use crate::settings::Setting;

/// A decoded frame event, in transport receive order.
#[derive(Debug)]
pub enum FrameEvent {
    Data {
        stream_id: u32,
        last: bool,
        payload: Bytes,
    },
    SynStream {
        stream_id: u32,
        associated_stream_id: u32,
        priority: u8,
        last: bool,
        unidirectional: bool,
    },
    SynReply {
        stream_id: u32,
        last: bool,
    },
    RstStream {
        stream_id: u32,
        status: StreamStatus,
    },
    Settings {
        clear_persisted: bool,
    },
    Setting(Setting),
    SettingsEnd,
    Ping {
        id: u32,
    },
    GoAway {
        last_good_stream_id: u32,
        status: GoAwayStatus,
    },
    Headers {
        stream_id: u32,
        last: bool,
    },
    WindowUpdate {
        stream_id: u32,
        delta: i32,
    },
    /// One decompressed name/value pair from the current header block.
    Header {
        stream_id: u32,
        name: String,
        value: String,
    },
    /// The current header block finished (valid or not).
    HeadersEnd {
        stream_id: u32,
    },
    /// A recoverable decode problem scoped to one frame.
    Skipped {
        stream_id: u32,
        reason: &'static str,
    },
}

enum DecodeState {
    Head,
    /// Buffering a control payload (or its fixed prelude, for frames that
    /// carry a header block).
    ControlPayload {
        kind: ControlType,
        frame_flags: u8,
        length: usize,
    },
    /// Streaming the compressed header block of a SYN_STREAM / SYN_REPLY /
    /// HEADERS frame into the zlib decoder.
    HeaderBlock {
        stream_id: u32,
        remaining: usize,
    },
    /// Assembling a DATA payload across reads.
    DataPayload {
        stream_id: u32,
        last: bool,
        remaining: usize,
    },
    /// Discarding the payload of an unknown control frame.
    Skip {
        remaining: usize,
    },
}

/// Pull decoder for the SPDY byte stream.
pub struct FrameDecoder {
    state: DecodeState,
    header_decoder: HeaderDecoder,
    pairs: Vec<(String, String)>,
    data_buf: BytesMut,
}

impl FrameDecoder {
    pub fn new(max_header_size: usize) -> Self {
        Self {
            state: DecodeState::Head,
            header_decoder: HeaderDecoder::new(max_header_size),
            pairs: Vec::new(),
            data_buf: BytesMut::new(),
        }
    }

    /// Consume whatever whole units are available in `buf`, appending the
    /// corresponding events. Leaves partial frames buffered for the next
    /// call.
    pub fn decode(&mut self, buf: &mut BytesMut, events: &mut Vec<FrameEvent>) -> Result<()> {
        loop {
            match &mut self.state {
                DecodeState::Head => {
                    let Some(header) = RawHeader::parse(buf) else {
                        return Ok(());
                    };
                    buf.advance(FRAME_HEADER_SIZE);
                    match header {
                        RawHeader::Control {
                            version,
                            kind,
                            flags: frame_flags,
                            length,
                        } => {
                            if version != SPDY_VERSION {
                                return Err(Error::frame(format!(
                                    "unsupported protocol version {}",
                                    version
                                )));
                            }
                            if let ControlType::Unknown(raw) = kind {
                                debug!(kind = raw, length, "skipping unknown control frame");
                                events.push(FrameEvent::Skipped {
                                    stream_id: 0,
                                    reason: "unknown control frame type",
                                });
                                self.state = DecodeState::Skip { remaining: length };
                            } else {
                                self.state = DecodeState::ControlPayload {
                                    kind,
                                    frame_flags,
                                    length,
                                };
                            }
                        }
                        RawHeader::Data {
                            stream_id,
                            flags: frame_flags,
                            length,
                        } => {
                            if stream_id == 0 {
                                return Err(Error::frame("data frame on session stream id"));
                            }
                            let last = frame_flags & flags::FIN != 0;
                            if length == 0 {
                                events.push(FrameEvent::Data {
                                    stream_id,
                                    last,
                                    payload: Bytes::new(),
                                });
                            } else {
                                self.state = DecodeState::DataPayload {
                                    stream_id,
                                    last,
                                    remaining: length,
                                };
                            }
                        }
                    }
                }

                DecodeState::ControlPayload {
                    kind,
                    frame_flags,
                    length,
                } => {
                    let kind = *kind;
                    let frame_flags = *frame_flags;
                    let length = *length;
                    // Header-block frames only need their fixed prelude
                    // buffered; everything else waits for the full payload.
                    let need = match kind {
                        ControlType::SynStream => 10.min(length),
                        ControlType::SynReply | ControlType::Headers => 4.min(length),
                        _ => length,
                    };
                    if buf.len() < need {
                        return Ok(());
                    }

                    match kind {
                        ControlType::SynStream => {
                            if length < 10 {
                                return Err(Error::frame("malformed SYN_STREAM frame"));
                            }
                            let prelude = buf.split_to(10).freeze();
                            let Some((stream_id, associated_stream_id, priority, _slot)) =
                                SynStreamFrame::parse_prelude(prelude)
                            else {
                                return Err(Error::frame("malformed SYN_STREAM frame"));
                            };
                            events.push(FrameEvent::SynStream {
                                stream_id,
                                associated_stream_id,
                                priority,
                                last: frame_flags & flags::FIN != 0,
                                unidirectional: frame_flags & flags::UNIDIRECTIONAL != 0,
                            });
                            self.enter_header_block(stream_id, length - 10, events);
                        }
                        ControlType::SynReply => {
                            if length < 4 {
                                return Err(Error::frame("malformed SYN_REPLY frame"));
                            }
                            let stream_id = buf.get_u32() & 0x7fff_ffff;
                            events.push(FrameEvent::SynReply {
                                stream_id,
                                last: frame_flags & flags::FIN != 0,
                            });
                            self.enter_header_block(stream_id, length - 4, events);
                        }
                        ControlType::Headers => {
                            if length < 4 {
                                return Err(Error::frame("malformed HEADERS frame"));
                            }
                            let stream_id = buf.get_u32() & 0x7fff_ffff;
                            events.push(FrameEvent::Headers {
                                stream_id,
                                last: frame_flags & flags::FIN != 0,
                            });
                            self.enter_header_block(stream_id, length - 4, events);
                        }
                        ControlType::RstStream => {
                            let payload = buf.split_to(length).freeze();
                            let Some(frame) = RstStreamFrame::parse(payload) else {
                                return Err(Error::frame("malformed RST_STREAM frame"));
                            };
                            events.push(FrameEvent::RstStream {
                                stream_id: frame.stream_id,
                                status: frame.status,
                            });
                            self.state = DecodeState::Head;
                        }
                        ControlType::Settings => {
                            let payload = buf.split_to(length).freeze();
                            let Some(frame) = SettingsFrame::parse(frame_flags, payload) else {
                                return Err(Error::frame("malformed SETTINGS frame"));
                            };
                            events.push(FrameEvent::Settings {
                                clear_persisted: frame.clear_persisted,
                            });
                            for entry in frame.entries {
                                events.push(FrameEvent::Setting(entry));
                            }
                            events.push(FrameEvent::SettingsEnd);
                            self.state = DecodeState::Head;
                        }
                        ControlType::Ping => {
                            let payload = buf.split_to(length).freeze();
                            let Some(frame) = PingFrame::parse(payload) else {
                                return Err(Error::frame("malformed PING frame"));
                            };
                            events.push(FrameEvent::Ping { id: frame.id });
                            self.state = DecodeState::Head;
                        }
                        ControlType::GoAway => {
                            let payload = buf.split_to(length).freeze();
                            let Some(frame) = GoAwayFrame::parse(payload) else {
                                return Err(Error::frame("malformed GOAWAY frame"));
                            };
                            events.push(FrameEvent::GoAway {
                                last_good_stream_id: frame.last_good_stream_id,
                                status: frame.status,
                            });
                            self.state = DecodeState::Head;
                        }
                        ControlType::WindowUpdate => {
                            let payload = buf.split_to(length).freeze();
                            let Some(frame) = WindowUpdateFrame::parse(payload) else {
                                return Err(Error::frame("malformed WINDOW_UPDATE frame"));
                            };
                            events.push(FrameEvent::WindowUpdate {
                                stream_id: frame.stream_id,
                                delta: frame.delta,
                            });
                            self.state = DecodeState::Head;
                        }
                        ControlType::Unknown(_) => {
                            // Routed to Skip when the header was parsed.
                            self.state = DecodeState::Skip { remaining: length };
                        }
                    }
                }

                DecodeState::HeaderBlock {
                    stream_id,
                    remaining,
                } => {
                    let stream_id = *stream_id;
                    if *remaining > 0 {
                        let n = buf.len().min(*remaining);
                        if n == 0 {
                            return Ok(());
                        }
                        let chunk = buf.split_to(n);
                        *remaining -= n;
                        self.header_decoder.decode(&chunk, &mut self.pairs)?;
                        for (name, value) in self.pairs.drain(..) {
                            events.push(FrameEvent::Header {
                                stream_id,
                                name,
                                value,
                            });
                        }
                    }
                    if let DecodeState::HeaderBlock { remaining: 0, .. } = self.state {
                        if let BlockOutcome::Invalid(reason) = self.header_decoder.end_block() {
                            events.push(FrameEvent::Skipped { stream_id, reason });
                        }
                        events.push(FrameEvent::HeadersEnd { stream_id });
                        self.state = DecodeState::Head;
                    }
                }

                DecodeState::DataPayload {
                    stream_id,
                    last,
                    remaining,
                } => {
                    let n = buf.len().min(*remaining);
                    if n == 0 {
                        return Ok(());
                    }
                    self.data_buf.extend_from_slice(&buf.split_to(n));
                    *remaining -= n;
                    if *remaining == 0 {
                        events.push(FrameEvent::Data {
                            stream_id: *stream_id,
                            last: *last,
                            payload: self.data_buf.split().freeze(),
                        });
                        self.state = DecodeState::Head;
                    }
                }

                DecodeState::Skip { remaining } => {
                    let n = buf.len().min(*remaining);
                    if n == 0 {
                        return Ok(());
                    }
                    buf.advance(n);
                    *remaining -= n;
                    if *remaining == 0 {
                        self.state = DecodeState::Head;
                    }
                }
            }
        }
    }

    fn enter_header_block(&mut self, stream_id: u32, remaining: usize, events: &mut Vec<FrameEvent>) {
        if remaining == 0 {
            // A header block always carries at least its pair count.
            events.push(FrameEvent::Skipped {
                stream_id,
                reason: "truncated header block",
            });
            events.push(FrameEvent::HeadersEnd { stream_id });
            self.state = DecodeState::Head;
        } else {
            self.state = DecodeState::HeaderBlock {
                stream_id,
                remaining,
            };
        }
    }
}

/// Frame encoder. Stateless per frame except for the header-block
/// compressor shared by SYN_STREAM / SYN_REPLY / HEADERS.
pub struct FrameEncoder {
    header_encoder: HeaderEncoder,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            header_encoder: HeaderEncoder::new(),
        }
    }

    pub fn encode_syn_stream(
        &mut self,
        stream_id: u32,
        associated_stream_id: u32,
        priority: u8,
        last: bool,
        unidirectional: bool,
        headers: &[(String, String)],
    ) -> Result<BytesMut> {
        let block = self.header_encoder.encode_block(headers)?;
        Ok(SynStreamFrame {
            stream_id,
            associated_stream_id,
            priority,
            last,
            unidirectional,
            header_block: block.freeze(),
        }
        .serialize())
    }

    pub fn encode_syn_reply(
        &mut self,
        stream_id: u32,
        last: bool,
        headers: &[(String, String)],
    ) -> Result<BytesMut> {
        let block = self.header_encoder.encode_block(headers)?;
        Ok(SynReplyFrame {
            stream_id,
            last,
            header_block: block.freeze(),
        }
        .serialize())
    }

    pub fn encode_headers(
        &mut self,
        stream_id: u32,
        last: bool,
        headers: &[(String, String)],
    ) -> Result<BytesMut> {
        let block = self.header_encoder.encode_block(headers)?;
        Ok(HeadersFrame {
            stream_id,
            last,
            header_block: block.freeze(),
        }
        .serialize())
    }

    pub fn encode_rst_stream(&self, stream_id: u32, status: StreamStatus) -> BytesMut {
        RstStreamFrame::new(stream_id, status).serialize()
    }

    pub fn encode_settings(&self, frame: &SettingsFrame) -> BytesMut {
        frame.serialize()
    }

    pub fn encode_ping(&self, id: u32) -> BytesMut {
        PingFrame::new(id).serialize()
    }

    pub fn encode_goaway(&self, last_good_stream_id: u32, status: GoAwayStatus) -> BytesMut {
        GoAwayFrame::new(last_good_stream_id, status).serialize()
    }

    pub fn encode_window_update(&self, stream_id: u32, delta: i32) -> BytesMut {
        WindowUpdateFrame::new(stream_id, delta).serialize()
    }

    pub fn encode_data(&self, stream_id: u32, last: bool, payload: Bytes) -> BytesMut {
        DataFrame::new(stream_id, payload).last(last).serialize()
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}
