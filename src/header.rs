//! SPDY/3.1 header block compression.
//!
//! Name/value blocks are zlib-compressed with a protocol-defined shared
//! dictionary, with one streaming state per direction that persists
//! across blocks (SYNC flush per block). The decoder keeps consuming a
//! malformed block so its shared state stays synchronized with the peer,
//! then reports the block invalid; only zlib-level failures are fatal.

use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, Result};

/// The shared zlib dictionary defined by the SPDY/3 specification.
/// Most entries are 32-bit length-prefixed strings; the tail is raw text.
pub const SPDY_DICTIONARY: &[u8] = b"\x00\x00\x00\x07options\x00\x00\x00\x04head\x00\x00\x00\x04post\
\x00\x00\x00\x03put\x00\x00\x00\x06delete\x00\x00\x00\x05trace\x00\x00\x00\x06accept\
\x00\x00\x00\x0eaccept-charset\x00\x00\x00\x0faccept-encoding\x00\x00\x00\x0faccept-language\
\x00\x00\x00\x0daccept-ranges\x00\x00\x00\x03age\x00\x00\x00\x05allow\x00\x00\x00\x0dauthorization\
\x00\x00\x00\x0dcache-control\x00\x00\x00\x0aconnection\x00\x00\x00\x0ccontent-base\
\x00\x00\x00\x10content-encoding\x00\x00\x00\x10content-language\x00\x00\x00\x0econtent-length\
\x00\x00\x00\x10content-location\x00\x00\x00\x0bcontent-md5\x00\x00\x00\x0dcontent-range\
\x00\x00\x00\x0ccontent-type\x00\x00\x00\x04date\x00\x00\x00\x04etag\x00\x00\x00\x06expect\
\x00\x00\x00\x07expires\x00\x00\x00\x04from\x00\x00\x00\x04host\x00\x00\x00\x08if-match\
\x00\x00\x00\x11if-modified-since\x00\x00\x00\x0dif-none-match\x00\x00\x00\x08if-range\
\x00\x00\x00\x13if-unmodified-since\x00\x00\x00\x0dlast-modified\x00\x00\x00\x08location\
\x00\x00\x00\x0cmax-forwards\x00\x00\x00\x06pragma\x00\x00\x00\x12proxy-authenticate\
\x00\x00\x00\x13proxy-authorization\x00\x00\x00\x05range\x00\x00\x00\x07referer\
\x00\x00\x00\x0bretry-after\x00\x00\x00\x06server\x00\x00\x00\x02te\x00\x00\x00\x07trailer\
\x00\x00\x00\x11transfer-encoding\x00\x00\x00\x07upgrade\x00\x00\x00\x0auser-agent\
\x00\x00\x00\x04vary\x00\x00\x00\x03via\x00\x00\x00\x07warning\x00\x00\x00\x10www-authenticate\
\x00\x00\x00\x06method\x00\x00\x00\x03get\x00\x00\x00\x06status\x00\x00\x00\x06200 OK\
\x00\x00\x00\x07version\x00\x00\x00\x08HTTP/1.1\x00\x00\x00\x03url\x00\x00\x00\x06public\
\x00\x00\x00\x0aset-cookie\x00\x00\x00\x0akeep-alive\x00\x00\x00\x06origin\
100101201202205206300302303304305306307402405406407408409410411412413414415416417502504505\
203 Non-Authoritative Information204 No Content301 Moved Permanently400 Bad Request\
401 Unauthorized403 Forbidden404 Not Found500 Internal Server Error501 Not Implemented\
503 Service UnavailableJan Feb Mar Apr May Jun Jul Aug Sept Oct Nov Dec 00:00:00\
\x20Mon, Tue, Wed, Thu, Fri, Sat, Sun, GMTchunked,text/html,image/png,image/jpg,image/gif,\
application/xml,application/xhtml+xml,text/plain,text/javascript,publicprivatemax-age=\
gzip,deflate,sdchcharset=utf-8charset=iso-8859-1,utf-,*,enq=0.";

const INFLATE_CHUNK: usize = 8 * 1024;

/// Result of finishing one header block on the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Valid,
    /// The block was malformed or oversized. Stream-scoped: the zlib state
    /// is intact and later blocks will still decode.
    Invalid(&'static str),
}

/// Compressing side of the header codec (one per session direction).
pub struct HeaderEncoder {
    deflater: Compress,
    dictionary_set: bool,
}

impl HeaderEncoder {
    pub fn new() -> Self {
        Self {
            deflater: Compress::new(Compression::default(), true),
            dictionary_set: false,
        }
    }

    /// Compress one name/value block.
    pub fn encode_block(&mut self, headers: &[(String, String)]) -> Result<BytesMut> {
        if !self.dictionary_set {
            self.deflater
                .set_dictionary(SPDY_DICTIONARY)
                .map_err(|e| Error::frame(format!("deflate dictionary rejected: {}", e)))?;
            self.dictionary_set = true;
        }

        let mut plain = BytesMut::with_capacity(64);
        plain.put_u32(headers.len() as u32);
        for (name, value) in headers {
            plain.put_u32(name.len() as u32);
            plain.extend_from_slice(name.as_bytes());
            plain.put_u32(value.len() as u32);
            plain.extend_from_slice(value.as_bytes());
        }

        let mut out = Vec::with_capacity(plain.len() + 64);
        let mut input = &plain[..];
        loop {
            let before_in = self.deflater.total_in();
            let before_out = self.deflater.total_out();
            self.deflater
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .map_err(|e| Error::frame(format!("header deflate error: {}", e)))?;
            let consumed = (self.deflater.total_in() - before_in) as usize;
            let produced = (self.deflater.total_out() - before_out) as usize;
            input = &input[consumed..];

            let filled = out.len() == out.capacity();
            if input.is_empty() && !filled {
                break;
            }
            if filled {
                out.reserve(out.capacity().max(256));
            } else if consumed == 0 && produced == 0 {
                break;
            }
        }
        Ok(BytesMut::from(&out[..]))
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decompressing side of the header codec (one per session direction).
///
/// Blocks are fed incrementally as compressed bytes arrive; decoded
/// name/value pairs are reported as soon as they are complete. When a
/// block turns out malformed or oversized, the remaining compressed
/// bytes are still inflated (and discarded) to keep the shared state in
/// sync, and `end_block` reports the invalidity.
pub struct HeaderDecoder {
    inflater: Decompress,
    buffered: BytesMut,
    pairs_remaining: Option<u32>,
    invalid: Option<&'static str>,
    block_size: usize,
    max_header_size: usize,
}

impl HeaderDecoder {
    pub fn new(max_header_size: usize) -> Self {
        Self {
            inflater: Decompress::new(true),
            buffered: BytesMut::new(),
            pairs_remaining: None,
            invalid: None,
            block_size: 0,
            max_header_size,
        }
    }

    /// Feed a chunk of the current block's compressed bytes, appending any
    /// completed (name, value) pairs. Errors are fatal to the session.
    pub fn decode(&mut self, compressed: &[u8], pairs: &mut Vec<(String, String)>) -> Result<()> {
        self.inflate(compressed)?;
        self.parse_pairs(pairs);
        Ok(())
    }

    /// Finish the current block and reset per-block state.
    pub fn end_block(&mut self) -> BlockOutcome {
        let outcome = if let Some(reason) = self.invalid {
            BlockOutcome::Invalid(reason)
        } else {
            match self.pairs_remaining {
                Some(0) if self.buffered.is_empty() => BlockOutcome::Valid,
                Some(0) => BlockOutcome::Invalid("extraneous bytes after header block"),
                _ => BlockOutcome::Invalid("truncated header block"),
            }
        };
        self.invalid = None;
        self.pairs_remaining = None;
        self.block_size = 0;
        self.buffered.clear();
        outcome
    }

    fn inflate(&mut self, compressed: &[u8]) -> Result<()> {
        let mut input = compressed;
        loop {
            let before_in = self.inflater.total_in();
            let mut out = Vec::with_capacity(INFLATE_CHUNK);
            let result = self
                .inflater
                .decompress_vec(input, &mut out, FlushDecompress::Sync);
            // The stream consumes bytes even on a NEED_DICT return, so
            // account for them before deciding what to do.
            let consumed = (self.inflater.total_in() - before_in) as usize;
            let produced = out.len();
            self.buffered.extend_from_slice(&out);
            input = &input[consumed..];

            match result {
                Ok(_) => {
                    if input.is_empty() && produced < INFLATE_CHUNK {
                        return Ok(());
                    }
                    if consumed == 0 && produced == 0 {
                        return Ok(());
                    }
                }
                Err(e) if e.needs_dictionary().is_some() => {
                    self.inflater
                        .set_dictionary(SPDY_DICTIONARY)
                        .map_err(|e| Error::frame(format!("inflate dictionary rejected: {}", e)))?;
                }
                Err(e) => return Err(Error::frame(format!("header inflate error: {}", e))),
            }
        }
    }

    fn parse_pairs(&mut self, pairs: &mut Vec<(String, String)>) {
        if self.invalid.is_some() {
            self.buffered.clear();
            return;
        }
        loop {
            let remaining = match self.pairs_remaining {
                Some(n) => n,
                None => {
                    if self.buffered.len() < 4 {
                        return;
                    }
                    let count = be32(&self.buffered[..4]);
                    self.buffered.advance(4);
                    self.pairs_remaining = Some(count);
                    count
                }
            };
            if remaining == 0 {
                return;
            }

            if self.buffered.len() < 4 {
                return;
            }
            let name_len = be32(&self.buffered[..4]) as usize;
            if name_len == 0 || name_len > self.max_header_size {
                self.mark_invalid("invalid header name length");
                return;
            }
            if self.buffered.len() < 4 + name_len + 4 {
                return;
            }
            let value_len = be32(&self.buffered[4 + name_len..8 + name_len]) as usize;
            if value_len == 0 || value_len > self.max_header_size {
                self.mark_invalid("invalid header value length");
                return;
            }
            if self.buffered.len() < 8 + name_len + value_len {
                return;
            }

            self.buffered.advance(4);
            let name = self.buffered.split_to(name_len);
            self.buffered.advance(4);
            let value = self.buffered.split_to(value_len);
            self.pairs_remaining = Some(remaining - 1);

            self.block_size += name_len + value_len;
            if self.block_size > self.max_header_size {
                self.mark_invalid("header block exceeds maximum size");
                return;
            }

            let name = String::from_utf8_lossy(&name).into_owned();
            // A NUL byte inside a value separates multiple values.
            for part in value[..].split(|b| *b == 0) {
                if part.is_empty() {
                    self.mark_invalid("zero-length header value");
                    return;
                }
                pairs.push((name.clone(), String::from_utf8_lossy(part).into_owned()));
            }
        }
    }

    fn mark_invalid(&mut self, reason: &'static str) {
        self.invalid = Some(reason);
        self.buffered.clear();
    }
}

fn be32(buf: &[u8]) -> u32 {
    ((buf[0] as u32) << 24) | ((buf[1] as u32) << 16) | ((buf[2] as u32) << 8) | (buf[3] as u32)
}
