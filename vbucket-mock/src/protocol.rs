//! Binary wire protocol: fixed 24-byte headers plus extras/key/value bodies.
//!
//! Everything here is pure and stateless. Requests are decoded out of a byte
//! buffer without consuming partial frames; responses are encoded by
//! recomputing the body length from their parts. The numeric opcode and
//! status spaces match the emulated protocol bit for bit.

use bytes::{Buf, BufMut, BytesMut};

/// Fixed size of every request and response header.
pub const HEADER_LEN: usize = 24;

pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Largest value the store accepts.
pub const MAX_VALUE_LEN: usize = 20 * 1024 * 1024;

/// Largest total body we are willing to buffer for a single frame. Anything
/// above this cannot be satisfied and is a fatal framing error.
pub const MAX_BODY_LEN: usize = MAX_VALUE_LEN + 64 * 1024;

/// Keys longer than this are rejected with `Status::InvalidArguments`.
pub const MAX_KEY_LEN: usize = 250;

/// A framing fault. These are fatal to the connection: no response is sent
/// for the offending frame and the socket is closed.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad magic byte 0x{0:02x}")]
    BadMagic(u8),

    #[error("declared body length {0} exceeds the {MAX_BODY_LEN} byte limit")]
    BodyTooLarge(usize),

    #[error("key length {key} plus extras length {extras} exceed body length {body}")]
    Inconsistent { key: usize, extras: usize, body: usize },

    #[error("unknown status code 0x{0:04x}")]
    UnknownStatus(u16),
}

/// Request opcodes, numbered per the emulated protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Verbosity = 0x1b,
    Touch = 0x1c,
    Gat = 0x1d,
    GatQ = 0x1e,
    Hello = 0x1f,
    GetReplica = 0x83,
    GetLocked = 0x94,
    Unlock = 0x95,
    GetRandom = 0xb6,
}

impl Opcode {
    pub fn from_u8(code: u8) -> Option<Self> {
        use Opcode::*;
        Some(match code {
            0x00 => Get,
            0x01 => Set,
            0x02 => Add,
            0x03 => Replace,
            0x04 => Delete,
            0x05 => Increment,
            0x06 => Decrement,
            0x07 => Quit,
            0x08 => Flush,
            0x09 => GetQ,
            0x0a => Noop,
            0x0b => Version,
            0x0c => GetK,
            0x0d => GetKQ,
            0x0e => Append,
            0x0f => Prepend,
            0x10 => Stat,
            0x11 => SetQ,
            0x12 => AddQ,
            0x13 => ReplaceQ,
            0x14 => DeleteQ,
            0x15 => IncrementQ,
            0x16 => DecrementQ,
            0x17 => QuitQ,
            0x18 => FlushQ,
            0x19 => AppendQ,
            0x1a => PrependQ,
            0x1b => Verbosity,
            0x1c => Touch,
            0x1d => Gat,
            0x1e => GatQ,
            0x1f => Hello,
            0x83 => GetReplica,
            0x94 => GetLocked,
            0x95 => Unlock,
            0xb6 => GetRandom,
            _ => return None,
        })
    }

    /// True for the variants whose own success / expected-miss response is
    /// suppressed. Genuine errors are reported even for quiet opcodes.
    pub fn is_quiet(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            GetQ | GetKQ
                | SetQ
                | AddQ
                | ReplaceQ
                | DeleteQ
                | IncrementQ
                | DecrementQ
                | QuitQ
                | FlushQ
                | AppendQ
                | PrependQ
                | GatQ
        )
    }
}

/// Response status codes, numbered per the emulated protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Success = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    ValueTooBig = 0x0003,
    InvalidArguments = 0x0004,
    NotStored = 0x0005,
    BadDelta = 0x0006,
    NotMyVBucket = 0x0007,
    Locked = 0x0009,
    OutOfRange = 0x0022,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
    NotSupported = 0x0083,
    InternalError = 0x0084,
    Busy = 0x0085,
    TemporaryFailure = 0x0086,
}

impl Status {
    pub fn from_u16(code: u16) -> Option<Self> {
        use Status::*;
        Some(match code {
            0x0000 => Success,
            0x0001 => KeyNotFound,
            0x0002 => KeyExists,
            0x0003 => ValueTooBig,
            0x0004 => InvalidArguments,
            0x0005 => NotStored,
            0x0006 => BadDelta,
            0x0007 => NotMyVBucket,
            0x0009 => Locked,
            0x0022 => OutOfRange,
            0x0081 => UnknownCommand,
            0x0082 => OutOfMemory,
            0x0083 => NotSupported,
            0x0084 => InternalError,
            0x0085 => Busy,
            0x0086 => TemporaryFailure,
            _ => return None,
        })
    }
}

/// Session features a client may negotiate with `HELLO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Feature {
    TcpNoDelay = 0x0003,
    Xerror = 0x0007,
}

impl Feature {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x0003 => Some(Feature::TcpNoDelay),
            0x0007 => Some(Feature::Xerror),
            _ => None,
        }
    }
}

/// A parsed request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub opcode: u8,
    pub data_type: u8,
    pub vbucket: u16,
    pub opaque: u32,
    /// Client-declared CAS; 0 means "no CAS check".
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RequestFrame {
    /// Store-family extras: (flags, expiry) when the full 8 bytes are
    /// present, zeroes otherwise.
    pub fn store_extras(&self) -> (u32, u32) {
        if self.extras.len() == 8 {
            let mut buf = &self.extras[..];
            (buf.get_u32(), buf.get_u32())
        } else {
            (0, 0)
        }
    }

    /// Single 4-byte expiry extra (touch, gat, lock duration). Zero when the
    /// extras are absent or short.
    pub fn expiry_extra(&self) -> u32 {
        if self.extras.len() >= 4 {
            let mut buf = &self.extras[..];
            buf.get_u32()
        } else {
            0
        }
    }

    /// Counter-family extras: (delta, initial, expiry). `None` when the
    /// mandatory 20 bytes are missing.
    pub fn counter_extras(&self) -> Option<(u64, u64, u32)> {
        if self.extras.len() != 20 {
            return None;
        }
        let mut buf = &self.extras[..];
        Some((buf.get_u64(), buf.get_u64(), buf.get_u32()))
    }

    /// `HELLO` request value: a list of big-endian u16 feature codes.
    pub fn feature_codes(&self) -> Vec<u16> {
        let mut buf = &self.value[..];
        let mut codes = Vec::with_capacity(buf.len() / 2);
        while buf.len() >= 2 {
            codes.push(buf.get_u16());
        }
        codes
    }
}

/// A response frame ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub opcode: u8,
    pub data_type: u8,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl ResponseFrame {
    /// Empty-bodied response echoing the request opcode, opaque and CAS.
    pub fn status(req: &RequestFrame, status: Status) -> Self {
        Self {
            opcode: req.opcode,
            data_type: 0,
            status,
            opaque: req.opaque,
            cas: req.cas,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Error response; carries the diagnostic context as its value when the
    /// session negotiated enhanced errors (the caller decides).
    pub fn error(req: &RequestFrame, status: Status, context: Option<String>) -> Self {
        let mut response = Self::status(req, status);
        response.cas = 0;
        if let Some(context) = context {
            response.value = context.into_bytes();
        }
        response
    }

    /// Successful mutation acknowledgment carrying the freshly assigned CAS.
    pub fn mutation(req: &RequestFrame, cas: u64) -> Self {
        let mut response = Self::status(req, Status::Success);
        response.cas = cas;
        response
    }

    /// Item payload: 4-byte flags extras, optional key echo, value, CAS of
    /// the item as it should be exposed to this client.
    pub fn item(req: &RequestFrame, key: Option<&[u8]>, flags: u32, value: &[u8], cas: u64) -> Self {
        let mut extras = Vec::with_capacity(4);
        extras.put_u32(flags);
        Self {
            opcode: req.opcode,
            data_type: 0,
            status: Status::Success,
            opaque: req.opaque,
            cas,
            extras,
            key: key.map(<[u8]>::to_vec).unwrap_or_default(),
            value: value.to_vec(),
        }
    }

    /// Bare success with a raw value and no extras (version, hello, counter).
    pub fn value(req: &RequestFrame, value: Vec<u8>, cas: u64) -> Self {
        let mut response = Self::status(req, Status::Success);
        response.cas = cas;
        response.value = value;
        response
    }

    /// One statistic in a STAT sequence; the terminator is an empty pair.
    pub fn stat(req: &RequestFrame, key: &str, value: &str) -> Self {
        let mut response = Self::status(req, Status::Success);
        response.cas = 0;
        response.key = key.as_bytes().to_vec();
        response.value = value.as_bytes().to_vec();
        response
    }

    /// Serializes the frame, recomputing the body length from its parts.
    pub fn encode(&self, buf: &mut BytesMut) {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        buf.reserve(HEADER_LEN + body_len);
        buf.put_u8(RESPONSE_MAGIC);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.data_type);
        buf.put_u16(self.status as u16);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
    }
}

/// Decodes one request frame out of `buf`, consuming it. Returns `Ok(None)`
/// without consuming anything while the buffer holds less than a full frame.
pub fn decode_request(buf: &mut BytesMut) -> Result<Option<RequestFrame>, FrameError> {
    let Some(header) = decode_header(buf, REQUEST_MAGIC)? else {
        return Ok(None);
    };
    Ok(Some(split_frame(buf, header)))
}

/// Response-side decoder, the inverse of [`ResponseFrame::encode`]. The
/// server never reads responses; this exists for test clients.
pub fn decode_response(buf: &mut BytesMut) -> Result<Option<ResponseFrame>, FrameError> {
    let Some(header) = decode_header(buf, RESPONSE_MAGIC)? else {
        return Ok(None);
    };
    let status = Status::from_u16(header.vbucket_or_status)
        .ok_or(FrameError::UnknownStatus(header.vbucket_or_status))?;
    let frame = split_frame(buf, header);
    Ok(Some(ResponseFrame {
        opcode: frame.opcode,
        data_type: frame.data_type,
        status,
        opaque: frame.opaque,
        cas: frame.cas,
        extras: frame.extras,
        key: frame.key,
        value: frame.value,
    }))
}

struct Header {
    opcode: u8,
    key_len: usize,
    extras_len: usize,
    data_type: u8,
    vbucket_or_status: u16,
    body_len: usize,
    opaque: u32,
    cas: u64,
}

/// Validates the header without consuming input. `Ok(None)` means the buffer
/// does not yet hold a complete frame. The magic and the declared lengths
/// are checked as soon as the header is visible so a garbage stream fails
/// fast instead of stalling on a bogus body length.
fn decode_header(buf: &BytesMut, magic: u8) -> Result<Option<Header>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header = &buf[..HEADER_LEN];
    let got_magic = header.get_u8();
    if got_magic != magic {
        return Err(FrameError::BadMagic(got_magic));
    }
    let opcode = header.get_u8();
    let key_len = header.get_u16() as usize;
    let extras_len = header.get_u8() as usize;
    let data_type = header.get_u8();
    let vbucket_or_status = header.get_u16();
    let body_len = header.get_u32() as usize;
    let opaque = header.get_u32();
    let cas = header.get_u64();

    if body_len > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(body_len));
    }
    if key_len + extras_len > body_len {
        return Err(FrameError::Inconsistent {
            key: key_len,
            extras: extras_len,
            body: body_len,
        });
    }
    if buf.len() < HEADER_LEN + body_len {
        return Ok(None);
    }
    Ok(Some(Header {
        opcode,
        key_len,
        extras_len,
        data_type,
        vbucket_or_status,
        body_len,
        opaque,
        cas,
    }))
}

fn split_frame(buf: &mut BytesMut, header: Header) -> RequestFrame {
    buf.advance(HEADER_LEN);
    let mut body = buf.split_to(header.body_len);
    let extras = body.split_to(header.extras_len).to_vec();
    let key = body.split_to(header.key_len).to_vec();
    RequestFrame {
        opcode: header.opcode,
        data_type: header.data_type,
        vbucket: header.vbucket_or_status,
        opaque: header.opaque,
        cas: header.cas,
        extras,
        key,
        value: body.to_vec(),
    }
}

/// Encodes a request frame. Only test clients drive this path.
pub fn encode_request(req: &RequestFrame, buf: &mut BytesMut) {
    let body_len = req.extras.len() + req.key.len() + req.value.len();
    buf.reserve(HEADER_LEN + body_len);
    buf.put_u8(REQUEST_MAGIC);
    buf.put_u8(req.opcode);
    buf.put_u16(req.key.len() as u16);
    buf.put_u8(req.extras.len() as u8);
    buf.put_u8(req.data_type);
    buf.put_u16(req.vbucket);
    buf.put_u32(body_len as u32);
    buf.put_u32(req.opaque);
    buf.put_u64(req.cas);
    buf.put_slice(&req.extras);
    buf.put_slice(&req.key);
    buf.put_slice(&req.value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestFrame {
        RequestFrame {
            opcode: Opcode::Set as u8,
            data_type: 0,
            vbucket: 5,
            opaque: 0xdeadbeef,
            cas: 42,
            extras: vec![0, 0, 0, 9, 0, 0, 0, 0],
            key: b"foo".to_vec(),
            value: b"bar".to_vec(),
        }
    }

    #[test]
    fn request_roundtrip() {
        let req = sample_request();
        let mut buf = BytesMut::new();
        encode_request(&req, &mut buf);
        let decoded = decode_request(&mut buf)
            .expect("well-formed frame")
            .expect("complete frame");
        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn response_roundtrip() {
        let req = sample_request();
        let response = ResponseFrame::item(&req, Some(b"foo"), 9, b"bar", 77);
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        let decoded = decode_response(&mut buf)
            .expect("well-formed frame")
            .expect("complete frame");
        assert_eq!(decoded, response);
    }

    #[test]
    fn incomplete_frames_consume_nothing() {
        let req = sample_request();
        let mut encoded = BytesMut::new();
        encode_request(&req, &mut encoded);

        // Feed the frame one byte at a time; the decoder must hold off until
        // the final byte arrives and never consume a partial frame.
        let mut buf = BytesMut::new();
        for (i, byte) in encoded.iter().enumerate() {
            let outcome = decode_request(&mut buf).expect("prefix is never malformed");
            assert!(outcome.is_none(), "decoded early at byte {i}");
            let before = buf.len();
            buf.put_u8(*byte);
            assert_eq!(buf.len(), before + 1);
        }
        let decoded = decode_request(&mut buf)
            .expect("well-formed frame")
            .expect("complete frame");
        assert_eq!(decoded, req);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let req = sample_request();
        let mut buf = BytesMut::new();
        encode_request(&req, &mut buf);
        buf[0] = 0x42;
        assert!(matches!(
            decode_request(&mut buf),
            Err(FrameError::BadMagic(0x42))
        ));
    }

    #[test]
    fn oversize_body_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u8(REQUEST_MAGIC);
        buf.put_u8(Opcode::Set as u8);
        buf.put_u16(0);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u32((MAX_BODY_LEN + 1) as u32);
        buf.put_u32(0);
        buf.put_u64(0);
        assert!(matches!(
            decode_request(&mut buf),
            Err(FrameError::BodyTooLarge(_))
        ));
    }

    #[test]
    fn inconsistent_lengths_are_fatal() {
        // Key length of 10 declared against a 3-byte body.
        let mut buf = BytesMut::new();
        buf.put_u8(REQUEST_MAGIC);
        buf.put_u8(Opcode::Get as u8);
        buf.put_u16(10);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u32(3);
        buf.put_u32(0);
        buf.put_u64(0);
        buf.put_slice(b"abc");
        assert!(matches!(
            decode_request(&mut buf),
            Err(FrameError::Inconsistent { .. })
        ));
    }

    #[test]
    fn store_extras_default_to_zero() {
        let mut req = sample_request();
        req.extras = Vec::new();
        assert_eq!(req.store_extras(), (0, 0));
        req.extras = vec![0, 0, 0, 9, 0, 0, 1, 0];
        assert_eq!(req.store_extras(), (9, 256));
    }

    #[test]
    fn counter_extras_require_twenty_bytes() {
        let mut req = sample_request();
        req.extras = vec![0; 19];
        assert_eq!(req.counter_extras(), None);
        let mut extras = Vec::new();
        extras.put_u64(2);
        extras.put_u64(100);
        extras.put_u32(0);
        req.extras = extras;
        assert_eq!(req.counter_extras(), Some((2, 100, 0)));
    }

    #[test]
    fn opcode_numbering_matches_the_protocol() {
        assert_eq!(Opcode::from_u8(0x00), Some(Opcode::Get));
        assert_eq!(Opcode::from_u8(0x1c), Some(Opcode::Touch));
        assert_eq!(Opcode::from_u8(0x83), Some(Opcode::GetReplica));
        assert_eq!(Opcode::from_u8(0x94), Some(Opcode::GetLocked));
        assert_eq!(Opcode::from_u8(0xb6), Some(Opcode::GetRandom));
        assert_eq!(Opcode::from_u8(0xff), None);
        assert!(Opcode::GetKQ.is_quiet());
        assert!(!Opcode::Get.is_quiet());
        assert!(!Opcode::Touch.is_quiet());
    }
}
