// wire.rs - Probe datagram layout shared by client and server
//
// offset 0:  u32 sequence
// offset 4:  u32 send seconds
// offset 8:  u32 send nanoseconds
// offset 12: u16 op mode (0 = RTT, 1 = one-way)
// offset 14: u16 marker
// offset 16: [u8; 16] auth token (only when authentication is enabled)
// then zero padding up to the configured message size
//
// All integers are big-endian.
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::auth::AuthToken;
use crate::clock::WallTime;

/// Sequence, seconds and nanoseconds.
pub const BASE_HEADER_SIZE: usize = 12;
/// Base header plus the op mode field.
pub const MODE_HEADER_SIZE: usize = 14;
/// Full header including the marker. Anything shorter is rejected unparsed.
pub const HEADER_SIZE: usize = 16;
pub const AUTH_TOKEN_SIZE: usize = 16;
/// Header plus authentication trailer.
pub const AUTH_HEADER_SIZE: usize = HEADER_SIZE + AUTH_TOKEN_SIZE;
/// Largest probe the tools will build or accept.
pub const MAX_MESSAGE_SIZE: usize = 50_000;

pub const DATA_MARKER: u16 = 0x5555;
pub const TERMINATE_MARKER: u16 = 0x0102;
/// Reserved sequence value announcing the end of a session.
pub const TERMINAL_SEQUENCE: u32 = u32::MAX;

/// Whether the server echoes probes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpMode {
    Rtt,
    OneWay,
}

impl OpMode {
    pub fn as_u16(self) -> u16 {
        match self {
            OpMode::Rtt => 0,
            OpMode::OneWay => 1,
        }
    }
}

impl TryFrom<u16> for OpMode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OpMode::Rtt),
            1 => Ok(OpMode::OneWay),
            other => Err(WireError::UnknownMode(other)),
        }
    }
}

impl std::fmt::Display for OpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpMode::Rtt => write!(f, "rtt"),
            OpMode::OneWay => write!(f, "one-way"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the fixed header.
    Malformed { len: usize, required: usize },
    UnknownMode(u16),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Malformed { len, required } => {
                write!(f, "Malformed header: {} bytes, need {}", len, required)
            }
            WireError::UnknownMode(mode) => write!(f, "Unknown op mode {}", mode),
        }
    }
}

impl std::error::Error for WireError {}

/// Fixed probe header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHeader {
    pub sequence: u32,
    pub send_secs: u32,
    pub send_nanos: u32,
    pub mode: OpMode,
    pub marker: u16,
}

impl ProbeHeader {
    /// Data probe stamped with `sent`.
    pub fn data(sequence: u32, sent: WallTime, mode: OpMode) -> Self {
        Self {
            sequence,
            send_secs: sent.secs,
            send_nanos: sent.nanos,
            mode,
            marker: DATA_MARKER,
        }
    }

    /// End-of-session message.
    pub fn terminal(sent: WallTime, mode: OpMode) -> Self {
        Self {
            sequence: TERMINAL_SEQUENCE,
            send_secs: sent.secs,
            send_nanos: sent.nanos,
            mode,
            marker: TERMINATE_MARKER,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.sequence == TERMINAL_SEQUENCE
    }

    pub fn send_time(&self) -> WallTime {
        WallTime::new(self.send_secs, self.send_nanos)
    }

    /// Writes the header into the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Malformed {
                len: buf.len(),
                required: HEADER_SIZE,
            });
        }
        BigEndian::write_u32(&mut buf[0..4], self.sequence);
        BigEndian::write_u32(&mut buf[4..8], self.send_secs);
        BigEndian::write_u32(&mut buf[8..12], self.send_nanos);
        BigEndian::write_u16(&mut buf[12..14], self.mode.as_u16());
        BigEndian::write_u16(&mut buf[14..16], self.marker);
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        // Cannot fail: buffer is exactly HEADER_SIZE
        let _ = self.encode_into(&mut buf);
        buf
    }

    /// Parses the header from the front of a datagram.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::Malformed {
                len: data.len(),
                required: HEADER_SIZE,
            });
        }
        let malformed = |_: std::io::Error| WireError::Malformed {
            len: data.len(),
            required: HEADER_SIZE,
        };

        let mut reader = &data[..HEADER_SIZE];
        let sequence = reader.read_u32::<BigEndian>().map_err(malformed)?;
        let send_secs = reader.read_u32::<BigEndian>().map_err(malformed)?;
        let send_nanos = reader.read_u32::<BigEndian>().map_err(malformed)?;
        let mode = OpMode::try_from(reader.read_u16::<BigEndian>().map_err(malformed)?)?;
        let marker = reader.read_u16::<BigEndian>().map_err(malformed)?;

        Ok(Self {
            sequence,
            send_secs,
            send_nanos,
            mode,
            marker,
        })
    }
}

/// Minimum datagram size for a data probe.
pub fn required_size(with_token: bool) -> usize {
    if with_token {
        AUTH_HEADER_SIZE
    } else {
        HEADER_SIZE
    }
}

/// Lays out header, optional token and zero padding into `buf`.
/// The buffer is resized to `max(message_size, required_size)`.
pub fn fill_probe(
    buf: &mut Vec<u8>,
    header: &ProbeHeader,
    message_size: usize,
    token: Option<&AuthToken>,
) -> Result<(), WireError> {
    let size = message_size.max(required_size(token.is_some()));
    buf.clear();
    buf.resize(size, 0);
    header.encode_into(buf)?;
    if let Some(token) = token {
        write_token(buf, token)?;
    }
    Ok(())
}

/// Convenience wrapper around [`fill_probe`] that allocates.
pub fn build_probe(
    header: &ProbeHeader,
    message_size: usize,
    token: Option<&AuthToken>,
) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(message_size.max(HEADER_SIZE));
    fill_probe(&mut buf, header, message_size, token)?;
    Ok(buf)
}

/// Reduced-size terminal datagram: header only, no token, no padding.
pub fn build_terminal(sent: WallTime, mode: OpMode) -> [u8; HEADER_SIZE] {
    ProbeHeader::terminal(sent, mode).encode()
}

pub fn read_token(data: &[u8]) -> Option<AuthToken> {
    let bytes = data.get(HEADER_SIZE..AUTH_HEADER_SIZE)?;
    let mut token = [0u8; AUTH_TOKEN_SIZE];
    token.copy_from_slice(bytes);
    Some(token)
}

pub fn write_token(buf: &mut [u8], token: &AuthToken) -> Result<(), WireError> {
    let len = buf.len();
    let slot = buf
        .get_mut(HEADER_SIZE..AUTH_HEADER_SIZE)
        .ok_or(WireError::Malformed {
            len,
            required: AUTH_HEADER_SIZE,
        })?;
    slot.copy_from_slice(token);
    Ok(())
}
