//! Sensirion SHDLC framing over a byte stream.
//!
//! MOSI frame: `7E ADR CMD LEN DATA.. CHK 7E`
//! MISO frame: `7E ADR CMD STATE LEN DATA.. CHK 7E`
//!
//! Between the start and stop bytes, 0x7E, 0x7D, 0x11 and 0x13 are escaped
//! as 0x7D followed by the byte XOR 0x20. The checksum is the inverted low
//! byte of the sum of every unescaped byte between ADR and the last DATA.

use embassy_time::{Duration, with_timeout};
use embedded_io_async::{Read, Write};
use thiserror_no_std::Error;

const FRAME_BOUNDARY: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;
pub const MAX_DATA_LEN: usize = 255;
const MAX_FRAME_LEN: usize = 2 + 2 * (5 + MAX_DATA_LEN);
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShdlcError {
    #[error("serial I/O error")]
    Io,
    #[error("no response")]
    Timeout,
    #[error("malformed frame")]
    Framing,
    #[error("checksum mismatch")]
    Checksum,
    #[error("response to command 0x{0:02x} does not match request")]
    UnexpectedCommand(u8),
    #[error("device reported state 0x{0:02x}")]
    DeviceState(u8),
    #[error("payload of {0} bytes does not fit")]
    Overflow(usize),
}

fn needs_escape(byte: u8) -> bool {
    matches!(byte, 0x7E | 0x7D | 0x11 | 0x13)
}

fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Encode a request frame into `out`, returning its length.
pub fn encode_request(
    address: u8,
    command: u8,
    data: &[u8],
    out: &mut [u8; MAX_FRAME_LEN],
) -> Result<usize, ShdlcError> {
    if data.len() > MAX_DATA_LEN {
        return Err(ShdlcError::Overflow(data.len()));
    }
    let header = [address, command, data.len() as u8];
    let chk = !header
        .iter()
        .chain(data)
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    let mut len = 0;
    out[len] = FRAME_BOUNDARY;
    len += 1;
    for &byte in header.iter().chain(data).chain(core::iter::once(&chk)) {
        if needs_escape(byte) {
            out[len] = ESCAPE;
            out[len + 1] = byte ^ ESCAPE_XOR;
            len += 2;
        } else {
            out[len] = byte;
            len += 1;
        }
    }
    out[len] = FRAME_BOUNDARY;
    Ok(len + 1)
}

/// Decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: u8,
    pub state: u8,
    pub data: heapless::Vec<u8, MAX_DATA_LEN>,
}

/// Decode the unescaped content between two frame boundaries.
pub fn decode_response(raw: &[u8]) -> Result<Response, ShdlcError> {
    let mut content: heapless::Vec<u8, { MAX_DATA_LEN + 5 }> = heapless::Vec::new();
    let mut bytes = raw.iter();
    while let Some(&byte) = bytes.next() {
        let byte = if byte == ESCAPE {
            bytes.next().ok_or(ShdlcError::Framing)? ^ ESCAPE_XOR
        } else {
            byte
        };
        content.push(byte).map_err(|_| ShdlcError::Framing)?;
    }
    if content.len() < 5 {
        return Err(ShdlcError::Framing);
    }
    let (body, chk) = content.split_at(content.len() - 1);
    if checksum(body) != chk[0] {
        return Err(ShdlcError::Checksum);
    }
    let len = body[3] as usize;
    if body.len() != 4 + len {
        return Err(ShdlcError::Framing);
    }
    let mut data = heapless::Vec::new();
    data.extend_from_slice(&body[4..])
        .map_err(|_| ShdlcError::Overflow(len))?;
    Ok(Response {
        command: body[1],
        state: body[2],
        data,
    })
}

/// SHDLC master holding the serial port by composition.
pub struct ShdlcPort<U> {
    uart: U,
    address: u8,
}

impl<U: Read + Write> ShdlcPort<U> {
    pub fn new(uart: U, address: u8) -> Self {
        Self { uart, address }
    }

    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }

    /// Send raw bytes outside any frame, e.g. a wake-up pulse.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ShdlcError> {
        self.uart.write_all(bytes).await.map_err(|_| ShdlcError::Io)?;
        self.uart.flush().await.map_err(|_| ShdlcError::Io)
    }

    /// Send a command and wait for its response data.
    pub async fn execute(
        &mut self,
        command: u8,
        data: &[u8],
    ) -> Result<heapless::Vec<u8, MAX_DATA_LEN>, ShdlcError> {
        let mut frame = [0u8; MAX_FRAME_LEN];
        let len = encode_request(self.address, command, data, &mut frame)?;
        self.write_raw(&frame[..len]).await?;

        let response = with_timeout(RESPONSE_TIMEOUT, self.read_frame())
            .await
            .map_err(|_| ShdlcError::Timeout)??;
        if response.command != command {
            return Err(ShdlcError::UnexpectedCommand(response.command));
        }
        if response.state & 0x7F != 0 {
            return Err(ShdlcError::DeviceState(response.state));
        }
        Ok(response.data)
    }

    async fn read_byte(&mut self) -> Result<u8, ShdlcError> {
        let mut byte = [0u8];
        match self.uart.read(&mut byte).await {
            Ok(1) => Ok(byte[0]),
            Ok(_) => Err(ShdlcError::Io),
            Err(_) => Err(ShdlcError::Io),
        }
    }

    async fn read_frame(&mut self) -> Result<Response, ShdlcError> {
        while self.read_byte().await? != FRAME_BOUNDARY {}
        let mut raw: heapless::Vec<u8, MAX_FRAME_LEN> = heapless::Vec::new();
        loop {
            let byte = self.read_byte().await?;
            if byte == FRAME_BOUNDARY {
                // Back-to-back boundaries: the first one closed a stale frame.
                if raw.is_empty() {
                    continue;
                }
                break;
            }
            raw.push(byte).map_err(|_| ShdlcError::Framing)?;
        }
        decode_response(&raw)
    }
}
