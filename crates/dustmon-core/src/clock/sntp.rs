//! Minimal SNTP (NTPv3 client mode) packet codec.

use thiserror_no_std::Error;

pub const NTP_PORT: u16 = 123;
pub const PACKET_LEN: usize = 48;

/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01.
const NTP_TO_UNIX_SECS: u64 = 2_208_988_800;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SntpError {
    #[error("reply too short: {0} bytes")]
    Truncated(usize),
    #[error("reply is not a server packet (mode {0})")]
    NotServer(u8),
    #[error("server is unsynchronized")]
    KissOfDeath,
}

/// Client request: LI=0, VN=3, Mode=3, everything else zero.
pub fn request() -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = 0x1B;
    packet
}

/// Extract the transmit timestamp as Unix microseconds.
pub fn parse_reply(packet: &[u8]) -> Result<i64, SntpError> {
    if packet.len() < PACKET_LEN {
        return Err(SntpError::Truncated(packet.len()));
    }
    let mode = packet[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(SntpError::NotServer(mode));
    }
    // Stratum 0 carries a kiss code instead of time.
    if packet[1] == 0 {
        return Err(SntpError::KissOfDeath);
    }
    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]) as u64;
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]) as u64;
    // Era 1 starts in 2036 and wraps the 32-bit seconds field.
    let seconds = if seconds < NTP_TO_UNIX_SECS {
        seconds + (1 << 32)
    } else {
        seconds
    };
    let micros = (fraction * 1_000_000) >> 32;
    Ok(((seconds - NTP_TO_UNIX_SECS) * 1_000_000 + micros) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(seconds: u32, fraction: u32) -> [u8; PACKET_LEN] {
        let mut p = [0u8; PACKET_LEN];
        p[0] = 0x1C;
        p[1] = 2;
        p[40..44].copy_from_slice(&seconds.to_be_bytes());
        p[44..48].copy_from_slice(&fraction.to_be_bytes());
        p
    }

    #[test]
    fn test_request_header() {
        let p = request();
        assert_eq!(p[0], 0x1B);
        assert!(p[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_reply() {
        // 2024-01-01T00:00:00.5Z
        let secs = (1_704_067_200u64 + NTP_TO_UNIX_SECS) as u32;
        let unix = parse_reply(&reply(secs, 1 << 31)).unwrap();
        assert_eq!(unix, 1_704_067_200_500_000);
    }

    #[test]
    fn test_rejects_short_and_client_packets() {
        assert_eq!(parse_reply(&[0u8; 12]), Err(SntpError::Truncated(12)));
        let mut p = reply(0xE000_0000, 0);
        p[0] = 0x1B;
        assert_eq!(parse_reply(&p), Err(SntpError::NotServer(3)));
        let mut p = reply(0xE000_0000, 0);
        p[1] = 0;
        assert_eq!(parse_reply(&p), Err(SntpError::KissOfDeath));
    }
}
