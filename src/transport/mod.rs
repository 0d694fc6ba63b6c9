mod publisher;
mod subscriber;

use std::{
    fmt,
    io::{self, Read, Write},
    str::FromStr,
};

pub use publisher::{DEFAULT_HIGH_WATER_MARK, PublishStats, Publisher};
pub use subscriber::{DEFAULT_QUEUE_DEPTH, Subscriber};

pub const DEFAULT_PORT: u16 = 5555;
pub const MAX_MESSAGE_LEN: usize = 32 * 1024 * 1024;

const SCHEME: &str = "tcp://";
const ANY_HOST: &str = "*";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint {0:?}, expected tcp://host:port")]
    InvalidEndpoint(String),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("message of {0} bytes exceeds the frame limit")]
    Oversized(usize),
    #[error("transport closed")]
    Closed,
    #[error("timed out waiting for a message")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// `tcp://*:port`, every local interface.
    pub fn any(port: u16) -> Self {
        Self {
            host: ANY_HOST.to_string(),
            port,
        }
    }

    pub fn remote(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn socket_addr(&self) -> String {
        let host = if self.host == ANY_HOST {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        format!("{host}:{}", self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());
        let rest = s.strip_prefix(SCHEME).ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::remote(host, port))
    }
}

/// Writes one message as a big-endian `u32` length followed by the payload.
pub(crate) fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(TransportError::Oversized(payload.len()));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub(crate) fn read_message<R: Read>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Err(TransportError::Closed),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(TransportError::Oversized(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn parses_and_prints_endpoints() {
        let endpoint: Endpoint = "tcp://192.168.1.20:5555".parse().unwrap();
        assert_eq!(endpoint.host(), "192.168.1.20");
        assert_eq!(endpoint.port(), 5555);
        assert_eq!(endpoint.to_string(), "tcp://192.168.1.20:5555");

        assert_eq!(Endpoint::any(6000).to_string(), "tcp://*:6000");
        assert_eq!(Endpoint::any(6000).socket_addr(), "0.0.0.0:6000");
    }

    #[test]
    fn rejects_malformed_endpoints() {
        for bad in ["udp://host:1", "tcp://host", "tcp://:80", "tcp://host:99999", "host:1"] {
            assert!(bad.parse::<Endpoint>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn framing_keeps_message_boundaries() {
        let mut wire = Vec::new();
        write_message(&mut wire, b"first").unwrap();
        write_message(&mut wire, b"").unwrap();
        write_message(&mut wire, b"third message").unwrap();

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_message(&mut cursor).unwrap(), b"first");
        assert_eq!(read_message(&mut cursor).unwrap(), b"");
        assert_eq!(read_message(&mut cursor).unwrap(), b"third message");
        assert!(matches!(read_message(&mut cursor), Err(TransportError::Closed)));
    }

    #[test]
    fn refuses_oversized_length_prefix() {
        let header = ((MAX_MESSAGE_LEN + 1) as u32).to_be_bytes();
        let mut cursor = Cursor::new(header.to_vec());
        assert!(matches!(
            read_message(&mut cursor),
            Err(TransportError::Oversized(_))
        ));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut wire = Vec::new();
        write_message(&mut wire, b"complete payload").unwrap();
        wire.truncate(wire.len() - 3);
        assert!(read_message(&mut Cursor::new(wire)).is_err());
    }
}
