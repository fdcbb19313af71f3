use std::fmt;

use tokio::net::TcpStream;

use crate::async_stream::AsyncStream;
use crate::websocket::{client_handshake, server_handshake, WebsocketStream};

/// How framed messages ride on the stream connection: directly on TCP
/// bytes, or wrapped one-per-message in binary WebSocket frames.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum Transport {
    #[default]
    Raw,
    Websocket,
}

/// Extra headers attached to the WebSocket upgrade: the request on the
/// client side, the 101 response on the server side.
pub type WsHeaders = Vec<(String, String)>;

impl Transport {
    pub fn from_str(s: &str) -> std::io::Result<Self> {
        match s {
            "raw" | "tcp" => Ok(Transport::Raw),
            "websocket" | "ws" => Ok(Transport::Websocket),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unknown transport: {}", s),
            )),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Raw => f.write_str("raw"),
            Transport::Websocket => f.write_str("websocket"),
        }
    }
}

/// Prepares a freshly connected outbound socket for framed traffic.
pub async fn client_stream(
    transport: Transport,
    mut tcp: TcpStream,
    host: &str,
    ws_headers: &WsHeaders,
) -> std::io::Result<Box<dyn AsyncStream>> {
    match transport {
        Transport::Raw => Ok(Box::new(tcp)),
        Transport::Websocket => {
            let leftover = client_handshake(&mut tcp, host, ws_headers).await?;
            Ok(Box::new(WebsocketStream::new(tcp, true, &leftover)))
        }
    }
}

/// Prepares a freshly accepted inbound socket for framed traffic.
pub async fn server_stream(
    transport: Transport,
    mut tcp: TcpStream,
    ws_headers: &WsHeaders,
) -> std::io::Result<Box<dyn AsyncStream>> {
    match transport {
        Transport::Raw => Ok(Box::new(tcp)),
        Transport::Websocket => {
            let leftover = server_handshake(&mut tcp, ws_headers).await?;
            Ok(Box::new(WebsocketStream::new(tcp, false, &leftover)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str() {
        assert_eq!(Transport::from_str("raw").unwrap(), Transport::Raw);
        assert_eq!(Transport::from_str("ws").unwrap(), Transport::Websocket);
        assert_eq!(
            Transport::from_str("websocket").unwrap(),
            Transport::Websocket
        );
        assert!(Transport::from_str("quic").is_err());
    }
}
