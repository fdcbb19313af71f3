use std::collections::HashMap;

use aws_lc_rs::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_HEAD_SIZE: usize = 8192;

/// Performs the client side of the WebSocket upgrade. `extra_headers` are
/// appended to the request verbatim. Returns any bytes read past the end of
/// the HTTP response, to be handed to the frame layer.
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    extra_headers: &[(String, String)],
) -> std::io::Result<Vec<u8>> {
    let websocket_key = create_websocket_key();

    let mut request = String::with_capacity(1024);
    request.push_str("GET / HTTP/1.1\r\n");
    request.push_str("Host: ");
    request.push_str(host);
    request.push_str("\r\n");
    request.push_str(concat!("Connection: Upgrade\r\n", "Upgrade: websocket\r\n"));
    for (key, value) in extra_headers {
        request.push_str(key);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str(concat!(
        "Sec-WebSocket-Version: 13\r\n",
        "Sec-WebSocket-Key: "
    ));
    request.push_str(&websocket_key);
    request.push_str("\r\n\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let HttpHead {
        first_line,
        headers,
        leftover,
    } = HttpHead::read_from(stream).await?;

    if !first_line.starts_with("HTTP/1.1 101") && !first_line.starts_with("HTTP/1.0 101") {
        return Err(std::io::Error::other(format!(
            "bad websocket upgrade response: {}",
            first_line
        )));
    }

    let key_response = headers.get("sec-websocket-accept").ok_or_else(|| {
        std::io::Error::other("missing websocket accept header")
    })?;
    let expected = create_websocket_key_response(&websocket_key);
    if key_response != &expected {
        return Err(std::io::Error::other(format!(
            "incorrect websocket accept header, expected {}, got {}",
            expected, key_response
        )));
    }

    Ok(leftover)
}

/// Performs the server side of the WebSocket upgrade. `extra_headers` are
/// appended to the 101 response. Returns any bytes read past the end of the
/// HTTP request.
pub async fn server_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    extra_headers: &[(String, String)],
) -> std::io::Result<Vec<u8>> {
    let HttpHead {
        first_line,
        headers,
        leftover,
    } = HttpHead::read_from(stream).await?;

    if !first_line.starts_with("GET ")
        || (!first_line.ends_with(" HTTP/1.1") && !first_line.ends_with(" HTTP/1.0"))
    {
        return Err(std::io::Error::other(format!(
            "invalid upgrade request: {}",
            first_line
        )));
    }

    let websocket_key = headers.get("sec-websocket-key").ok_or_else(|| {
        std::io::Error::other("missing websocket key header")
    })?;

    let mut response = String::with_capacity(1024);
    response.push_str(concat!(
        "HTTP/1.1 101 Switching Protocols\r\n",
        "Upgrade: websocket\r\n",
        "Connection: Upgrade\r\n",
        "Sec-WebSocket-Accept: "
    ));
    response.push_str(&create_websocket_key_response(websocket_key));
    response.push_str("\r\n");
    for (key, value) in extra_headers {
        response.push_str(key);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(leftover)
}

struct HttpHead {
    first_line: String,
    headers: HashMap<String, String>,
    leftover: Vec<u8>,
}

impl HttpHead {
    async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Self> {
        let mut buf = vec![0u8; MAX_HEAD_SIZE];
        let mut end = 0;
        let head_end = loop {
            if let Some(pos) = find_head_end(&buf[..end]) {
                break pos;
            }
            if end == buf.len() {
                return Err(std::io::Error::other("http head is too long"));
            }
            let read_amount = stream.read(&mut buf[end..]).await?;
            if read_amount == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed during handshake",
                ));
            }
            end += read_amount;
        };

        let head = std::str::from_utf8(&buf[..head_end])
            .map_err(|_| std::io::Error::other("http head is not valid utf8"))?;

        let mut lines = head.split("\r\n");
        let first_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| std::io::Error::other("empty http head"))?
            .to_string();

        let mut headers = HashMap::new();
        for line in lines {
            let (key, value) = line.split_once(':').ok_or_else(|| {
                std::io::Error::other(format!("invalid http header line: {}", line))
            })?;
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            first_line,
            headers,
            leftover: buf[head_end + 4..end].to_vec(),
        })
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn create_websocket_key() -> String {
    let key: [u8; 16] = rand::random();
    BASE64.encode(key)
}

fn create_websocket_key_response(key: &str) -> String {
    let mut input = key.as_bytes().to_vec();
    input.extend_from_slice(WS_GUID);
    let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, &input);
    BASE64.encode(hash.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_key_response_matches_rfc_6455_example() {
        assert_eq!(
            create_websocket_key_response("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let (mut client_end, mut server_end) = duplex(65536);
        let request_headers = vec![("X-Tunnel-Auth".to_string(), "sekrit".to_string())];

        let (client_result, server_result) = tokio::join!(
            client_handshake(&mut client_end, "relay.example.com:7000", &request_headers),
            server_handshake(&mut server_end, &[]),
        );

        assert!(client_result.unwrap().is_empty());
        assert!(server_result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_rejects_missing_key() {
        let (mut client_end, mut server_end) = duplex(65536);
        client_end
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert!(server_handshake(&mut server_end, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_client_rejects_non_upgrade_response() {
        let (mut client_end, mut server_end) = duplex(65536);
        let server = async {
            let mut sink = [0u8; 1024];
            let _ = server_end.read(&mut sink).await.unwrap();
            server_end
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        };
        let (result, _) = tokio::join!(client_handshake(&mut client_end, "x:1", &[]), server);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_leftover_bytes_are_returned() {
        let (mut client_end, mut server_end) = duplex(65536);
        client_end
            .write_all(
                b"GET / HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: abc\r\n\r\n\x82\x01z",
            )
            .await
            .unwrap();
        let leftover = server_handshake(&mut server_end, &[]).await.unwrap();
        assert_eq!(leftover, [0x82, 0x01, b'z']);
    }
}
