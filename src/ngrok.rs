use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use log::{debug, trace};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const API_HOST: &str = "api.ngrok.com";
const API_PORT: u16 = 443;

const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// One entry of the remote tunnel inventory, as returned by the ngrok
/// endpoints API.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelEndpoint {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub hostport: String,
    #[serde(default, rename = "type")]
    pub endpoint_type: String,
}

impl TunnelEndpoint {
    pub fn uri(&self) -> String {
        format!("{}://{}", self.proto, self.hostport)
    }

    pub fn host_port(&self) -> std::io::Result<(&str, u16)> {
        let (host, port_str) = self.hostport.rsplit_once(':').ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("endpoint {} has no port in {:?}", self.id, self.hostport),
            )
        })?;
        let port = port_str.parse::<u16>().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("endpoint {} has a bad port: {}", self.id, e),
            )
        })?;
        Ok((host, port))
    }
}

#[derive(Debug, Deserialize)]
struct EndpointListing {
    #[serde(default)]
    endpoints: Vec<TunnelEndpoint>,
}

/// The remote listing the dynamic destination provider filters against.
#[async_trait]
pub trait EndpointInventory: Send + Sync {
    async fn list_endpoints(&self) -> std::io::Result<Vec<TunnelEndpoint>>;
}

pub struct NgrokClient {
    api_key: String,
}

impl NgrokClient {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }

    async fn fetch_listing(&self) -> std::io::Result<String> {
        let tcp = TcpStream::connect((API_HOST, API_PORT)).await?;
        let server_name = rustls::pki_types::ServerName::try_from(API_HOST).unwrap();
        let mut stream = tls_connector().connect(server_name, tcp).await?;

        let request = format!(
            concat!(
                "GET /endpoints HTTP/1.1\r\n",
                "Host: {}\r\n",
                "Authorization: Bearer {}\r\n",
                "Ngrok-Version: 2\r\n",
                "Accept: application/json\r\n",
                "Connection: close\r\n",
                "\r\n"
            ),
            API_HOST, self.api_key
        );
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        stream
            .take(MAX_RESPONSE_SIZE as u64)
            .read_to_end(&mut response)
            .await?;

        parse_http_response(&response)
    }
}

#[async_trait]
impl EndpointInventory for NgrokClient {
    async fn list_endpoints(&self) -> std::io::Result<Vec<TunnelEndpoint>> {
        if self.api_key.is_empty() {
            return Err(std::io::Error::other("ngrok API key is not set"));
        }

        let body = self.fetch_listing().await?;
        let listing: EndpointListing = serde_json::from_str(&body).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to parse endpoint listing: {}", e),
            )
        })?;

        debug!("fetched {} inventory endpoints", listing.endpoints.len());
        for endpoint in listing.endpoints.iter() {
            trace!(
                "endpoint {} ({}): {}",
                endpoint.id,
                endpoint.endpoint_type,
                endpoint.uri()
            );
        }

        Ok(listing.endpoints)
    }
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    let config = CONFIG
        .get_or_init(|| {
            let root_store = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth(),
            )
        })
        .clone();
    tokio_rustls::TlsConnector::from(config)
}

/// Splits a full HTTP/1.1 response into status and body, undoing chunked
/// transfer encoding when the server used it.
fn parse_http_response(response: &[u8]) -> std::io::Result<String> {
    let head_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| std::io::Error::other("truncated http response"))?;
    let head = std::str::from_utf8(&response[..head_end])
        .map_err(|_| std::io::Error::other("http head is not valid utf8"))?;

    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| std::io::Error::other("empty http response"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("")
        .to_string();
    if status != "200" {
        return Err(std::io::Error::other(format!(
            "inventory request failed: {}",
            status_line
        )));
    }

    let chunked = lines.any(|line| {
        match line.split_once(':') {
            Some((key, value)) => {
                key.trim().eq_ignore_ascii_case("transfer-encoding")
                    && value.trim().eq_ignore_ascii_case("chunked")
            }
            None => false,
        }
    });

    let body = &response[head_end + 4..];
    let body = if chunked {
        decode_chunked(body)?
    } else {
        body.to_vec()
    };

    String::from_utf8(body).map_err(|_| std::io::Error::other("http body is not valid utf8"))
}

fn decode_chunked(mut body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    loop {
        let line_end = body
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| std::io::Error::other("truncated chunk size"))?;
        let size_str = std::str::from_utf8(&body[..line_end])
            .map_err(|_| std::io::Error::other("bad chunk size"))?;
        // Chunk extensions after ';' are ignored.
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| std::io::Error::other(format!("bad chunk size: {}", size_str)))?;

        body = &body[line_end + 2..];
        if size == 0 {
            return Ok(decoded);
        }
        if body.len() < size + 2 {
            return Err(std::io::Error::other("truncated chunk"));
        }
        decoded.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_response() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}";
        assert_eq!(parse_http_response(response).unwrap(), "{}");
    }

    #[test]
    fn test_parse_chunked_response() {
        let response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\n{\"e\r\n2\r\nx\"\r\n0\r\n\r\n";
        assert_eq!(parse_http_response(response).unwrap(), "{\"ex\"");
    }

    #[test]
    fn test_non_200_is_an_error() {
        let response = b"HTTP/1.1 401 Unauthorized\r\n\r\n";
        assert!(parse_http_response(response).is_err());
    }

    #[test]
    fn test_listing_decodes() {
        let body = r#"{
            "endpoints": [
                {
                    "id": "ep_1",
                    "proto": "tcp",
                    "hostport": "7.tcp.eu.ngrok.io:12345",
                    "type": "ephemeral",
                    "created_at": "2023-06-01T10:00:00Z"
                }
            ],
            "uri": "https://api.ngrok.com/endpoints",
            "next_page_uri": null
        }"#;
        let listing: EndpointListing = serde_json::from_str(body).unwrap();
        assert_eq!(listing.endpoints.len(), 1);
        let endpoint = &listing.endpoints[0];
        assert_eq!(endpoint.id, "ep_1");
        assert_eq!(endpoint.uri(), "tcp://7.tcp.eu.ngrok.io:12345");
        assert_eq!(
            endpoint.host_port().unwrap(),
            ("7.tcp.eu.ngrok.io", 12345)
        );
    }

    #[test]
    fn test_empty_listing_decodes() {
        let listing: EndpointListing = serde_json::from_str("{}").unwrap();
        assert!(listing.endpoints.is_empty());
    }
}
