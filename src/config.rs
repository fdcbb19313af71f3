use crate::address::NetLocation;
use crate::transport::{Transport, WsHeaders};

pub const DEFAULT_UDP_DEST: &str = "127.0.0.1:51820";
pub const DEFAULT_TCP_KEEP_ALIVE_SECS: u64 = 120;

/// Server engine: accept framed streams, emit UDP datagrams locally.
#[derive(Debug, Clone)]
pub struct ServerEngineConfig {
    pub tcp_listen: NetLocation,
    pub udp_dest: NetLocation,
    pub transport: Transport,
    pub ws_headers: WsHeaders,
    /// 0 disables TCP keep-alive on accepted sockets.
    pub tcp_keep_alive_secs: u64,
}

/// Client engine: accept UDP datagrams, initiate a framed stream.
#[derive(Debug, Clone)]
pub struct ClientEngineConfig {
    pub udp_listen: NetLocation,
    pub dest: DestSpec,
    pub transport: Transport,
    pub ws_headers: WsHeaders,
    /// 0 disables TCP keep-alive on the outbound socket.
    pub tcp_keep_alive_secs: u64,
    /// 0 disables the framing-layer heartbeat.
    pub app_keep_alive_secs: u64,
}

#[derive(Debug, Clone)]
pub enum DestSpec {
    Static(NetLocation),
    Ngrok { api_key: String, filter: String },
}

#[derive(Debug, Default)]
pub struct Config {
    pub server: Option<ServerEngineConfig>,
    pub client: Option<ClientEngineConfig>,
}

fn invalid_input(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message)
}

fn parse_location(flag: &str, value: Option<String>) -> std::io::Result<NetLocation> {
    let value = value.ok_or_else(|| invalid_input(format!("Missing value for {}", flag)))?;
    NetLocation::from_str(&value, None)
        .map_err(|e| invalid_input(format!("Bad value for {}: {}", flag, e)))
}

fn parse_seconds(flag: &str, value: Option<String>) -> std::io::Result<u64> {
    let value = value.ok_or_else(|| invalid_input(format!("Missing value for {}", flag)))?;
    value
        .parse::<u64>()
        .map_err(|e| invalid_input(format!("Bad value for {}: {}", flag, e)))
}

fn parse_ws_header(value: Option<String>) -> std::io::Result<(String, String)> {
    let value = value.ok_or_else(|| invalid_input("Missing value for --ws-header".to_string()))?;
    let (key, val) = value
        .split_once(':')
        .ok_or_else(|| invalid_input(format!("Bad --ws-header, expected 'Key: value': {}", value)))?;
    Ok((key.trim().to_string(), val.trim().to_string()))
}

/// `ENV:NAME` values are read from the environment at startup; a missing
/// variable becomes an empty key, rejected later when the provider runs.
fn resolve_env_value(value: String) -> String {
    match value.strip_prefix("ENV:") {
        Some(var) => std::env::var(var).unwrap_or_default(),
        None => value,
    }
}

impl Config {
    pub fn from_args(args: Vec<String>) -> std::io::Result<Config> {
        let mut src_tcp: Option<NetLocation> = None;
        let mut dst_udp: Option<NetLocation> = None;
        let mut src_udp: Option<NetLocation> = None;
        let mut dst_tcp: Option<NetLocation> = None;
        let mut transport = Transport::Raw;
        let mut ws_headers: WsHeaders = vec![];
        let mut tcp_keep_alive_secs = 0u64;
        let mut app_keep_alive_secs = 0u64;
        let mut ngrok_filter: Option<String> = None;
        let mut ngrok_api_key = "ENV:NGROK_API_KEY".to_string();

        let mut args = args.into_iter().peekable();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--src-tcp" | "-T" => {
                    src_tcp = Some(parse_location(&arg, args.next())?);
                }
                "--dst-udp" | "-u" => {
                    dst_udp = Some(parse_location(&arg, args.next())?);
                }
                "--src-udp" | "-U" => {
                    src_udp = Some(parse_location(&arg, args.next())?);
                }
                "--dst-tcp" | "-t" => {
                    dst_tcp = Some(parse_location(&arg, args.next())?);
                }
                "--transport" => {
                    let value = args
                        .next()
                        .ok_or_else(|| invalid_input("Missing value for --transport".to_string()))?;
                    transport = Transport::from_str(&value)?;
                }
                "--ws-header" => {
                    ws_headers.push(parse_ws_header(args.next())?);
                }
                "--tcp-keep-alive" => {
                    // The idle time is optional; bare --tcp-keep-alive uses the default.
                    let explicit = args
                        .peek()
                        .and_then(|next| next.parse::<u64>().ok());
                    tcp_keep_alive_secs = match explicit {
                        Some(secs) => {
                            args.next();
                            secs
                        }
                        None => DEFAULT_TCP_KEEP_ALIVE_SECS,
                    };
                }
                "--app-keep-alive" => {
                    app_keep_alive_secs = parse_seconds(&arg, args.next())?;
                }
                "--ngrok-endpoint" => {
                    ngrok_filter = Some(args.next().ok_or_else(|| {
                        invalid_input("Missing value for --ngrok-endpoint".to_string())
                    })?);
                }
                "--ngrok-api-key" => {
                    ngrok_api_key = args.next().ok_or_else(|| {
                        invalid_input("Missing value for --ngrok-api-key".to_string())
                    })?;
                }
                _ => {
                    return Err(invalid_input(format!("Unknown option: {}", arg)));
                }
            }
        }

        let server = match src_tcp {
            Some(tcp_listen) => Some(ServerEngineConfig {
                tcp_listen,
                udp_dest: match dst_udp {
                    Some(location) => location,
                    None => NetLocation::from_str(DEFAULT_UDP_DEST, None)?,
                },
                transport,
                ws_headers: ws_headers.clone(),
                tcp_keep_alive_secs,
            }),
            None => None,
        };

        let client = match src_udp {
            Some(udp_listen) => {
                let dest = match (dst_tcp, ngrok_filter) {
                    (Some(location), None) => DestSpec::Static(location),
                    (None, Some(filter)) => DestSpec::Ngrok {
                        api_key: resolve_env_value(ngrok_api_key),
                        filter,
                    },
                    (Some(_), Some(_)) => {
                        return Err(invalid_input(
                            "'--dst-tcp' and '--ngrok-endpoint' are mutually exclusive".to_string(),
                        ));
                    }
                    (None, None) => {
                        return Err(invalid_input(
                            "'--src-udp' requires '--dst-tcp' or '--ngrok-endpoint'".to_string(),
                        ));
                    }
                };
                Some(ClientEngineConfig {
                    udp_listen,
                    dest,
                    transport,
                    ws_headers,
                    tcp_keep_alive_secs,
                    app_keep_alive_secs,
                })
            }
            None => None,
        };

        if server.is_none() && client.is_none() {
            return Err(invalid_input(
                "one of '--src-tcp' or '--src-udp' (or both) must be given".to_string(),
            ));
        }

        Ok(Config { server, client })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_server_only() {
        let config =
            Config::from_args(args(&["--src-tcp", "127.0.0.1:7000"])).unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.tcp_listen.to_string(), "127.0.0.1:7000");
        assert_eq!(server.udp_dest.to_string(), DEFAULT_UDP_DEST);
        assert_eq!(server.transport, Transport::Raw);
        assert_eq!(server.tcp_keep_alive_secs, 0);
        assert!(config.client.is_none());
    }

    #[test]
    fn test_client_only() {
        let config = Config::from_args(args(&[
            "--src-udp",
            "127.0.0.1:51821",
            "--dst-tcp",
            "relay.example.com:7000",
            "--app-keep-alive",
            "25",
        ]))
        .unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.udp_listen.to_string(), "127.0.0.1:51821");
        assert!(matches!(client.dest, DestSpec::Static(_)));
        assert_eq!(client.app_keep_alive_secs, 25);
        assert!(config.server.is_none());
    }

    #[test]
    fn test_both_engines() {
        let config = Config::from_args(args(&[
            "--src-tcp",
            "0.0.0.0:7000",
            "--dst-udp",
            "127.0.0.1:51820",
            "--src-udp",
            "127.0.0.1:51821",
            "--dst-tcp",
            "127.0.0.1:7000",
        ]))
        .unwrap();
        assert!(config.server.is_some());
        assert!(config.client.is_some());
    }

    #[test]
    fn test_no_engine_is_an_error() {
        assert!(Config::from_args(vec![]).is_err());
        assert!(Config::from_args(args(&["--dst-udp", "127.0.0.1:51820"])).is_err());
    }

    #[test]
    fn test_client_without_destination_is_an_error() {
        assert!(Config::from_args(args(&["--src-udp", "127.0.0.1:51821"])).is_err());
    }

    #[test]
    fn test_tcp_keep_alive_value_is_optional() {
        let config = Config::from_args(args(&[
            "--tcp-keep-alive",
            "--src-tcp",
            "127.0.0.1:7000",
        ]))
        .unwrap();
        assert_eq!(
            config.server.unwrap().tcp_keep_alive_secs,
            DEFAULT_TCP_KEEP_ALIVE_SECS
        );

        let config = Config::from_args(args(&[
            "--tcp-keep-alive",
            "45",
            "--src-tcp",
            "127.0.0.1:7000",
        ]))
        .unwrap();
        assert_eq!(config.server.unwrap().tcp_keep_alive_secs, 45);
    }

    #[test]
    fn test_websocket_transport_with_headers() {
        let config = Config::from_args(args(&[
            "--src-udp",
            "127.0.0.1:51821",
            "--dst-tcp",
            "127.0.0.1:7000",
            "--transport",
            "websocket",
            "--ws-header",
            "X-Tunnel-Auth: sekrit",
        ]))
        .unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.transport, Transport::Websocket);
        assert_eq!(
            client.ws_headers,
            vec![("X-Tunnel-Auth".to_string(), "sekrit".to_string())]
        );
    }

    #[test]
    fn test_ngrok_destination() {
        let config = Config::from_args(args(&[
            "--src-udp",
            "127.0.0.1:51821",
            "--ngrok-endpoint",
            "tcp://.*",
            "--ngrok-api-key",
            "key-123",
        ]))
        .unwrap();
        match config.client.unwrap().dest {
            DestSpec::Ngrok { api_key, filter } => {
                assert_eq!(api_key, "key-123");
                assert_eq!(filter, "tcp://.*");
            }
            other => panic!("expected ngrok destination, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_option_is_an_error() {
        assert!(Config::from_args(args(&["--frobnicate"])).is_err());
    }
}
