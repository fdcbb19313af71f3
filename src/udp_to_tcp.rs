use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};

use crate::async_stream::AsyncStream;
use crate::config::ClientEngineConfig;
use crate::dest_provider::DestProvider;
use crate::frame::{self, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::keepalive::KeepAlive;
use crate::socket_util::{is_peer_closed, set_tcp_keep_alive};
use crate::transport;

/// Runs the client engine: accept UDP datagrams, frame them onto an
/// outbound stream, and route framed responses back to the UDP sender.
pub async fn run(config: ClientEngineConfig, provider: Arc<dyn DestProvider>) -> std::io::Result<()> {
    let listen_addr = config.udp_listen.resolve().await?;
    let udp = Arc::new(UdpSocket::bind(listen_addr).await?);
    debug!("accepting datagrams on {}", listen_addr);
    serve(udp, provider, config).await
}

/// The engine's single session. The stream socket is recreated on every
/// reconnect; the UDP accept socket and the cached sender endpoint live for
/// the whole engine.
pub(crate) async fn serve(
    udp: Arc<UdpSocket>,
    provider: Arc<dyn DestProvider>,
    config: ClientEngineConfig,
) -> std::io::Result<()> {
    let local_port = udp.local_addr()?.port();
    let sender: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let mut datagram = [0u8; MAX_PAYLOAD_LEN];

    loop {
        // Idle: the stream is opened lazily, on the first datagram.
        let parked_len = match udp.recv_from(&mut datagram).await {
            Ok((length, from)) => {
                *sender.lock() = Some(from);
                length
            }
            Err(e) => {
                error!("udp recv failed: {}", e);
                continue;
            }
        };

        let dest = match provider.resolve().await {
            Ok(d) => d,
            Err(e) => {
                // The next datagram triggers another attempt.
                warn!("destination resolution failed: {}", e);
                continue;
            }
        };

        let stream = match connect(dest, &config).await {
            Ok(s) => s,
            Err(e) => {
                error!("connect [{}] failed: {}", dest, e);
                continue;
            }
        };
        debug!("connected to {}", dest);

        let keepalive = KeepAlive::new(config.app_keep_alive_secs);
        match connected_phase(
            stream,
            &udp,
            &sender,
            keepalive,
            local_port,
            &datagram[..parked_len],
        )
        .await
        {
            Ok(()) => debug!("{}: stream closed, waiting for next datagram", dest),
            Err(e) => error!("{}: session failed: {}", dest, e),
        }
        // The resolved destination is forgotten here; the next datagram
        // resolves and reconnects from scratch.
    }
}

async fn connect(
    dest: SocketAddr,
    config: &ClientEngineConfig,
) -> std::io::Result<Box<dyn AsyncStream>> {
    let tcp = TcpStream::connect(dest).await?;
    if config.tcp_keep_alive_secs > 0 {
        set_tcp_keep_alive(&tcp, config.tcp_keep_alive_secs)?;
    }
    transport::client_stream(config.transport, tcp, &dest.to_string(), &config.ws_headers).await
}

/// Runs both direction loops until either one ends. Dropping the loser
/// closes the stream halves, which also cancels the pending UDP receive
/// and the keep-alive wait.
async fn connected_phase(
    stream: Box<dyn AsyncStream>,
    udp: &Arc<UdpSocket>,
    sender: &Arc<Mutex<Option<SocketAddr>>>,
    keepalive: KeepAlive,
    local_port: u16,
    parked: &[u8],
) -> std::io::Result<()> {
    let (reader, writer) = tokio::io::split(stream);
    tokio::select! {
        r = stream_to_udp(reader, udp.clone(), sender.clone(), keepalive.clone()) => r,
        r = udp_to_stream(writer, udp.clone(), sender.clone(), keepalive, local_port, parked) => r,
    }
}

async fn udp_to_stream(
    mut writer: WriteHalf<Box<dyn AsyncStream>>,
    udp: Arc<UdpSocket>,
    sender: Arc<Mutex<Option<SocketAddr>>>,
    keepalive: KeepAlive,
    local_port: u16,
    parked: &[u8],
) -> std::io::Result<()> {
    let mut payload = [0u8; MAX_PAYLOAD_LEN];
    let mut message = [0u8; HEADER_LEN + MAX_PAYLOAD_LEN];

    // The datagram that triggered this connection goes out first, ahead of
    // anything received while the connect was in flight.
    let dst_port = sender.lock().as_ref().map(|a| a.port()).unwrap_or(0);
    let total = frame::encode_message(local_port, dst_port, parked, &mut message);
    writer.write_all(&message[..total]).await?;
    writer.flush().await?;
    keepalive.extend();

    loop {
        tokio::select! {
            result = udp.recv_from(&mut payload) => {
                let (length, from) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        error!("udp recv failed: {}", e);
                        continue;
                    }
                };
                *sender.lock() = Some(from);
                trace!("forwarding {} bytes from {} to stream", length, from);
                let total = frame::encode_message(local_port, from.port(), &payload[..length], &mut message);
                writer.write_all(&message[..total]).await?;
                writer.flush().await?;
                keepalive.extend();
            }
            _ = keepalive.idle() => {
                let dst_port = sender.lock().as_ref().map(|a| a.port()).unwrap_or(0);
                let control = FrameHeader::new(local_port, dst_port, 0).encode();
                writer.write_all(&control).await?;
                writer.flush().await?;
                trace!("heartbeat sent");
                keepalive.extend();
            }
        }
    }
}

async fn stream_to_udp(
    mut reader: ReadHalf<Box<dyn AsyncStream>>,
    udp: Arc<UdpSocket>,
    sender: Arc<Mutex<Option<SocketAddr>>>,
    keepalive: KeepAlive,
) -> std::io::Result<()> {
    let mut header_buf = [0u8; HEADER_LEN];
    let mut payload = [0u8; MAX_PAYLOAD_LEN];

    loop {
        match reader.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if is_peer_closed(&e) => {
                debug!("stream closed by peer");
                return Ok(());
            }
            Err(e) => {
                error!("stream read failed: {}", e);
                continue;
            }
        }

        let header = match FrameHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(_) => {
                warn!("discarding frame with invalid header");
                continue;
            }
        };
        if header.is_control() {
            trace!("heartbeat received");
            continue;
        }

        let length = header.length as usize;
        match reader.read_exact(&mut payload[..length]).await {
            Ok(_) => {}
            Err(e) if is_peer_closed(&e) => {
                debug!("stream closed mid-frame");
                return Ok(());
            }
            Err(e) => {
                error!("stream read failed: {}", e);
                continue;
            }
        }
        keepalive.extend();

        // Responses can only be routed once a sender is known.
        let target = *sender.lock();
        match target {
            Some(addr) if addr.port() != 0 => {
                trace!("forwarding {} bytes to {}", length, addr);
                if let Err(e) = udp.send_to(&payload[..length], addr).await {
                    error!("udp send failed: {}", e);
                }
            }
            _ => trace!("no return path yet, dropping {} bytes", length),
        }
    }
}
