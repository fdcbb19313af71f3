use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::async_stream::AsyncStream;
use crate::config::ServerEngineConfig;
use crate::frame::{self, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::socket_util::{is_peer_closed, set_tcp_keep_alive};
use crate::transport;

const TRANSPORT_SETUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs the server engine: accept stream connections, de-frame messages,
/// re-inject them as UDP datagrams toward the local destination.
pub async fn run(config: ServerEngineConfig) -> std::io::Result<()> {
    let listen_addr = config.tcp_listen.resolve().await?;
    let udp_dest = config.udp_dest.resolve().await?;
    let listener = TcpListener::bind(listen_addr).await?;
    debug!("accepting framed streams on {} for {}", listen_addr, udp_dest);
    serve(listener, udp_dest, config).await
}

pub(crate) async fn serve(
    listener: TcpListener,
    udp_dest: SocketAddr,
    config: ServerEngineConfig,
) -> std::io::Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };
        debug!("{}: new connection", peer_addr);

        if config.tcp_keep_alive_secs > 0 {
            if let Err(e) = set_tcp_keep_alive(&stream, config.tcp_keep_alive_secs) {
                warn!("{}: failed to set tcp keep-alive: {}", peer_addr, e);
            }
        }

        let cloned_config = config.clone();
        tokio::spawn(async move {
            match run_session(stream, peer_addr, udp_dest, cloned_config).await {
                Ok(()) => debug!("{}: session closed", peer_addr),
                Err(e) => error!("{}: session failed: {}", peer_addr, e),
            }
        });
    }
}

/// One session per accepted connection. The stream side runs here; the UDP
/// receive loop is spawned once the first valid data frame proves the
/// tunnel healthy, and is cancelled when the stream goes away.
async fn run_session(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    udp_dest: SocketAddr,
    config: ServerEngineConfig,
) -> std::io::Result<()> {
    let stream = match timeout(
        TRANSPORT_SETUP_TIMEOUT,
        transport::server_stream(config.transport, tcp, &config.ws_headers),
    )
    .await
    {
        Ok(result) => result?,
        Err(elapsed) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("transport setup timed out: {}", elapsed),
            ));
        }
    };

    // Companion socket toward the local UDP destination; the bound port is
    // ephemeral and `send`/`recv` operate on the connected peer.
    let udp = match udp_dest {
        SocketAddr::V4(_) => UdpSocket::bind("0.0.0.0:0").await?,
        SocketAddr::V6(_) => UdpSocket::bind("[::]:0").await?,
    };
    udp.connect(udp_dest).await?;
    let udp = Arc::new(udp);
    let udp_local_port = udp.local_addr()?.port();

    let (mut reader, writer) = tokio::io::split(stream);
    let mut writer = Some(writer);
    let mut udp_task: Option<JoinHandle<()>> = None;

    let result = stream_to_udp(
        &mut reader,
        &udp,
        peer_addr,
        udp_dest.port(),
        udp_local_port,
        &mut writer,
        &mut udp_task,
    )
    .await;

    if let Some(task) = udp_task {
        task.abort();
    }
    result
}

async fn stream_to_udp(
    reader: &mut ReadHalf<Box<dyn AsyncStream>>,
    udp: &Arc<UdpSocket>,
    peer_addr: SocketAddr,
    udp_remote_port: u16,
    udp_local_port: u16,
    writer: &mut Option<WriteHalf<Box<dyn AsyncStream>>>,
    udp_task: &mut Option<JoinHandle<()>>,
) -> std::io::Result<()> {
    let mut header_buf = [0u8; HEADER_LEN];
    let mut payload = [0u8; MAX_PAYLOAD_LEN];

    loop {
        match reader.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if is_peer_closed(&e) => {
                debug!("{}: connection closed", peer_addr);
                return Ok(());
            }
            Err(e) => {
                error!("{}: stream read failed: {}", peer_addr, e);
                continue;
            }
        }

        let header = match FrameHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(_) => {
                warn!("{}: discarding frame with invalid header", peer_addr);
                continue;
            }
        };
        if header.is_control() {
            trace!("{}: heartbeat received", peer_addr);
            continue;
        }

        let length = header.length as usize;
        match reader.read_exact(&mut payload[..length]).await {
            Ok(_) => {}
            Err(e) if is_peer_closed(&e) => {
                debug!("{}: connection closed mid-frame", peer_addr);
                return Ok(());
            }
            Err(e) => {
                error!("{}: stream read failed: {}", peer_addr, e);
                continue;
            }
        }

        // The first complete data frame proves the peer speaks our framing;
        // only then do we start pumping UDP responses back.
        if udp_task.is_none() {
            let writer = writer.take().expect("udp pump started twice");
            *udp_task = Some(tokio::spawn(udp_to_stream(
                writer,
                udp.clone(),
                peer_addr,
                udp_remote_port,
                udp_local_port,
            )));
        }

        trace!("{}: forwarding {} bytes to udp", peer_addr, length);
        if let Err(e) = udp.send(&payload[..length]).await {
            error!("{}: udp send failed: {}", peer_addr, e);
        }
    }
}

async fn udp_to_stream(
    mut writer: WriteHalf<Box<dyn AsyncStream>>,
    udp: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    udp_remote_port: u16,
    udp_local_port: u16,
) {
    let mut payload = [0u8; MAX_PAYLOAD_LEN];
    let mut message = [0u8; HEADER_LEN + MAX_PAYLOAD_LEN];

    loop {
        let length = match udp.recv(&mut payload).await {
            Ok(l) => l,
            Err(e) => {
                error!("{}: udp recv failed: {}", peer_addr, e);
                continue;
            }
        };

        trace!("{}: forwarding {} bytes to stream", peer_addr, length);
        let total = frame::encode_message(udp_remote_port, udp_local_port, &payload[..length], &mut message);
        if let Err(e) = write_message(&mut writer, &message[..total]).await {
            // The stream side will observe the failure and tear down.
            debug!("{}: stream write failed: {}", peer_addr, e);
            return;
        }
    }
}

async fn write_message(
    writer: &mut WriteHalf<Box<dyn AsyncStream>>,
    message: &[u8],
) -> std::io::Result<()> {
    writer.write_all(message).await?;
    writer.flush().await
}
