use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// The opaque byte stream a tunnel session runs over. Plain TCP and the
/// WebSocket wrapper both erase to this.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl AsyncStream for TcpStream {}
