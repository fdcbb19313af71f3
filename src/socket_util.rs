use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Enables TCP keep-alive with the given idle time and arms zero-linger so
/// a dead peer is torn down with a reset instead of lingering in TIME_WAIT.
pub fn set_tcp_keep_alive(stream: &TcpStream, idle_secs: u64) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(idle_secs)))?;
    sock.set_linger(Some(Duration::from_secs(0)))?;
    Ok(())
}

/// True for the errors that mean the stream counterpart went away, as
/// opposed to a transient fault worth retrying in place.
pub fn is_peer_closed(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_peer_closed() {
        assert!(is_peer_closed(&std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof"
        )));
        assert!(is_peer_closed(&std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        )));
        assert!(!is_peer_closed(&std::io::Error::other("transient")));
    }

    #[tokio::test]
    async fn test_set_tcp_keep_alive() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        set_tcp_keep_alive(&stream, 120).unwrap();
    }
}
