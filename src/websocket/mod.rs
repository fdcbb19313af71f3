mod handshake;
mod stream;

pub use handshake::{client_handshake, server_handshake};
pub use stream::WebsocketStream;
