use std::pin::Pin;
use std::task::{ready, Context, Poll};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::async_stream::AsyncStream;

const STAGED_BUF_SIZE: usize = 16384;
const WRITE_BUF_SIZE: usize = 8192;

// Frame header, 8-byte extended length, and mask.
const MAX_FRAME_OVERHEAD: usize = 14;

// RFC 6455: control frame payloads are at most 125 bytes.
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Binary-mode WebSocket carrying the tunnel's framed messages. Reads and
/// writes behave like a plain byte stream: each `poll_write` emits one
/// binary message, so a tunnel frame written in a single `write_all` rides
/// in a single WebSocket message. Pings are answered with pongs on the next
/// write, text frames are rejected, and a close frame reads as EOF.
pub struct WebsocketStream<S> {
    stream: S,
    is_client: bool,

    read_state: ReadState,
    frame_opcode: OpCode,
    frame_masked: bool,
    frame_mask: [u8; 4],
    frame_mask_offset: usize,
    frame_remaining: u64,
    read_closed: bool,

    staged: Box<[u8]>,
    staged_start: usize,
    staged_end: usize,

    write_buf: Box<[u8]>,
    write_start: usize,
    write_end: usize,

    ctrl_buf: [u8; MAX_CONTROL_PAYLOAD],
    ctrl_len: usize,
    pending_pong: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReadState {
    FrameHeader,
    ExtendedLength { bytes: usize },
    Mask,
    Payload,
    ControlPayload,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Unknown(u8),
}

impl OpCode {
    fn from(code: u8) -> Self {
        match code {
            0 => OpCode::Continue,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            _ => OpCode::Unknown(code),
        }
    }

    fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> WebsocketStream<S> {
    /// `leftover` is any data the handshake read past the end of the HTTP
    /// head; it is processed before the first read from `stream`.
    pub fn new(stream: S, is_client: bool, leftover: &[u8]) -> Self {
        let mut staged = vec![0u8; STAGED_BUF_SIZE].into_boxed_slice();
        assert!(leftover.len() <= staged.len());
        staged[..leftover.len()].copy_from_slice(leftover);

        Self {
            stream,
            is_client,
            read_state: ReadState::FrameHeader,
            frame_opcode: OpCode::Binary,
            frame_masked: false,
            frame_mask: [0u8; 4],
            frame_mask_offset: 0,
            frame_remaining: 0,
            read_closed: false,
            staged,
            staged_start: 0,
            staged_end: leftover.len(),
            write_buf: vec![0u8; WRITE_BUF_SIZE].into_boxed_slice(),
            write_start: 0,
            write_end: 0,
            ctrl_buf: [0u8; MAX_CONTROL_PAYLOAD],
            ctrl_len: 0,
            pending_pong: false,
        }
    }

    fn consume_staged(&mut self, amount: usize) {
        self.staged_start += amount;
        if self.staged_start == self.staged_end {
            self.staged_start = 0;
            self.staged_end = 0;
        }
    }

    fn unmask_staged(&mut self, len: usize) {
        if !self.frame_masked {
            return;
        }
        for i in 0..len {
            self.staged[self.staged_start + i] ^= self.frame_mask[(self.frame_mask_offset + i) % 4];
        }
        self.frame_mask_offset = (self.frame_mask_offset + len) % 4;
    }

    /// Runs the read state machine over the staged bytes. Returns with
    /// nothing to do when more input is needed or `out` is full.
    fn process_staged(&mut self, out: &mut ReadBuf<'_>) -> std::io::Result<()> {
        while !self.read_closed {
            let staged_len = self.staged_end - self.staged_start;
            match self.read_state {
                ReadState::FrameHeader => {
                    if staged_len < 2 {
                        return Ok(());
                    }
                    let first = self.staged[self.staged_start];
                    let second = self.staged[self.staged_start + 1];
                    self.consume_staged(2);

                    let fin = first & 0x80 != 0;
                    let opcode = OpCode::from(first & 0x0f);
                    self.frame_masked = second & 0x80 != 0;
                    self.frame_mask_offset = 0;
                    let short_length = (second & 0x7f) as u64;

                    if opcode.is_control() {
                        if !fin || short_length > MAX_CONTROL_PAYLOAD as u64 {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                format!("malformed {:?} control frame", opcode),
                            ));
                        }
                    } else if !matches!(opcode, OpCode::Binary | OpCode::Continue) {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("unsupported frame type {:?}", opcode),
                        ));
                    }
                    self.frame_opcode = opcode;

                    match short_length {
                        126 => self.read_state = ReadState::ExtendedLength { bytes: 2 },
                        127 => self.read_state = ReadState::ExtendedLength { bytes: 8 },
                        _ => {
                            self.frame_remaining = short_length;
                            self.begin_frame_payload();
                        }
                    }
                }
                ReadState::ExtendedLength { bytes } => {
                    if staged_len < bytes {
                        return Ok(());
                    }
                    let mut length = 0u64;
                    for i in 0..bytes {
                        length = (length << 8) | (self.staged[self.staged_start + i] as u64);
                    }
                    self.consume_staged(bytes);
                    self.frame_remaining = length;
                    self.begin_frame_payload();
                }
                ReadState::Mask => {
                    if staged_len < 4 {
                        return Ok(());
                    }
                    self.frame_mask.copy_from_slice(
                        &self.staged[self.staged_start..self.staged_start + 4],
                    );
                    self.consume_staged(4);
                    self.dispatch_frame();
                }
                ReadState::Payload => {
                    let amount = staged_len
                        .min(self.frame_remaining as usize)
                        .min(out.remaining());
                    if amount == 0 {
                        return Ok(());
                    }
                    self.unmask_staged(amount);
                    out.put_slice(&self.staged[self.staged_start..self.staged_start + amount]);
                    self.consume_staged(amount);
                    self.frame_remaining -= amount as u64;
                    if self.frame_remaining == 0 {
                        self.read_state = ReadState::FrameHeader;
                    }
                }
                ReadState::ControlPayload => {
                    let amount = staged_len.min(self.frame_remaining as usize);
                    if amount == 0 {
                        return Ok(());
                    }
                    self.unmask_staged(amount);
                    self.ctrl_buf[self.ctrl_len..self.ctrl_len + amount]
                        .copy_from_slice(&self.staged[self.staged_start..self.staged_start + amount]);
                    self.ctrl_len += amount;
                    self.consume_staged(amount);
                    self.frame_remaining -= amount as u64;
                    if self.frame_remaining == 0 {
                        self.finish_control_frame();
                    }
                }
            }
        }
        Ok(())
    }

    /// Called once the payload length is known; masked frames still need
    /// their masking key before the payload can be consumed.
    fn begin_frame_payload(&mut self) {
        if self.frame_masked {
            self.read_state = ReadState::Mask;
        } else {
            self.dispatch_frame();
        }
    }

    fn dispatch_frame(&mut self) {
        match self.frame_opcode {
            OpCode::Binary | OpCode::Continue => {
                self.read_state = if self.frame_remaining == 0 {
                    ReadState::FrameHeader
                } else {
                    ReadState::Payload
                };
            }
            OpCode::Ping | OpCode::Pong => {
                self.ctrl_len = 0;
                if self.frame_remaining == 0 {
                    self.finish_control_frame();
                } else {
                    self.read_state = ReadState::ControlPayload;
                }
            }
            OpCode::Close => {
                self.read_closed = true;
                self.read_state = ReadState::FrameHeader;
            }
            // Rejected while parsing the frame header.
            OpCode::Text | OpCode::Unknown(_) => unreachable!(),
        }
    }

    fn finish_control_frame(&mut self) {
        if self.frame_opcode == OpCode::Ping {
            // Answered on the next write; a pong's payload is ignored.
            self.pending_pong = true;
        }
        self.read_state = ReadState::FrameHeader;
    }

    fn compact_staged(&mut self) {
        if self.staged_start > 0 {
            self.staged
                .copy_within(self.staged_start..self.staged_end, 0);
            self.staged_end -= self.staged_start;
            self.staged_start = 0;
        }
    }

    fn pack_data_frame(&mut self, input: &[u8]) -> usize {
        let space = self.write_buf.len() - self.write_end;
        if space <= MAX_FRAME_OVERHEAD {
            return 0;
        }
        let amount = input.len().min(space - MAX_FRAME_OVERHEAD);
        let written = pack_frame(
            0x02,
            self.is_client,
            &input[..amount],
            &mut self.write_buf[self.write_end..],
        );
        self.write_end += written;
        amount
    }

    fn pack_pong_frame(&mut self) -> bool {
        let space = self.write_buf.len() - self.write_end;
        if space < self.ctrl_len + MAX_FRAME_OVERHEAD {
            return false;
        }
        let written = pack_frame(
            0x0a,
            self.is_client,
            &self.ctrl_buf[..self.ctrl_len],
            &mut self.write_buf[self.write_end..],
        );
        self.write_end += written;
        true
    }

    fn drain_write_buf(&mut self, cx: &mut Context<'_>) -> std::io::Result<()> {
        while self.write_start < self.write_end {
            match Pin::new(&mut self.stream)
                .poll_write(cx, &self.write_buf[self.write_start..self.write_end])
            {
                Poll::Ready(Ok(0)) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "write end closed",
                    ));
                }
                Poll::Ready(Ok(written)) => {
                    self.write_start += written;
                }
                Poll::Ready(Err(e)) => {
                    return Err(e);
                }
                Poll::Pending => {
                    break;
                }
            }
        }
        if self.write_start == self.write_end {
            self.write_start = 0;
            self.write_end = 0;
        }
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WebsocketStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            this.process_staged(buf)?;
            if !buf.filled().is_empty() || this.read_closed {
                return Poll::Ready(Ok(()));
            }

            if this.staged_end == this.staged.len() {
                this.compact_staged();
            }

            let mut read_buf = ReadBuf::new(&mut this.staged[this.staged_end..]);
            match Pin::new(&mut this.stream).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled().len();
                    if filled == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    this.staged_end += filled;
                }
                Poll::Ready(Err(e)) => {
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WebsocketStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.pending_pong {
            if !this.pack_pong_frame() {
                if let Err(e) = this.drain_write_buf(cx) {
                    return Poll::Ready(Err(e));
                }
                if !this.pack_pong_frame() {
                    // The inner write registered the waker.
                    return Poll::Pending;
                }
            }
            this.pending_pong = false;
        }

        let mut written = 0;
        loop {
            let input = &buf[written..];
            if input.is_empty() {
                break;
            }

            written += this.pack_data_frame(input);

            if let Err(e) = this.drain_write_buf(cx) {
                return Poll::Ready(Err(e));
            }
            if this.write_end > 0 {
                // The inner stream is backed up.
                break;
            }
        }

        if written > 0 {
            Poll::Ready(Ok(written))
        } else {
            Poll::Pending
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if let Err(e) = this.drain_write_buf(cx) {
            return Poll::Ready(Err(e));
        }
        if this.write_end > 0 {
            return Poll::Pending;
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut *this).poll_flush(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for WebsocketStream<S> {}

fn pack_frame(opcode: u8, use_mask: bool, payload: &[u8], out: &mut [u8]) -> usize {
    let payload_len = payload.len();

    // 0x80 marks the frame final.
    out[0] = opcode | 0x80;

    let mut offset = if payload_len < 126 {
        out[1] = payload_len as u8;
        2
    } else if payload_len <= 65535 {
        out[1] = 0x7e;
        out[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        4
    } else {
        out[1] = 0x7f;
        out[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
        10
    };

    // Clients must mask; servers must not.
    let mask = if use_mask {
        out[1] |= 0x80;
        let mut mask_bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut mask_bytes);
        out[offset..offset + 4].copy_from_slice(&mask_bytes);
        offset += 4;
        Some(mask_bytes)
    } else {
        None
    };

    out[offset..offset + payload_len].copy_from_slice(payload);
    if let Some(mask_bytes) = mask {
        for (i, byte) in out[offset..offset + payload_len].iter_mut().enumerate() {
            *byte ^= mask_bytes[i % 4];
        }
    }

    offset + payload_len
}
