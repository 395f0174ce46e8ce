//! Length-prefixed message framing.
//!
//! ```text
//! +------+----------------+-----------------+
//! | flag | length (u32 BE)| message bytes   |
//! +------+----------------+-----------------+
//!   1 B        4 B           length B
//! ```
//! Flag bit 0 marks a compressed message (unsupported). Flag `0x80` marks a
//! gRPC-Web trailer frame whose payload is an HTTP/1 header block.

use std::convert::Infallible;

use axum::body::Body;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::HeaderMap;
use hyper::body::Frame;

use crate::rpc::descriptor::MessageStream;
use crate::rpc::Status;

const HEADER_LEN: usize = 5;
const TRAILER_FLAG: u8 = 0x80;

/// Largest message accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Frame one message. Messages over [`MAX_MESSAGE_SIZE`] are refused in
/// both directions.
pub fn encode(message: &[u8]) -> Result<Bytes, Status> {
    frame(0, message)
}

/// Frame a trailer block for gRPC-Web.
pub fn encode_web_trailers(trailers: &HeaderMap) -> Result<Bytes, Status> {
    let mut block = Vec::new();
    for (name, value) in trailers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    frame(TRAILER_FLAG, &block)
}

fn frame(flag: u8, payload: &[u8]) -> Result<Bytes, Status> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(too_large(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(flag);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn too_large(len: usize) -> Status {
    Status::resource_exhausted(format!(
        "message of {len} bytes exceeds limit of {MAX_MESSAGE_SIZE}"
    ))
}

/// Incremental decoder for a stream of framed messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, Status> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let flag = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if flag & 0x01 != 0 {
            return Err(Status::unimplemented("compressed messages are not supported"));
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(too_large(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Decode a request body into a stream of messages.
pub fn decode_body(body: Body) -> MessageStream {
    let state = (body.into_data_stream(), FrameDecoder::default(), false);

    futures_util::stream::unfold(state, |(mut data, mut decoder, done)| async move {
        if done {
            return None;
        }
        loop {
            match decoder.next_message() {
                Ok(Some(message)) => return Some((Ok(message), (data, decoder, false))),
                Ok(None) => {}
                Err(status) => return Some((Err(status), (data, decoder, true))),
            }
            match data.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(e)) => {
                    let status = Status::internal(format!("failed to read request body: {e}"));
                    return Some((Err(status), (data, decoder, true)));
                }
                None if decoder.is_empty() => return None,
                None => {
                    let status = Status::internal("request body ended mid-message");
                    return Some((Err(status), (data, decoder, true)));
                }
            }
        }
    })
    .boxed()
}

/// Read exactly one message from a unary request body.
pub async fn read_unary(body: Body) -> Result<Bytes, Status> {
    let mut messages = decode_body(body);
    match messages.next().await {
        Some(result) => result,
        None => Err(Status::internal("missing request message")),
    }
}

/// Turn a response stream into HTTP body frames, ending with a status
/// trailer (an HTTP trailer block, or an in-body frame for gRPC-Web).
pub fn response_frames(
    messages: MessageStream,
    web: bool,
) -> impl Stream<Item = Result<Frame<Bytes>, Infallible>> + Send + 'static {
    futures_util::stream::unfold(Some(messages), move |state| async move {
        let Some(mut messages) = state else {
            return None;
        };
        let frame = match messages.next().await {
            Some(Ok(message)) => match encode(&message) {
                Ok(data) => return Some((Ok(Frame::data(data)), Some(messages))),
                Err(status) => trailer_frame(Err(status), web),
            },
            Some(Err(status)) => trailer_frame(Err(status), web),
            None => trailer_frame(Ok(()), web),
        };
        Some((Ok(frame), None))
    })
}

/// Trailer frame for a finished call.
pub fn trailer_frame(result: Result<(), Status>, web: bool) -> Frame<Bytes> {
    let mut trailers = HeaderMap::new();
    match result {
        Ok(()) => crate::rpc::status::write_status(&mut trailers, crate::rpc::Code::Ok, ""),
        Err(status) => status.write_to(&mut trailers),
    }
    if web {
        // Only an oversized grpc-message can overflow the block.
        let block = encode_web_trailers(&trailers).unwrap_or_else(|status| {
            let mut bare = HeaderMap::new();
            crate::rpc::status::write_status(&mut bare, status.code(), "");
            encode_web_trailers(&bare).unwrap_or_default()
        });
        Frame::data(block)
    } else {
        Frame::trailers(trailers)
    }
}
