//! On-wire frame format of the control connection.
//!
//! A frame is one WebSocket binary message: an 8-byte little-endian request
//! identifier followed by an HTTP/1.1 message in its standard wire form. In
//! the server→client direction the message is a request; in the
//! client→server direction it is a response. Control frames (ping, pong,
//! close) carry no tunnel payload.
//!
//! Frames are always buffered whole before parsing; the WebSocket layer
//! already delivers complete messages, and the response belongs to a single
//! pending request, so there is nothing to stream.

pub mod http1;

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Request, Response};

use crate::error::TunnelError;

/// Identifier correlating a response frame with its pending request.
///
/// Allocated from a server-local monotonic counter; only uniqueness among
/// concurrently pending requests matters.
pub type ReqId = u64;

/// Length of the request-id prefix on the wire.
pub const REQ_ID_LEN: usize = 8;

/// Default ceiling for a single frame; applied as the WebSocket
/// max-message-size on both endpoints.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Serialize a request frame: `id ‖ HTTP/1.1 request`.
pub fn encode_request(id: ReqId, req: &Request<Bytes>) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQ_ID_LEN + 256 + req.body().len());
    buf.put_u64_le(id);
    http1::write_request(&mut buf, req);
    buf.freeze()
}

/// Serialize a response frame: `id ‖ HTTP/1.1 response`.
pub fn encode_response(id: ReqId, resp: &Response<Bytes>) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQ_ID_LEN + 256 + resp.body().len());
    buf.put_u64_le(id);
    http1::write_response(&mut buf, resp);
    buf.freeze()
}

/// Parse a request frame received by the tunnel client.
pub fn decode_request(frame: &[u8]) -> Result<(ReqId, Request<Bytes>), TunnelError> {
    let (id, rest) = split_req_id(frame)?;
    let req = http1::parse_request(rest)?;
    Ok((id, req))
}

/// Parse a response frame received by the tunnel server.
///
/// The method of the originating request decides whether a body is
/// expected (a HEAD response carries none).
pub fn decode_response(frame: &[u8], method: &Method) -> Result<(ReqId, Response<Bytes>), TunnelError> {
    let (id, rest) = split_req_id(frame)?;
    let resp = http1::parse_response(rest, method)?;
    Ok((id, resp))
}

/// Read the request id off a frame without parsing the HTTP payload.
///
/// Lets the reader look up the pending entry (and its method) before the
/// full response parse.
pub fn peek_req_id(frame: &[u8]) -> Result<ReqId, TunnelError> {
    Ok(split_req_id(frame)?.0)
}

fn split_req_id(frame: &[u8]) -> Result<(ReqId, &[u8]), TunnelError> {
    if frame.len() < REQ_ID_LEN {
        return Err(TunnelError::Protocol(format!(
            "frame of {} bytes is shorter than the request id",
            frame.len()
        )));
    }
    let mut id_bytes = [0u8; REQ_ID_LEN];
    id_bytes.copy_from_slice(&frame[..REQ_ID_LEN]);
    Ok((ReqId::from_le_bytes(id_bytes), &frame[REQ_ID_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_carries_id_and_body() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header("content-type", "text/plain")
            .body(Bytes::from_static(b"payload"))
            .unwrap();

        let frame = encode_request(0xDEAD_BEEF, &req);
        assert_eq!(&frame[..REQ_ID_LEN], &0xDEAD_BEEFu64.to_le_bytes());

        let (id, decoded) = decode_request(&frame).unwrap();
        assert_eq!(id, 0xDEAD_BEEF);
        assert_eq!(decoded.method(), Method::POST);
        assert_eq!(decoded.uri().path(), "/submit");
        assert_eq!(decoded.body().as_ref(), b"payload");
    }

    #[test]
    fn test_response_frame_round() {
        let resp = Response::builder()
            .status(404)
            .body(Bytes::from_static(b"nothing here"))
            .unwrap();

        let frame = encode_response(7, &resp);
        let (id, decoded) = decode_response(&frame, &Method::GET).unwrap();
        assert_eq!(id, 7);
        assert_eq!(decoded.status(), 404);
        assert_eq!(decoded.body().as_ref(), b"nothing here");
    }

    #[test]
    fn test_short_frame_is_protocol_error() {
        let err = decode_request(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
    }

    #[test]
    fn test_peek_req_id() {
        let resp = Response::builder().status(200).body(Bytes::new()).unwrap();
        let frame = encode_response(42, &resp);
        assert_eq!(peek_req_id(&frame).unwrap(), 42);
    }
}
