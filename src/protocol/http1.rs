//! HTTP/1.1 wire serialization and parsing for tunnel frames.
//!
//! Messages travel fully buffered, so serialization always knows the body
//! length and parsing operates on a complete byte slice. Bodies are read
//! per `Content-Length`, chunked transfer coding, or remainder-of-frame
//! when neither is present.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRAILER, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, Request, Response, StatusCode, Version};

use crate::error::TunnelError;

const MAX_HEADERS: usize = 64;

/// Headers that describe the connection or the original body framing.
/// The body travels buffered, so framing is re-derived on write.
fn is_connection_header(name: &HeaderName) -> bool {
    name == TRANSFER_ENCODING || name == CONNECTION || name == TRAILER || name == "keep-alive"
}

/// Serialize a request in origin-form: start line, headers, body.
pub fn write_request(buf: &mut BytesMut, req: &Request<Bytes>) {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    buf.put_slice(req.method().as_str().as_bytes());
    buf.put_slice(b" ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            buf.put_slice(b"Host: ");
            buf.put_slice(authority.as_str().as_bytes());
            buf.put_slice(b"\r\n");
        }
    }

    write_headers(buf, req.headers());
    write_content_length(buf, req.headers(), req.body().len(), false);
    buf.put_slice(b"\r\n");
    buf.put_slice(req.body());
}

/// Serialize a response: status line, headers, body.
pub fn write_response(buf: &mut BytesMut, resp: &Response<Bytes>) {
    let status = resp.status();

    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_slice(b" ");
    buf.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.put_slice(b"\r\n");

    write_headers(buf, resp.headers());
    write_content_length(buf, resp.headers(), resp.body().len(), status_forbids_body(status));
    buf.put_slice(b"\r\n");
    buf.put_slice(resp.body());
}

/// Parse a request from a complete frame payload.
pub fn parse_request(data: &[u8]) -> Result<Request<Bytes>, TunnelError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_storage);

    let head_len = match parsed.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(TunnelError::Protocol("truncated request head".into()))
        }
        Err(err) => return Err(TunnelError::Protocol(format!("bad request head: {err}"))),
    };

    let method = parsed
        .method
        .ok_or_else(|| TunnelError::Protocol("request without method".into()))?;
    let path = parsed
        .path
        .ok_or_else(|| TunnelError::Protocol("request without path".into()))?;

    let headers = collect_headers(parsed.headers)?;
    let body = read_body(&data[head_len..], &headers, false)?;

    let mut builder = Request::builder()
        .method(Method::from_bytes(method.as_bytes()).map_err(|err| {
            TunnelError::Protocol(format!("bad method {method:?}: {err}"))
        })?)
        .uri(path)
        .version(version_from(parsed.version));
    if let Some(dst) = builder.headers_mut() {
        *dst = headers;
    }
    builder
        .body(body)
        .map_err(|err| TunnelError::Protocol(format!("invalid request: {err}")))
}

/// Parse a response from a complete frame payload.
///
/// `method` is the method of the originating request; it decides whether a
/// body is expected at all.
pub fn parse_response(data: &[u8], method: &Method) -> Result<Response<Bytes>, TunnelError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_storage);

    let head_len = match parsed.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(TunnelError::Protocol("truncated response head".into()))
        }
        Err(err) => return Err(TunnelError::Protocol(format!("bad response head: {err}"))),
    };

    let code = parsed
        .code
        .ok_or_else(|| TunnelError::Protocol("response without status code".into()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|err| TunnelError::Protocol(format!("bad status code {code}: {err}")))?;

    let headers = collect_headers(parsed.headers)?;
    let bodyless = *method == Method::HEAD || status_forbids_body(status);
    let body = read_body(&data[head_len..], &headers, bodyless)?;

    let mut builder = Response::builder()
        .status(status)
        .version(version_from(parsed.version));
    if let Some(dst) = builder.headers_mut() {
        *dst = headers;
    }
    builder
        .body(body)
        .map_err(|err| TunnelError::Protocol(format!("invalid response: {err}")))
}

fn write_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        if is_connection_header(name) {
            continue;
        }
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
}

fn write_content_length(buf: &mut BytesMut, headers: &HeaderMap, body_len: usize, bodyless: bool) {
    if bodyless || headers.contains_key(CONTENT_LENGTH) {
        return;
    }
    buf.put_slice(b"Content-Length: ");
    buf.put_slice(body_len.to_string().as_bytes());
    buf.put_slice(b"\r\n");
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, TunnelError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|err| TunnelError::Protocol(format!("bad header name {:?}: {err}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|err| TunnelError::Protocol(format!("bad value for header {name}: {err}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn read_body(rest: &[u8], headers: &HeaderMap, bodyless: bool) -> Result<Bytes, TunnelError> {
    if bodyless {
        return Ok(Bytes::new());
    }

    if is_chunked(headers) {
        return decode_chunked(rest);
    }

    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let len: usize = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| TunnelError::Protocol(format!("bad content-length {value:?}")))?;
        if rest.len() < len {
            return Err(TunnelError::Protocol(format!(
                "body truncated: content-length {len}, {} bytes in frame",
                rest.len()
            )));
        }
        return Ok(Bytes::copy_from_slice(&rest[..len]));
    }

    // No framing headers: the body is whatever remains of the frame.
    Ok(Bytes::copy_from_slice(rest))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn decode_chunked(mut rest: &[u8]) -> Result<Bytes, TunnelError> {
    let mut body = BytesMut::new();
    loop {
        let line_end = find_crlf(rest)
            .ok_or_else(|| TunnelError::Protocol("chunk size line without CRLF".into()))?;
        let size_str = std::str::from_utf8(&rest[..line_end])
            .map_err(|_| TunnelError::Protocol("chunk size is not ASCII".into()))?;
        // Chunk extensions after ';' are ignored.
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|err| TunnelError::Protocol(format!("bad chunk size {size_str:?}: {err}")))?;
        rest = &rest[line_end + 2..];

        if size == 0 {
            // Trailers, if any, end the message; nothing in the tunnel reads them.
            return Ok(body.freeze());
        }
        if rest.len() < size + 2 {
            return Err(TunnelError::Protocol("chunk data truncated".into()));
        }
        body.put_slice(&rest[..size]);
        if &rest[size..size + 2] != b"\r\n" {
            return Err(TunnelError::Protocol("chunk data without trailing CRLF".into()));
        }
        rest = &rest[size + 2..];
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn version_from(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}
