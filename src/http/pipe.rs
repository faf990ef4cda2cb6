//! Incremental HTTP/1.x message parser.
//!
//! Bytes are fed in arbitrary chunks; the pipe emits [`PipeEvent`]s as soon
//! as they can be produced, independent of how the input was split. One pipe
//! instance alternates between request and response messages via
//! [`HttpPipe::reset`].
//!
//! In normal mode chunked framing bytes (size lines, CRLFs) are passed
//! through inside `Data` events so the relayed stream stays byte-identical.
//! With "deliver pure data" enabled only the decoded chunk payloads are
//! emitted, for consumers that rewrite the body and re-frame it themselves.

use std::io::{Error, ErrorKind};

pub const MAX_HEADER_SIZE: usize = 1024 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Longest request method name ("OPTIONS"/"CONNECT") in bytes.
const MAX_METHOD_LEN: usize = 7;
/// "HTTP/1.1" version token length.
const MAX_VERSION_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl HttpMethod {
    pub fn from_token(token: &str) -> Option<HttpMethod> {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "HEAD" => Some(HttpMethod::Head),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            "CONNECT" => Some(HttpMethod::Connect),
            "OPTIONS" => Some(HttpMethod::Options),
            "TRACE" => Some(HttpMethod::Trace),
            "PATCH" => Some(HttpMethod::Patch),
            _ => None,
        }
    }

    /// Methods whose messages carry no body unless headers say otherwise.
    pub fn is_bodyless(self) -> bool {
        matches!(
            self,
            HttpMethod::Get
                | HttpMethod::Head
                | HttpMethod::Options
                | HttpMethod::Trace
                | HttpMethod::Connect
                | HttpMethod::Delete
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: HttpMethod, path: String, version: String },
    Response { version: String, status: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub start: StartLine,
    pub fields: Vec<HeaderField>,
    /// -1 when absent or unparseable.
    pub content_length: i64,
    pub chunked: bool,
    pub upgrade: bool,
}

impl HttpHeader {
    pub fn kind(&self) -> MessageKind {
        match self.start {
            StartLine::Request { .. } => MessageKind::Request,
            StartLine::Response { .. } => MessageKind::Response,
        }
    }

    pub fn find_value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
            .map(|field| field.value.as_str())
    }

    pub fn set_value(&mut self, name: &str, value: String) {
        match self.fields.iter_mut().find(|field| field.name.eq_ignore_ascii_case(name)) {
            Some(field) => field.value = value,
            None => self.fields.push(HeaderField { name: name.to_string(), value }),
        }
    }

    pub fn remove_all(&mut self, name: &str) {
        self.fields.retain(|field| !field.name.eq_ignore_ascii_case(name));
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        match &self.start {
            StartLine::Request { method, path, version } => {
                let method = match method {
                    HttpMethod::Get => "GET",
                    HttpMethod::Head => "HEAD",
                    HttpMethod::Post => "POST",
                    HttpMethod::Put => "PUT",
                    HttpMethod::Delete => "DELETE",
                    HttpMethod::Connect => "CONNECT",
                    HttpMethod::Options => "OPTIONS",
                    HttpMethod::Trace => "TRACE",
                    HttpMethod::Patch => "PATCH",
                };
                out.push_str(&format!("{method} {path} {version}\r\n"));
            }
            StartLine::Response { version, status, reason } => {
                out.push_str(&format!("{version} {status} {reason}\r\n"));
            }
        }
        for field in &self.fields {
            out.push_str(&format!("{}: {}\r\n", field.name, field.value));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

#[derive(Debug, PartialEq)]
pub enum PipeEvent {
    Header(HttpHeader),
    Data(Vec<u8>),
    /// End of the current message. The pipe stays parked until `reset`.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    SearchingHeader,
    ContentLengthBody,
    ChunkedSize,
    ChunkedData,
    End,
}

pub struct HttpPipe {
    kind: MessageKind,
    state: ParseState,
    buffer: Vec<u8>,
    deliver_pure_data: bool,
    content_length: i64,
    content_read: i64,
    chunk_size: usize,
    chunk_read: usize,
}

impl HttpPipe {
    pub fn new(kind: MessageKind) -> Self {
        HttpPipe {
            kind,
            state: ParseState::SearchingHeader,
            buffer: Vec::new(),
            deliver_pure_data: false,
            content_length: -1,
            content_read: 0,
            chunk_size: 0,
            chunk_read: 0,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn message_ended(&self) -> bool {
        self.state == ParseState::End
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// When set, chunked framing bytes are decoded away and only payload
    /// bytes are emitted.
    pub fn set_deliver_pure_data(&mut self, pure: bool) {
        self.deliver_pure_data = pure;
    }

    /// Starts parsing the next message. Leftover buffered bytes are dropped.
    pub fn reset(&mut self, kind: MessageKind) {
        *self = HttpPipe::new(kind);
    }

    /// Hands back whatever is buffered, e.g. the first bytes of an upgraded
    /// (raw) stream that arrived glued to the response header.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Feeds a chunk and appends the events it completes to `out`. A parse
    /// error poisons the pipe and must terminate the connection.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<PipeEvent>) -> Result<(), Error> {
        self.buffer.extend_from_slice(data);

        loop {
            let progressed = match self.state {
                ParseState::SearchingHeader => self.parse_header(out)?,
                ParseState::ContentLengthBody => self.read_content_body(out),
                ParseState::ChunkedSize => self.read_chunk_size(out)?,
                ParseState::ChunkedData => self.read_chunk_data(out)?,
                ParseState::End => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn parse_header(&mut self, out: &mut Vec<PipeEvent>) -> Result<bool, Error> {
        self.validate_first_token()?;

        let end = match find_subsequence(&self.buffer, HEADER_END) {
            Some(end) => end,
            None => {
                if self.buffer.len() > MAX_HEADER_SIZE {
                    return Err(invalid("header larger than the permitted maximum"));
                }
                return Ok(false);
            }
        };
        if end > MAX_HEADER_SIZE {
            return Err(invalid("header larger than the permitted maximum"));
        }

        let header_bytes = self.buffer[..end].to_vec();
        self.buffer.drain(..end + HEADER_END.len());

        let text = String::from_utf8(header_bytes).map_err(|_| invalid("header is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");
        let start_line = lines.next().ok_or_else(|| invalid("empty header"))?;
        let start = self.parse_start_line(start_line)?;

        let mut fields = Vec::new();
        let mut content_length: i64 = -1;
        let mut chunked = false;
        let mut upgrade = false;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = match line.split_once(':') {
                Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
                None => return Err(invalid("malformed header field")),
            };

            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<i64>().unwrap_or(-1);
            } else if name.eq_ignore_ascii_case("transfer-encoding") && value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            } else if name.eq_ignore_ascii_case("upgrade") {
                upgrade = true;
            }
            fields.push(HeaderField { name, value });
        }

        let header = HttpHeader {
            start,
            fields,
            content_length,
            chunked,
            upgrade,
        };

        let bodyless_request = match &header.start {
            StartLine::Request { method, .. } => method.is_bodyless() && content_length <= 0 && !chunked,
            StartLine::Response { .. } => false,
        };

        self.content_length = content_length;
        self.content_read = 0;

        // An upgraded stream stops being HTTP right after this header; the
        // owner must collect the leftover via `take_buffer`.
        let ended = if upgrade {
            self.state = ParseState::End;
            false
        } else if chunked {
            self.state = ParseState::ChunkedSize;
            false
        } else if content_length > 0 && !bodyless_request {
            self.state = ParseState::ContentLengthBody;
            false
        } else {
            self.state = ParseState::End;
            true
        };

        out.push(PipeEvent::Header(header));
        if ended {
            out.push(PipeEvent::End);
        }
        Ok(true)
    }

    /// Errors out early when the first token cannot possibly become a valid
    /// method or HTTP version, without waiting for a full header.
    fn validate_first_token(&self) -> Result<(), Error> {
        let space = self.buffer.iter().position(|&b| b == b' ');
        let token = match space {
            Some(pos) => &self.buffer[..pos],
            None => {
                let max = match self.kind {
                    MessageKind::Request => MAX_METHOD_LEN,
                    MessageKind::Response => MAX_VERSION_LEN,
                };
                if self.buffer.len() > max {
                    return Err(invalid("not an HTTP stream"));
                }
                return Ok(());
            }
        };

        let token = std::str::from_utf8(token).map_err(|_| invalid("not an HTTP stream"))?;
        let valid = match self.kind {
            MessageKind::Request => HttpMethod::from_token(token).is_some(),
            MessageKind::Response => token.eq_ignore_ascii_case("HTTP/1.1") || token.eq_ignore_ascii_case("HTTP/1.0"),
        };
        match valid {
            true => Ok(()),
            false => Err(invalid("not an HTTP stream")),
        }
    }

    fn parse_start_line(&self, line: &str) -> Result<StartLine, Error> {
        match self.kind {
            MessageKind::Request => {
                let mut parts = line.splitn(3, ' ');
                let method = parts
                    .next()
                    .and_then(HttpMethod::from_token)
                    .ok_or_else(|| invalid("bad request method"))?;
                let path = parts.next().ok_or_else(|| invalid("bad request line"))?.to_string();
                let version = parts.next().unwrap_or("HTTP/1.1").to_string();
                Ok(StartLine::Request { method, path, version })
            }
            MessageKind::Response => {
                let mut parts = line.splitn(3, ' ');
                let version = parts.next().ok_or_else(|| invalid("bad status line"))?.to_string();
                let status = parts
                    .next()
                    .and_then(|s| s.parse::<u16>().ok())
                    .ok_or_else(|| invalid("bad status code"))?;
                let reason = parts.next().unwrap_or("").to_string();
                Ok(StartLine::Response { version, status, reason })
            }
        }
    }

    fn read_content_body(&mut self, out: &mut Vec<PipeEvent>) -> bool {
        if self.buffer.is_empty() {
            return false;
        }

        let readable = (self.content_length - self.content_read) as usize;
        if self.buffer.len() < readable {
            let data = std::mem::take(&mut self.buffer);
            self.content_read += data.len() as i64;
            out.push(PipeEvent::Data(data));
            return false;
        }

        let data: Vec<u8> = self.buffer.drain(..readable).collect();
        self.content_read += data.len() as i64;
        out.push(PipeEvent::Data(data));
        self.state = ParseState::End;
        out.push(PipeEvent::End);
        true
    }

    fn read_chunk_size(&mut self, out: &mut Vec<PipeEvent>) -> Result<bool, Error> {
        // The CRLF that terminates the previous chunk's data shows up here.
        if self.buffer.starts_with(CRLF) {
            self.buffer.drain(..CRLF.len());
            if !self.deliver_pure_data {
                out.push(PipeEvent::Data(CRLF.to_vec()));
            }
        }

        let line_end = match find_subsequence(&self.buffer, CRLF) {
            Some(pos) => pos,
            None => {
                if self.buffer.len() > 4096 {
                    // No sane chunk size line (even with extensions) is this long.
                    return Err(invalid("bad chunk size line"));
                }
                return Ok(false);
            }
        };

        let line = std::str::from_utf8(&self.buffer[..line_end]).map_err(|_| invalid("bad chunk size line"))?;
        let size_token = line.split(';').next().unwrap_or("").trim();
        let chunk_size = usize::from_str_radix(size_token, 16).map_err(|_| invalid("bad chunk size"))?;

        let raw: Vec<u8> = self.buffer.drain(..line_end + CRLF.len()).collect();
        if !self.deliver_pure_data {
            out.push(PipeEvent::Data(raw));
        }

        self.chunk_size = chunk_size;
        self.chunk_read = 0;
        self.state = ParseState::ChunkedData;
        Ok(true)
    }

    fn read_chunk_data(&mut self, out: &mut Vec<PipeEvent>) -> Result<bool, Error> {
        if self.chunk_size == 0 {
            // Final chunk: consume the trailing CRLF and finish the message.
            if self.buffer.len() < CRLF.len() {
                return Ok(false);
            }
            if !self.buffer.starts_with(CRLF) {
                return Err(invalid("trailers are not supported"));
            }
            self.buffer.drain(..CRLF.len());
            if !self.deliver_pure_data {
                out.push(PipeEvent::Data(CRLF.to_vec()));
            }
            self.state = ParseState::End;
            out.push(PipeEvent::End);
            return Ok(true);
        }

        let readable = self.chunk_size - self.chunk_read;
        if self.buffer.len() < readable {
            return Ok(false);
        }

        let data: Vec<u8> = self.buffer.drain(..readable).collect();
        self.chunk_read += data.len();
        out.push(PipeEvent::Data(data));
        self.state = ParseState::ChunkedSize;
        Ok(true)
    }
}

fn invalid(message: &str) -> Error {
    Error::new(ErrorKind::InvalidData, message.to_string())
}

pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(pipe: &mut HttpPipe, bytes: &[u8]) -> Vec<PipeEvent> {
        let mut out = Vec::new();
        pipe.feed(bytes, &mut out).unwrap();
        out
    }

    fn collect_data(events: &[PipeEvent]) -> Vec<u8> {
        let mut data = Vec::new();
        for event in events {
            if let PipeEvent::Data(bytes) = event {
                data.extend_from_slice(bytes);
            }
        }
        data
    }

    const CHUNKED_RESPONSE: &[u8] =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";

    #[test]
    fn parses_a_simple_get_request() {
        let mut pipe = HttpPipe::new(MessageKind::Request);
        let events = feed_all(&mut pipe, b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n");

        assert_eq!(events.len(), 2);
        match &events[0] {
            PipeEvent::Header(header) => {
                assert_eq!(
                    header.start,
                    StartLine::Request {
                        method: HttpMethod::Get,
                        path: "/index.html".into(),
                        version: "HTTP/1.1".into(),
                    }
                );
                assert_eq!(header.find_value("host"), Some("example.com"));
            }
            other => panic!("expected header, got {other:?}"),
        }
        assert_eq!(events[1], PipeEvent::End);
        assert!(pipe.message_ended());
    }

    #[test]
    fn content_length_body_is_delivered_and_ended() {
        let mut pipe = HttpPipe::new(MessageKind::Request);
        let events = feed_all(&mut pipe, b"POST /api HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");

        assert!(matches!(events[0], PipeEvent::Header(_)));
        assert_eq!(collect_data(&events), b"hello");
        assert_eq!(events.last(), Some(&PipeEvent::End));
    }

    #[test]
    fn chunked_passthrough_is_byte_identical() {
        let header_len = find_subsequence(CHUNKED_RESPONSE, b"\r\n\r\n").unwrap() + 4;

        let mut pipe = HttpPipe::new(MessageKind::Response);
        let events = feed_all(&mut pipe, CHUNKED_RESPONSE);
        assert_eq!(collect_data(&events), &CHUNKED_RESPONSE[header_len..]);
        assert_eq!(events.last(), Some(&PipeEvent::End));
    }

    #[test]
    fn chunked_decode_is_split_independent() {
        for cut in 1..CHUNKED_RESPONSE.len() {
            let mut pipe = HttpPipe::new(MessageKind::Response);
            pipe.set_deliver_pure_data(true);

            let mut events = Vec::new();
            pipe.feed(&CHUNKED_RESPONSE[..cut], &mut events).unwrap();
            pipe.feed(&CHUNKED_RESPONSE[cut..], &mut events).unwrap();

            assert_eq!(collect_data(&events), b"Wikipedia", "cut at {cut}");
            assert_eq!(events.last(), Some(&PipeEvent::End), "cut at {cut}");
        }
    }

    #[test]
    fn bodyless_get_ends_without_content_length() {
        let mut pipe = HttpPipe::new(MessageKind::Request);
        let events = feed_all(&mut pipe, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(events.last(), Some(&PipeEvent::End));
    }

    #[test]
    fn upgrade_header_parks_the_pipe_and_keeps_leftover() {
        let mut pipe = HttpPipe::new(MessageKind::Response);
        let mut bytes =
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n".to_vec();
        bytes.extend_from_slice(b"\x81\x05hello");

        let events = feed_all(&mut pipe, &bytes);
        match &events[0] {
            PipeEvent::Header(header) => assert!(header.upgrade),
            other => panic!("expected header, got {other:?}"),
        }
        assert!(!events.contains(&PipeEvent::End));
        assert_eq!(pipe.take_buffer(), b"\x81\x05hello");
    }

    #[test]
    fn rejects_non_http_bytes_early() {
        let mut pipe = HttpPipe::new(MessageKind::Request);
        let mut out = Vec::new();
        let error = pipe.feed(b"NOTAMETHOD /x HTTP/1.1\r\n", &mut out).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_oversized_headers() {
        let mut pipe = HttpPipe::new(MessageKind::Request);
        let mut out = Vec::new();
        let mut bytes = b"GET / HTTP/1.1\r\n".to_vec();
        bytes.extend(std::iter::repeat(b'a').take(MAX_HEADER_SIZE + 16));
        let error = pipe.feed(&bytes, &mut out).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn reset_switches_direction() {
        let mut pipe = HttpPipe::new(MessageKind::Request);
        feed_all(&mut pipe, b"GET / HTTP/1.1\r\n\r\n");
        assert!(pipe.message_ended());

        pipe.reset(MessageKind::Response);
        let events = feed_all(&mut pipe, b"HTTP/1.1 204 No Content\r\n\r\n");
        match &events[0] {
            PipeEvent::Header(header) => assert_eq!(header.status(), Some(204)),
            other => panic!("expected header, got {other:?}"),
        }
        assert_eq!(events.last(), Some(&PipeEvent::End));
    }

    #[test]
    fn serializes_headers_back_out() {
        let mut pipe = HttpPipe::new(MessageKind::Request);
        let events = feed_all(&mut pipe, b"GET /a HTTP/1.1\r\nHost: h\r\nAccept: */*\r\n\r\n");
        let header = match &events[0] {
            PipeEvent::Header(header) => header.clone(),
            other => panic!("expected header, got {other:?}"),
        };
        assert_eq!(header.to_bytes(), b"GET /a HTTP/1.1\r\nHost: h\r\nAccept: */*\r\n\r\n");
    }
}
