//! HTTP-aware wrapper for connections accepted on http/https forward ports.
//!
//! The handler sits between the public connection and the tunnel. Requests
//! from the public side are parsed and rewritten (Host and path point at the
//! destination, custom headers are appended) before being emitted toward the
//! tunnel. Responses coming back are rewritten the other way: the destination
//! host is substituted back, CORS and cookie domains are fixed up, redirects
//! are repointed, and optionally text bodies are buffered, transcoded and
//! rewritten, then re-framed as chunked. After a 101 upgrade the handler
//! becomes a transparent byte relay.

use std::{
    cell::RefCell,
    io::{Error, Read, Write},
    rc::Rc,
};

use flate2::{
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use regex::Regex;
use tracing::{debug, warn};

use crate::{
    config::{BodyRewriteRule, CustomHeader, HttpOption},
    http::pipe::{HttpHeader, HttpPipe, MessageKind, PipeEvent, StartLine},
    net::socket::{Connection, SendCallback, SocketEvent, SocketObserver},
};

/// Rewritten bodies are re-framed as chunked in pieces of this size.
const REWRITE_CHUNK_SIZE: usize = 1024;

struct HandlerState {
    pipe: HttpPipe,
    upgraded: bool,
    origin_host: String,
    /// Value of the request's Origin header, if any.
    origin_address: String,
    rewrite_body: bool,
    body_buffer: Vec<u8>,
    content_encoding: String,
    /// Bytes accepted from the tunnel side, whether written yet or not.
    buf_length: u64,
    /// `buf_length` as of the last completed write toward the public side.
    send_length: u64,
    /// Bytes emitted toward the tunnel side (after request rewriting).
    receive_length: u64,
    left_buffer_on_close: bool,
    /// Completions for sends that went into the body buffer; fired when the
    /// rewritten body flushes.
    pending_body_callbacks: Vec<SendCallback>,
}

pub struct HttpHandler {
    conn: Rc<Connection>,
    destination: String,
    options: HttpOption,
    rules: Vec<(Regex, String)>,
    st: RefCell<HandlerState>,
    observer: RefCell<Option<SocketObserver>>,
}

/// What one batch of parser events turned into. Dispatched only after every
/// `RefCell` borrow is dropped.
#[derive(Default)]
struct Dispatch {
    /// Bytes for the public side, each with an optional completion.
    writes: Vec<(Vec<u8>, Option<SendCallback>)>,
    /// Bytes for the tunnel side.
    emits: Vec<Vec<u8>>,
    fatal: Option<Error>,
}

impl HttpHandler {
    pub fn attach(conn: Rc<Connection>, destination: String, options: HttpOption) -> Rc<HttpHandler> {
        let rules = compile_rules(&options.body_rewrite_rules);
        let handler = Rc::new(HttpHandler {
            conn,
            destination,
            options,
            rules,
            st: RefCell::new(HandlerState {
                pipe: HttpPipe::new(MessageKind::Request),
                upgraded: false,
                origin_host: String::new(),
                origin_address: String::new(),
                rewrite_body: false,
                body_buffer: Vec::new(),
                content_encoding: String::new(),
                buf_length: 0,
                send_length: 0,
                receive_length: 0,
                left_buffer_on_close: false,
                pending_body_callbacks: Vec::new(),
            }),
            observer: RefCell::new(None),
        });

        let event_handler = Rc::clone(&handler);
        handler.conn.set_observer(Box::new(move |event| event_handler.on_socket_event(event)));
        handler
    }

    pub fn connection(&self) -> &Rc<Connection> {
        &self.conn
    }

    pub fn set_observer(&self, observer: SocketObserver) {
        *self.observer.borrow_mut() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.observer.borrow_mut() = None;
    }

    pub fn send_length(&self) -> u64 {
        self.st.borrow().send_length
    }

    pub fn receive_length(&self) -> u64 {
        self.st.borrow().receive_length
    }

    pub fn broke_flush(&self) -> bool {
        self.conn.broke_flush() || self.st.borrow().left_buffer_on_close
    }

    pub fn end(&self) {
        self.conn.end();
    }

    pub fn destroy(&self) {
        let callbacks = std::mem::take(&mut self.st.borrow_mut().pending_body_callbacks);
        for callback in callbacks {
            callback(false);
        }
        self.conn.destroy();
    }

    /// Response-direction input: bytes arriving from the tunnel for the
    /// public client.
    pub fn send_data(self: &Rc<Self>, data: Vec<u8>, on_complete: Option<SendCallback>) {
        let mut dispatch = Dispatch::default();
        let mut on_complete = on_complete;
        {
            let mut st = self.st.borrow_mut();
            st.buf_length += data.len() as u64;

            if st.upgraded {
                dispatch.writes.push((data, None));
            } else {
                if st.pipe.kind() == MessageKind::Request {
                    st.pipe.reset(MessageKind::Response);
                }

                let mut events = Vec::new();
                match st.pipe.feed(&data, &mut events) {
                    Ok(()) => self.process_response_events(&mut st, events, &mut dispatch),
                    Err(error) => dispatch.fatal = Some(error),
                }
                let buffered_into_body = st.rewrite_body && dispatch.writes.is_empty() && dispatch.fatal.is_none();
                if buffered_into_body {
                    if let Some(callback) = on_complete.take() {
                        st.pending_body_callbacks.push(callback);
                    }
                }
            }
        }

        // Attach the caller's completion to the last write this input
        // produced; with no write (header still incomplete) complete it now.
        if let Some(callback) = on_complete.take() {
            match dispatch.writes.last_mut() {
                Some(last) if last.1.is_none() => last.1 = Some(callback),
                Some(_) | None => {
                    if dispatch.fatal.is_none() {
                        callback(true)
                    } else {
                        callback(false)
                    }
                }
            }
        }

        self.run_dispatch(dispatch);
    }

    fn on_socket_event(self: &Rc<Self>, event: SocketEvent) {
        match event {
            SocketEvent::Receive(data) => self.on_public_bytes(data),
            SocketEvent::Closed(error) => {
                {
                    let mut st = self.st.borrow_mut();
                    st.left_buffer_on_close = st.pipe.buffered() > 0;
                    st.send_length = st.buf_length;
                    let callbacks = std::mem::take(&mut st.pending_body_callbacks);
                    drop(st);
                    for callback in callbacks {
                        callback(false);
                    }
                }
                self.emit(SocketEvent::Closed(error));
            }
        }
    }

    /// Request-direction input from the public connection.
    fn on_public_bytes(self: &Rc<Self>, data: Vec<u8>) {
        let mut dispatch = Dispatch::default();
        {
            let mut st = self.st.borrow_mut();
            if st.upgraded {
                dispatch.emits.push(data);
            } else {
                if st.pipe.kind() == MessageKind::Response {
                    st.pipe.reset(MessageKind::Request);
                }

                let mut events = Vec::new();
                match st.pipe.feed(&data, &mut events) {
                    Ok(()) => self.process_request_events(&mut st, events, &mut dispatch),
                    Err(error) => dispatch.fatal = Some(error),
                }
            }
        }
        self.run_dispatch(dispatch);
    }

    fn process_request_events(&self, st: &mut HandlerState, events: Vec<PipeEvent>, dispatch: &mut Dispatch) {
        for event in events {
            match event {
                PipeEvent::Header(mut header) => {
                    let (origin_host, origin_address) =
                        rewrite_request_header(&mut header, &self.destination, &self.options);
                    if !origin_host.is_empty() {
                        st.origin_host = origin_host;
                    }
                    if !origin_address.is_empty() {
                        st.origin_address = origin_address;
                    }
                    dispatch.emits.push(header.to_bytes());
                }
                PipeEvent::Data(data) => dispatch.emits.push(data),
                PipeEvent::End => {}
            }
        }
    }

    fn process_response_events(&self, st: &mut HandlerState, events: Vec<PipeEvent>, dispatch: &mut Dispatch) {
        for event in events {
            match event {
                PipeEvent::Header(mut header) => {
                    let upgrade = header.upgrade;
                    let rewrite = rewrite_response_header(
                        &mut header,
                        &self.destination,
                        &st.origin_host,
                        &st.origin_address,
                        self.conn.is_tls(),
                        &self.options,
                    );

                    st.rewrite_body = rewrite.rewrite_body && !upgrade;
                    st.content_encoding = rewrite.content_encoding;
                    st.pipe.set_deliver_pure_data(st.rewrite_body);
                    dispatch.writes.push((header.to_bytes(), None));

                    if upgrade {
                        st.upgraded = true;
                        let leftover = st.pipe.take_buffer();
                        if !leftover.is_empty() {
                            dispatch.writes.push((leftover, None));
                        }
                    }
                }
                PipeEvent::Data(data) => match st.rewrite_body {
                    true => st.body_buffer.extend_from_slice(&data),
                    false => dispatch.writes.push((data, None)),
                },
                PipeEvent::End => {
                    if st.rewrite_body {
                        let body = std::mem::take(&mut st.body_buffer);
                        let framed = self.rewrite_body_bytes(st, body);
                        let callbacks = std::mem::take(&mut st.pending_body_callbacks);
                        dispatch.writes.push((
                            framed,
                            Some(Box::new(move |ok| {
                                for callback in callbacks {
                                    callback(ok);
                                }
                            })),
                        ));
                        st.rewrite_body = false;
                        st.content_encoding.clear();
                    }
                    st.pipe.reset(MessageKind::Request);
                }
            }
        }
    }

    fn rewrite_body_bytes(&self, st: &HandlerState, body: Vec<u8>) -> Vec<u8> {
        let rewritten = match decompress(&body, &st.content_encoding) {
            Ok(plain) => {
                let text = String::from_utf8_lossy(&plain).into_owned();
                let text = rewrite_text_body(&text, &self.destination, &st.origin_host, &self.rules);
                match compress(text.as_bytes(), &st.content_encoding) {
                    Ok(packed) => packed,
                    Err(error) => {
                        warn!("body recompression failed, relaying unmodified: {error}");
                        body
                    }
                }
            }
            Err(error) => {
                debug!("body decompression failed, relaying unmodified: {error}");
                body
            }
        };

        chunk_encode(&rewritten)
    }

    fn run_dispatch(self: &Rc<Self>, dispatch: Dispatch) {
        for data in dispatch.emits {
            if data.is_empty() {
                continue;
            }
            {
                self.st.borrow_mut().receive_length += data.len() as u64;
            }
            self.emit(SocketEvent::Receive(data));
        }

        for (data, mut on_complete) in dispatch.writes {
            if data.is_empty() {
                if let Some(callback) = on_complete.take() {
                    callback(true);
                }
                continue;
            }

            let snapshot = self.st.borrow().buf_length;
            let handler = Rc::clone(self);
            let callback: SendCallback = Box::new(move |ok| {
                if ok {
                    handler.st.borrow_mut().send_length = snapshot;
                }
                if let Some(callback) = on_complete.take() {
                    callback(ok);
                }
            });
            self.conn.send_with(data, Some(callback));
        }

        if let Some(error) = dispatch.fatal {
            warn!("connection {} dropped: {error}", self.conn.id());
            self.conn.destroy();
        }
    }

    fn emit(&self, event: SocketEvent) {
        let observer = self.observer.borrow_mut().take();
        if let Some(mut observer) = observer {
            observer(event);
            let mut slot = self.observer.borrow_mut();
            if slot.is_none() {
                *slot = Some(observer);
            }
        }
    }
}

/// Points the request at the destination: Host (and any header or path that
/// mentions the public host) is rewritten, the Origin header is captured
/// beforehand for the CORS fix-up on the way back.
fn rewrite_request_header(header: &mut HttpHeader, destination: &str, options: &HttpOption) -> (String, String) {
    let origin_host = header.find_value("host").unwrap_or("").to_string();
    let origin_address = header.find_value("origin").unwrap_or("").to_string();

    if !origin_host.is_empty() {
        for field in &mut header.fields {
            if field.value.contains(&origin_host) {
                field.value = field.value.replace(&origin_host, destination);
            }
        }
        if let StartLine::Request { path, .. } = &mut header.start {
            if path.contains(&origin_host) {
                *path = path.replace(&origin_host, destination);
            }
        }
    }

    apply_custom_headers(header, &options.custom_request_headers);
    (origin_host, origin_address)
}

pub(crate) struct ResponseRewrite {
    pub rewrite_body: bool,
    pub content_encoding: String,
}

/// Makes the response look like it came from the public host again.
fn rewrite_response_header(
    header: &mut HttpHeader,
    destination: &str,
    origin_host: &str,
    origin_address: &str,
    public_tls: bool,
    options: &HttpOption,
) -> ResponseRewrite {
    if !origin_host.is_empty() {
        for field in &mut header.fields {
            if field.value.contains(destination) {
                field.value = field.value.replace(destination, origin_host);
            }
        }
    }

    for field in &mut header.fields {
        if field.name.eq_ignore_ascii_case("set-cookie") {
            field.value = strip_cookie_domain(&field.value);
        }
    }

    if options.replace_access_control_allow_origin && header.find_value("access-control-allow-origin").is_some() {
        let allow_origin = match origin_address.is_empty() {
            false => origin_address.to_string(),
            true => {
                let scheme = if public_tls { "https" } else { "http" };
                format!("{scheme}://{origin_host}")
            }
        };
        header.set_value("Access-Control-Allow-Origin", allow_origin);
    }

    apply_custom_headers(header, &options.custom_response_headers);

    let content_encoding = header
        .find_value("content-encoding")
        .unwrap_or("")
        .to_ascii_lowercase();
    let has_body = header.content_length > 0 || header.chunked;
    let rewrite_body = options.rewrite_host_in_text_body && has_body && is_text_content_type(header);

    if rewrite_body {
        // The rewritten body's length is unknowable up front.
        header.remove_all("content-length");
        header.remove_all("transfer-encoding");
        header.set_value("Transfer-Encoding", "chunked".to_string());
    }

    ResponseRewrite {
        rewrite_body,
        content_encoding,
    }
}

fn apply_custom_headers(header: &mut HttpHeader, custom: &[CustomHeader]) {
    for entry in custom {
        if entry.replace {
            header.remove_all(&entry.name);
        }
        header.fields.push(crate::http::pipe::HeaderField {
            name: entry.name.clone(),
            value: entry.value.clone(),
        });
    }
}

fn is_text_content_type(header: &HttpHeader) -> bool {
    let content_type = match header.find_value("content-type") {
        Some(value) => value.to_ascii_lowercase(),
        None => return false,
    };

    content_type.starts_with("text/")
        || content_type.contains("json")
        || content_type.contains("javascript")
        || content_type.contains("xml")
}

fn strip_cookie_domain(value: &str) -> String {
    // Compiled per cookie header; cookies are rare enough not to cache this.
    let re = Regex::new(r"(?i)Domain=[^;]+;?\s?").unwrap();
    re.replace_all(value, "").trim_end().to_string()
}

/// Applies configured rules, then the generic `://host` substitution.
fn rewrite_text_body(text: &str, destination: &str, origin_host: &str, rules: &[(Regex, String)]) -> String {
    let mut text = text.to_string();
    for (pattern, replacement) in rules {
        text = pattern.replace_all(&text, replacement.as_str()).into_owned();
    }

    if !origin_host.is_empty() {
        text = modify_urls_in_body(&text, destination, origin_host);
    }
    text
}

/// Substitutes the destination host for the public host inside every
/// `://host...` occurrence.
fn modify_urls_in_body(text: &str, destination: &str, origin_host: &str) -> String {
    let re = Regex::new(r#"://[^\s'"<>]+"#).unwrap();
    re.replace_all(text, |captures: &regex::Captures| {
        let url = &captures[0][3..];
        match url.starts_with(destination) {
            true => format!("://{}", url.replacen(destination, origin_host, 1)),
            false => captures[0].to_string(),
        }
    })
    .into_owned()
}

fn compile_rules(rules: &[BodyRewriteRule]) -> Vec<(Regex, String)> {
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules {
        match compile_rule_pattern(&rule.from) {
            Ok(pattern) => compiled.push((pattern, rule.to.clone())),
            Err(error) => warn!("ignoring unusable body rewrite rule {:?}: {error}", rule.from),
        }
    }
    compiled
}

/// `/pattern/flags` compiles as a regex (flags: i, m, s; g is implied since
/// replacement is always global); anything else matches literally.
fn compile_rule_pattern(from: &str) -> Result<Regex, regex::Error> {
    if from.len() >= 2 && from.starts_with('/') {
        if let Some(close) = from.rfind('/') {
            if close > 0 {
                let pattern = &from[1..close];
                let flags: String = from[close + 1..]
                    .chars()
                    .filter(|c| matches!(c, 'i' | 'm' | 's'))
                    .collect();
                let full = match flags.is_empty() {
                    true => pattern.to_string(),
                    false => format!("(?{flags}){pattern}"),
                };
                return Regex::new(&full);
            }
        }
    }

    Regex::new(&regex::escape(from))
}

fn decompress(data: &[u8], encoding: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    match encoding {
        "gzip" | "x-gzip" => {
            GzDecoder::new(data).read_to_end(&mut out)?;
        }
        "deflate" => {
            ZlibDecoder::new(data).read_to_end(&mut out)?;
        }
        _ => out.extend_from_slice(data),
    }
    Ok(out)
}

fn compress(data: &[u8], encoding: &str) -> Result<Vec<u8>, Error> {
    match encoding {
        "gzip" | "x-gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        _ => Ok(data.to_vec()),
    }
}

/// Frames `data` as an entire chunked body, terminator included.
fn chunk_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / REWRITE_CHUNK_SIZE * 8 + 8);
    for chunk in data.chunks(REWRITE_CHUNK_SIZE) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::pipe::HttpMethod;

    fn parse_header(kind: MessageKind, bytes: &[u8]) -> HttpHeader {
        let mut pipe = HttpPipe::new(kind);
        let mut events = Vec::new();
        pipe.feed(bytes, &mut events).unwrap();
        match events.into_iter().next() {
            Some(PipeEvent::Header(header)) => header,
            other => panic!("expected header, got {other:?}"),
        }
    }

    #[test]
    fn request_host_and_path_point_at_destination() {
        let mut header = parse_header(
            MessageKind::Request,
            b"GET http://public.example/app HTTP/1.1\r\nHost: public.example\r\nReferer: http://public.example/\r\nOrigin: https://public.example\r\n\r\n",
        );

        let (origin_host, origin_address) = rewrite_request_header(&mut header, "10.1.2.3", &HttpOption::default());
        assert_eq!(origin_host, "public.example");
        assert_eq!(origin_address, "https://public.example");
        assert_eq!(header.find_value("host"), Some("10.1.2.3"));
        assert_eq!(header.find_value("referer"), Some("http://10.1.2.3/"));
        match &header.start {
            StartLine::Request { method, path, .. } => {
                assert_eq!(*method, HttpMethod::Get);
                assert_eq!(path, "http://10.1.2.3/app");
            }
            other => panic!("unexpected start line {other:?}"),
        }
    }

    #[test]
    fn custom_request_headers_append_or_replace() {
        let mut header = parse_header(MessageKind::Request, b"GET / HTTP/1.1\r\nHost: h\r\nX-Tag: old\r\n\r\n");
        let mut options = HttpOption::default();
        options.custom_request_headers = vec![
            CustomHeader {
                name: "X-Tag".into(),
                value: "new".into(),
                replace: true,
            },
            CustomHeader {
                name: "X-Extra".into(),
                value: "1".into(),
                replace: false,
            },
        ];

        rewrite_request_header(&mut header, "dest", &options);
        assert_eq!(header.find_value("x-tag"), Some("new"));
        assert_eq!(header.find_value("x-extra"), Some("1"));
    }

    #[test]
    fn redirect_location_is_repointed() {
        let mut header = parse_header(
            MessageKind::Response,
            b"HTTP/1.1 302 Found\r\nLocation: http://10.1.2.3/login\r\nContent-Length: 0\r\n\r\n",
        );
        rewrite_response_header(&mut header, "10.1.2.3", "public.example", "", false, &HttpOption::default());
        assert_eq!(header.find_value("location"), Some("http://public.example/login"));
    }

    #[test]
    fn cookie_domain_is_stripped() {
        let mut header = parse_header(
            MessageKind::Response,
            b"HTTP/1.1 200 OK\r\nSet-Cookie: sid=abc; Domain=internal.example; Path=/\r\n\r\n",
        );
        rewrite_response_header(&mut header, "d", "p", "", false, &HttpOption::default());
        assert_eq!(header.find_value("set-cookie"), Some("sid=abc; Path=/"));
    }

    #[test]
    fn cors_header_uses_request_origin() {
        let mut header = parse_header(
            MessageKind::Response,
            b"HTTP/1.1 200 OK\r\nAccess-Control-Allow-Origin: http://10.1.2.3\r\n\r\n",
        );
        rewrite_response_header(
            &mut header,
            "10.1.2.3",
            "public.example",
            "https://public.example",
            true,
            &HttpOption::default(),
        );
        assert_eq!(
            header.find_value("access-control-allow-origin"),
            Some("https://public.example")
        );
    }

    #[test]
    fn text_bodies_switch_to_chunked_framing() {
        let mut header = parse_header(
            MessageKind::Response,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 120\r\n\r\n",
        );
        let rewrite = rewrite_response_header(&mut header, "d", "p", "", false, &HttpOption::default());
        assert!(rewrite.rewrite_body);
        assert_eq!(header.find_value("content-length"), None);
        assert_eq!(header.find_value("transfer-encoding"), Some("chunked"));
    }

    #[test]
    fn binary_bodies_are_left_alone() {
        let mut header = parse_header(
            MessageKind::Response,
            b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 10\r\n\r\n",
        );
        let rewrite = rewrite_response_header(&mut header, "d", "p", "", false, &HttpOption::default());
        assert!(!rewrite.rewrite_body);
        assert_eq!(header.find_value("content-length"), Some("10"));
    }

    #[test]
    fn body_urls_are_rewritten_back() {
        let body = r#"<a href="http://10.1.2.3/x">x</a> and '://10.1.2.3/y' but not ://other.host/z"#;
        let out = modify_urls_in_body(body, "10.1.2.3", "public.example");
        assert!(out.contains("http://public.example/x"));
        assert!(out.contains("://public.example/y"));
        assert!(out.contains("://other.host/z"));
    }

    #[test]
    fn literal_and_regex_rules_apply() {
        let rules = compile_rules(&[
            BodyRewriteRule {
                from: "plain.token".into(),
                to: "REPLACED".into(),
            },
            BodyRewriteRule {
                from: "/se[ck]ret/i".into(),
                to: "[hidden]".into(),
            },
        ]);

        let out = rewrite_text_body("plain.token SECRET plainXtoken", "d", "", &rules);
        assert_eq!(out, "REPLACED [hidden] plainXtoken");
    }

    #[test]
    fn gzip_round_trips_through_transcode() {
        let packed = compress(b"hello gzip body", "gzip").unwrap();
        assert_ne!(packed, b"hello gzip body");
        assert_eq!(decompress(&packed, "gzip").unwrap(), b"hello gzip body");
    }

    #[test]
    fn chunk_encode_frames_and_terminates() {
        let framed = chunk_encode(&vec![b'a'; 1500]);
        let text = String::from_utf8(framed).unwrap();
        assert!(text.starts_with("400\r\n"));
        assert!(text.contains("\r\n1dc\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }
}
