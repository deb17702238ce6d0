use core::fmt;

/// Responses with a header block larger than this are treated as malformed.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// A malformed response. Non-recoverable for the connection that saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(&'static str);

impl fmt::Display for ParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "invalid response: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

impl From<httparse::Error> for ParseError {
    fn from(_: httparse::Error) -> Self {
        Self("malformed header block")
    }
}

#[derive(Debug)]
enum State {
    Head,
    Body(Framing),
    Complete,
}

#[derive(Debug)]
enum Framing {
    Length(u64),
    Chunked(Chunk),
    UntilClose,
}

#[derive(Debug)]
enum Chunk {
    Size { value: u64, seen: bool },
    Ext { size: u64 },
    SizeLf { size: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    Trailer { line_has_content: bool },
}

/// Streaming HTTP/1.1 response parser.
///
/// Wraps [`httparse`] for the header block and follows the body framing
/// (`Content-Length`, chunked, or close-delimited) byte by byte, so response
/// data can be fed in whatever pieces the socket produces. One message at a
/// time; call [`reset`](Self::reset) before the next one.
///
/// `Set-Cookie` values are only inspected when cookie capture is enabled,
/// mirroring the fact that header parsing is otherwise unnecessary work.
#[derive(Debug)]
pub struct ResponseParser {
    capture_cookies: bool,
    head: Vec<u8>,
    state: State,
    status: u16,
    server_close: bool,
    cookies: Vec<String>,
}

impl ResponseParser {
    pub fn new(capture_cookies: bool) -> Self {
        Self {
            capture_cookies,
            head: Vec::new(),
            state: State::Head,
            status: 0,
            server_close: false,
            cookies: Vec::new(),
        }
    }

    /// Prepares the parser for the next message on the same connection.
    pub fn reset(&mut self) {
        self.head.clear();
        self.state = State::Head;
        self.status = 0;
        self.server_close = false;
        self.cookies.clear();
    }

    /// Whether a complete message has been seen since the last reset.
    #[inline]
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    /// Status code of the current message. Zero until the head is parsed.
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the server indicated it will close the connection.
    #[inline]
    pub fn server_close(&self) -> bool {
        self.server_close
    }

    /// Takes the `Set-Cookie` values captured for the current message.
    pub fn take_cookies(&mut self) -> Vec<String> {
        core::mem::take(&mut self.cookies)
    }

    /// Feeds response bytes to the parser.
    ///
    /// Bytes past the end of the message are ignored; pipelining is not
    /// supported, so there is never a legitimate byte after completion.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), ParseError> {
        match self.state {
            State::Head => {
                let search_from = self.head.len().saturating_sub(3);
                self.head.extend_from_slice(data);

                let Some(pos) = find_head_end(&self.head[search_from..]) else {
                    if self.head.len() > MAX_HEAD_LEN {
                        return Err(ParseError("header block too large"));
                    }
                    return Ok(());
                };
                let head_end = search_from + pos + 4;

                let body = self.head.split_off(head_end);
                self.parse_head()?;
                if !matches!(self.state, State::Complete) {
                    self.consume_body(&body)?;
                }

                Ok(())
            }
            State::Body(..) => self.consume_body(data),
            State::Complete => Ok(()),
        }
    }

    /// Signals end of stream.
    ///
    /// Completes a close-delimited body; returns whether the message is
    /// complete. EOF in any other position is a connection-level failure,
    /// not a parse failure, so the caller decides what to do with `false`.
    pub fn on_eof(&mut self) -> bool {
        if let State::Body(Framing::UntilClose) = self.state {
            self.state = State::Complete;
        }

        self.is_complete()
    }

    fn parse_head(&mut self) -> Result<(), ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut headers);

        let parsed = resp.parse(&self.head)?;
        if !parsed.is_complete() {
            return Err(ParseError("truncated header block"));
        }

        self.status = resp.code.ok_or(ParseError("missing status code"))?;
        let http_11 = resp.version == Some(1);

        let mut content_length = None;
        let mut chunked = false;
        let mut close = false;
        let mut keep_alive = false;

        for header in resp.headers.iter() {
            if header.name.eq_ignore_ascii_case("content-length") {
                let v = core::str::from_utf8(header.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or(ParseError("invalid content-length"))?;
                content_length = Some(v);
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = contains_token(header.value, "chunked");
            } else if header.name.eq_ignore_ascii_case("connection") {
                close = contains_token(header.value, "close");
                keep_alive = contains_token(header.value, "keep-alive");
            } else if self.capture_cookies && header.name.eq_ignore_ascii_case("set-cookie") {
                self.cookies
                    .push(String::from_utf8_lossy(header.value).into_owned());
            }
        }

        self.server_close = close || (!http_11 && !keep_alive);

        self.state = if chunked {
            State::Body(Framing::Chunked(Chunk::Size { value: 0, seen: false }))
        } else if let Some(n) = content_length {
            if n == 0 {
                State::Complete
            } else {
                State::Body(Framing::Length(n))
            }
        } else if self.server_close {
            State::Body(Framing::UntilClose)
        } else {
            // A keep-alive response with neither a length nor chunked
            // framing carries no body.
            State::Complete
        };

        Ok(())
    }

    fn consume_body(&mut self, mut data: &[u8]) -> Result<(), ParseError> {
        let State::Body(framing) = &mut self.state else {
            return Ok(());
        };

        match framing {
            Framing::Length(remaining) => {
                let n = (*remaining).min(data.len() as u64);
                *remaining -= n;
                if *remaining == 0 {
                    self.state = State::Complete;
                }

                Ok(())
            }
            Framing::UntilClose => Ok(()),
            Framing::Chunked(chunk) => {
                while !data.is_empty() {
                    match chunk {
                        Chunk::Size { value, seen } => {
                            let b = data[0];
                            data = &data[1..];
                            match b {
                                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                                    let digit = hex_val(b) as u64;
                                    *value = value
                                        .checked_mul(16)
                                        .and_then(|v| v.checked_add(digit))
                                        .ok_or(ParseError("chunk size overflow"))?;
                                    *seen = true;
                                }
                                b';' if *seen => *chunk = Chunk::Ext { size: *value },
                                b'\r' if *seen => *chunk = Chunk::SizeLf { size: *value },
                                _ => return Err(ParseError("malformed chunk size")),
                            }
                        }
                        Chunk::Ext { size } => {
                            // Chunk extensions are ignored.
                            if let Some(pos) = data.iter().position(|&b| b == b'\r') {
                                data = &data[pos + 1..];
                                *chunk = Chunk::SizeLf { size: *size };
                            } else {
                                data = &[];
                            }
                        }
                        Chunk::SizeLf { size } => {
                            if data[0] != b'\n' {
                                return Err(ParseError("malformed chunk size line"));
                            }
                            data = &data[1..];
                            *chunk = if *size == 0 {
                                Chunk::Trailer { line_has_content: false }
                            } else {
                                Chunk::Data { remaining: *size }
                            };
                        }
                        Chunk::Data { remaining } => {
                            let n = (*remaining).min(data.len() as u64);
                            *remaining -= n;
                            data = &data[n as usize..];
                            if *remaining == 0 {
                                *chunk = Chunk::DataCr;
                            }
                        }
                        Chunk::DataCr => {
                            if data[0] != b'\r' {
                                return Err(ParseError("missing CR after chunk data"));
                            }
                            data = &data[1..];
                            *chunk = Chunk::DataLf;
                        }
                        Chunk::DataLf => {
                            if data[0] != b'\n' {
                                return Err(ParseError("missing LF after chunk data"));
                            }
                            data = &data[1..];
                            *chunk = Chunk::Size { value: 0, seen: false };
                        }
                        Chunk::Trailer { line_has_content } => {
                            let b = data[0];
                            data = &data[1..];
                            match b {
                                b'\n' => {
                                    if *line_has_content {
                                        *line_has_content = false;
                                    } else {
                                        self.state = State::Complete;
                                        return Ok(());
                                    }
                                }
                                b'\r' => {}
                                _ => *line_has_content = true,
                            }
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

fn contains_token(value: &[u8], token: &str) -> bool {
    let Ok(value) = core::str::from_utf8(value) else {
        return false;
    };

    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(p: &mut ResponseParser, data: &[u8]) {
        p.feed(data).unwrap();
    }

    #[test]
    fn content_length_body_across_splits() {
        let mut p = ResponseParser::new(false);

        feed_all(&mut p, b"HTTP/1.1 200 OK\r\nContent-Le");
        assert!(!p.is_complete());
        feed_all(&mut p, b"ngth: 5\r\n\r\nhel");
        assert!(!p.is_complete());
        assert_eq!(p.status(), 200);
        feed_all(&mut p, b"lo");

        assert!(p.is_complete());
        assert!(!p.server_close());
    }

    #[test]
    fn empty_body_completes_at_head_end() {
        let mut p = ResponseParser::new(false);
        feed_all(&mut p, b"HTTP/1.1 204 No Content\r\n\r\n");

        assert!(p.is_complete());
        assert_eq!(p.status(), 204);
    }

    #[test]
    fn keep_alive_without_length_has_no_body() {
        let mut p = ResponseParser::new(false);
        feed_all(&mut p, b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\n");

        assert!(p.is_complete());
    }

    #[test]
    fn chunked_body() {
        let mut p = ResponseParser::new(false);

        feed_all(
            &mut p,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(!p.is_complete());
        feed_all(&mut p, b"5\r\nhello\r\n3;ext=1\r\nxyz\r\n");
        assert!(!p.is_complete());
        feed_all(&mut p, b"0\r\n\r\n");

        assert!(p.is_complete());
    }

    #[test]
    fn chunked_trailers_are_skipped() {
        let mut p = ResponseParser::new(false);

        feed_all(
            &mut p,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        feed_all(&mut p, b"2\r\nok\r\n0\r\nX-Sum: abc\r\n\r\n");

        assert!(p.is_complete());
    }

    #[test]
    fn close_delimited_body_completes_on_eof() {
        let mut p = ResponseParser::new(false);

        feed_all(&mut p, b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nbody");
        assert!(!p.is_complete());
        assert!(p.server_close());

        assert!(p.on_eof());
        assert!(p.is_complete());
    }

    #[test]
    fn eof_inside_message_is_not_complete() {
        let mut p = ResponseParser::new(false);
        feed_all(&mut p, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");

        assert!(!p.on_eof());
    }

    #[test]
    fn http_10_defaults_to_close() {
        let mut p = ResponseParser::new(false);
        feed_all(&mut p, b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n");

        assert!(p.is_complete());
        assert!(p.server_close());
    }

    #[test]
    fn cookies_are_captured_only_when_enabled() {
        let resp =
            b"HTTP/1.1 200 OK\r\nSet-Cookie: sid=1\r\nSet-Cookie: b=2\r\nContent-Length: 0\r\n\r\n";

        let mut on = ResponseParser::new(true);
        feed_all(&mut on, resp);
        assert_eq!(on.take_cookies(), vec!["sid=1".to_string(), "b=2".to_string()]);

        let mut off = ResponseParser::new(false);
        feed_all(&mut off, resp);
        assert!(off.take_cookies().is_empty());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let mut p = ResponseParser::new(false);
        assert!(p.feed(b"\x00\x01\x02 not http\r\n\r\n").is_err());
    }

    #[test]
    fn error_status_is_reported() {
        let mut p = ResponseParser::new(false);
        feed_all(&mut p, b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");

        assert!(p.is_complete());
        assert_eq!(p.status(), 404);
    }

    #[test]
    fn reset_clears_message_state() {
        let mut p = ResponseParser::new(true);
        feed_all(
            &mut p,
            b"HTTP/1.1 500 Oops\r\nSet-Cookie: a=b\r\nConnection: close\r\n\r\n",
        );
        p.on_eof();
        assert!(p.is_complete());

        p.reset();
        assert!(!p.is_complete());
        assert_eq!(p.status(), 0);
        assert!(!p.server_close());
        assert!(p.take_cookies().is_empty());

        feed_all(&mut p, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert!(p.is_complete());
        assert_eq!(p.status(), 200);
    }

    #[test]
    fn bytes_after_completion_are_ignored() {
        let mut p = ResponseParser::new(false);
        feed_all(&mut p, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokEXTRA");

        assert!(p.is_complete());
    }
}
