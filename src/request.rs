use bytes::{BufMut, Bytes, BytesMut};

use crate::cfg::Scheme;

/// Send granularity the chunk size must stay divisible by.
pub const SNDBUF: usize = 1 << 15;
/// Maximum number of body bytes emitted in a single chunk.
pub const MAX_REQ_LEN: usize = 1 << 26;

// MAX_REQ_LEN must stay a power of two and a multiple of SNDBUF.
const _: () = assert!(MAX_REQ_LEN.is_power_of_two());
const _: () = assert!(MAX_REQ_LEN % SNDBUF == 0);

const CRLF: &str = "\r\n";
const USER_AGENT: &str = concat!("volley/", env!("CARGO_PKG_VERSION"));

/// Chunked transfer-encoding terminator.
pub const CHUNK_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Returns the number of hexadecimal digits needed to render `n`.
#[inline]
pub fn hex_digits(n: u64) -> usize {
    if n == 0 {
        1
    } else {
        (n.ilog2() / 4 + 1) as usize
    }
}

/// The request body described by the input file.
#[derive(Debug, Clone)]
pub enum BodySpec {
    /// Literal bytes, sent with a `Content-Length` header.
    Content(Bytes),
    /// `size` bytes of generator output, sent with chunked transfer encoding.
    Random(u64),
}

/// A pre-rendered HTTP/1.1 request.
///
/// The byte image is rendered once per template and shared by every client
/// instance cloned from it. `splice_at` is the offset of the blank line
/// terminating the header block, kept so a `Cookie` header can be inserted
/// without re-rendering the image.
#[derive(Debug, Clone)]
pub struct RequestImage {
    bytes: Bytes,
    splice_at: usize,
}

impl RequestImage {
    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Renders the image with a `Cookie` header spliced into the header
    /// block.
    pub fn with_cookies(&self, jar: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.bytes.len() + jar.len() + 10);
        buf.put_slice(&self.bytes[..self.splice_at]);
        buf.put_slice(b"Cookie: ");
        buf.put_slice(jar.as_bytes());
        buf.put_slice(CRLF.as_bytes());
        buf.put_slice(&self.bytes[self.splice_at..]);

        buf.freeze()
    }
}

/// Emission plan for a `random` body.
///
/// Bodies larger than [`MAX_REQ_LEN`] are split over multiple chunks of a
/// single HTTP message, every chunk drawing its payload from the same
/// preallocated generator buffer.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    body_size: u64,
    chunk_size: usize,
}

impl ChunkPlan {
    pub fn new(body_size: u64) -> Self {
        let chunk_size = body_size.min(MAX_REQ_LEN as u64) as usize;

        Self { body_size, chunk_size }
    }

    /// Length of the payload buffer backing every chunk.
    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.chunk_size
    }

    /// Payload sizes of the chunks forming one request body.
    pub fn chunks(&self) -> impl Iterator<Item = usize> + '_ {
        let full = (self.body_size / self.chunk_size as u64) as usize;
        let rem = (self.body_size % self.chunk_size as u64) as usize;

        (0..full)
            .map(move |_| self.chunk_size)
            .chain((rem > 0).then_some(rem))
    }

    /// Total framing bytes added by chunked transfer encoding: a length
    /// line and a trailing CRLF per chunk, plus the zero-length terminator.
    pub fn overhead_total(&self) -> u64 {
        let frames: u64 = self
            .chunks()
            .map(|c| (hex_digits(c as u64) + 2 * CRLF.len()) as u64)
            .sum();

        frames + CHUNK_TERMINATOR.len() as u64
    }
}

/// Renders the chunk length line for a payload of `len` bytes.
#[inline]
pub fn chunk_frame(len: usize) -> Vec<u8> {
    format!("{len:x}{CRLF}").into_bytes()
}

/// Builds the two byte images of a connection template: the keep-alive
/// variant and the `Connection: close` variant.
///
/// Configured headers are emitted verbatim, in file order. A `User-Agent`
/// and an `Accept` header are provided unless the file overrides them. For
/// `random` bodies the image ends after the header block; chunk framing and
/// payload are emitted at send time.
#[allow(clippy::too_many_arguments)]
pub fn build_images(
    scheme: Scheme,
    host: &str,
    port: u16,
    method: &str,
    path: &str,
    headers: &[(String, String)],
    body: Option<&BodySpec>,
) -> (RequestImage, RequestImage) {
    (
        render(scheme, host, port, method, path, headers, body, false),
        render(scheme, host, port, method, path, headers, body, true),
    )
}

#[allow(clippy::too_many_arguments)]
fn render(
    scheme: Scheme,
    host: &str,
    port: u16,
    method: &str,
    path: &str,
    headers: &[(String, String)],
    body: Option<&BodySpec>,
    cclose: bool,
) -> RequestImage {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(format!("{method} {path} HTTP/1.1{CRLF}").as_bytes());
    if port == scheme.default_port() {
        buf.put_slice(format!("Host: {host}{CRLF}").as_bytes());
    } else {
        buf.put_slice(format!("Host: {host}:{port}{CRLF}").as_bytes());
    }
    if cclose {
        buf.put_slice(format!("Connection: close{CRLF}").as_bytes());
    }

    for (name, value) in headers {
        buf.put_slice(format!("{name}: {value}{CRLF}").as_bytes());
    }
    if !has_header(headers, "user-agent") {
        buf.put_slice(format!("User-Agent: {USER_AGENT}{CRLF}").as_bytes());
    }
    if !has_header(headers, "accept") {
        buf.put_slice(format!("Accept: */*{CRLF}").as_bytes());
    }

    match body {
        Some(BodySpec::Content(content)) => {
            buf.put_slice(format!("Content-Length: {}{CRLF}", content.len()).as_bytes());
            let splice_at = buf.len();
            buf.put_slice(CRLF.as_bytes());
            buf.put_slice(content);

            RequestImage { bytes: buf.freeze(), splice_at }
        }
        Some(BodySpec::Random(..)) => {
            buf.put_slice(format!("Transfer-Encoding: chunked{CRLF}").as_bytes());
            let splice_at = buf.len();
            buf.put_slice(CRLF.as_bytes());

            RequestImage { bytes: buf.freeze(), splice_at }
        }
        None => {
            let splice_at = buf.len();
            buf.put_slice(CRLF.as_bytes());

            RequestImage { bytes: buf.freeze(), splice_at }
        }
    }
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_str(image: &RequestImage) -> String {
        String::from_utf8(image.bytes().to_vec()).unwrap()
    }

    #[test]
    fn minimal_get() {
        let (request, cclose) =
            build_images(Scheme::Http, "example.com", 80, "GET", "/", &[], None);

        let expected = format!(
            "GET / HTTP/1.1\r\nHost: example.com\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\n\r\n"
        );
        assert_eq!(image_str(&request), expected);
        assert!(image_str(&cclose).contains("Connection: close\r\n"));
    }

    #[test]
    fn host_port_is_omitted_only_for_scheme_default() {
        let (http_default, _) =
            build_images(Scheme::Http, "a", 80, "GET", "/", &[], None);
        let (https_default, _) =
            build_images(Scheme::Https, "a", 443, "GET", "/", &[], None);
        let (custom, _) = build_images(Scheme::Http, "a", 8080, "GET", "/", &[], None);

        assert!(image_str(&http_default).contains("Host: a\r\n"));
        assert!(image_str(&https_default).contains("Host: a\r\n"));
        assert!(image_str(&custom).contains("Host: a:8080\r\n"));
    }

    #[test]
    fn configured_headers_override_defaults() {
        let headers = vec![
            ("User-Agent".to_string(), "tester".to_string()),
            ("X-Run".to_string(), "1".to_string()),
        ];
        let (request, _) =
            build_images(Scheme::Http, "a", 80, "GET", "/", &headers, None);
        let s = image_str(&request);

        assert!(s.contains("User-Agent: tester\r\n"));
        assert!(!s.contains(USER_AGENT));
        assert!(s.contains("X-Run: 1\r\n"));
        assert!(s.contains("Accept: */*\r\n"));
    }

    #[test]
    fn content_body_carries_length() {
        let body = BodySpec::Content(Bytes::from_static(b"hello"));
        let (request, _) =
            build_images(Scheme::Http, "a", 80, "POST", "/submit", &[], Some(&body));
        let s = image_str(&request);

        assert!(s.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn random_body_is_chunked_and_not_embedded() {
        let body = BodySpec::Random(100_000);
        let (request, _) =
            build_images(Scheme::Http, "a", 80, "PUT", "/blob", &[], Some(&body));
        let s = image_str(&request);

        assert!(s.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn cookie_splice_lands_in_the_header_block() {
        let body = BodySpec::Content(Bytes::from_static(b"xy"));
        let (request, _) =
            build_images(Scheme::Http, "a", 80, "POST", "/", &[], Some(&body));

        let spliced = request.with_cookies("sid=1; theme=dark");
        let s = String::from_utf8(spliced.to_vec()).unwrap();

        assert!(s.contains("Cookie: sid=1; theme=dark\r\n\r\nxy"));
        // The body must still follow the single blank line.
        assert_eq!(s.matches("\r\n\r\n").count(), 1);
    }

    #[test]
    fn hex_digit_widths() {
        assert_eq!(hex_digits(0), 1);
        assert_eq!(hex_digits(0xf), 1);
        assert_eq!(hex_digits(0x10), 2);
        assert_eq!(hex_digits(0xffff), 4);
        assert_eq!(hex_digits(0x10000), 5);
        assert_eq!(hex_digits(u64::MAX), 16);
    }

    #[test]
    fn single_chunk_plan() {
        let plan = ChunkPlan::new(100_000);

        assert_eq!(plan.buffer_len(), 100_000);
        assert_eq!(plan.chunks().collect::<Vec<_>>(), vec![100_000]);
        // "186a0\r\n" + payload + "\r\n" + "0\r\n\r\n"
        assert_eq!(plan.overhead_total(), 5 + 2 + 2 + 5);
    }

    #[test]
    fn oversized_body_splits_into_chunks() {
        let size = MAX_REQ_LEN as u64 * 2 + 17;
        let plan = ChunkPlan::new(size);

        let chunks: Vec<_> = plan.chunks().collect();
        assert_eq!(chunks, vec![MAX_REQ_LEN, MAX_REQ_LEN, 17]);
        assert_eq!(chunks.iter().map(|&c| c as u64).sum::<u64>(), size);

        let frames: u64 = chunks
            .iter()
            .map(|&c| (hex_digits(c as u64) + 4) as u64)
            .sum();
        assert_eq!(plan.overhead_total(), frames + 5);
    }

    #[test]
    fn chunk_frame_renders_hex() {
        assert_eq!(chunk_frame(100_000), b"186a0\r\n".to_vec());
        assert_eq!(chunk_frame(15), b"f\r\n".to_vec());
    }
}
