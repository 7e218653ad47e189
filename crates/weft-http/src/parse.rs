//! Incremental HTTP/1.x message parser.
//!
//! Feed it whatever has been buffered; it answers "malformed", "need
//! more bytes", or a decoded view plus the header-block length. Parsing
//! the same buffer with more bytes appended yields the same message
//! (prefix stability), which is what lets the connection driver re-parse
//! on every read.

use weft::HttpMsg;
use weft_utils::bstr;

pub enum Parsed<'a> {
    Malformed,
    /// Headers not complete yet.
    Partial,
    /// Decoded message and the byte length of the header block.
    Complete(HttpMsg<'a>, usize),
}

/// Declared body length of a parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLen {
    Known(u64),
    Chunked,
    /// Response without a length: body runs until the peer closes.
    UntilClose,
    /// PUT/POST request without any length information.
    Missing,
    /// Transfer-Encoding present but not chunked.
    BadEncoding,
}

/// Locates the end of the header block: `\r\n\r\n` or `\n\n`.
/// Returns the length including the terminator.
fn head_len(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'\n' => {
                if buf.get(i + 1) == Some(&b'\n') {
                    return Some(i + 2);
                }
                if buf.get(i + 1) == Some(&b'\r') && buf.get(i + 2) == Some(&b'\n') {
                    return Some(i + 3);
                }
            }
            // Bare control bytes do not belong in a header block
            b if b < b' ' && b != b'\r' && b != b'\t' => return None,
            _ => {}
        }
        i += 1;
    }
    Some(0) // incomplete
}

/// Advances over one UTF-8 codepoint, validating continuation bytes.
/// The request line is scanned this way so multi-byte URIs survive.
fn utf8_step(buf: &[u8], i: usize) -> Option<usize> {
    let b = *buf.get(i)?;
    let need = match b {
        0x00..=0x7f => return Some(i + 1),
        0xc0..=0xdf => 1,
        0xe0..=0xef => 2,
        0xf0..=0xf7 => 3,
        _ => return None,
    };
    for k in 1..=need {
        match buf.get(i + k) {
            Some(0x80..=0xbf) => {}
            _ => return None,
        }
    }
    Some(i + 1 + need)
}

/// Scans a token up to `stop`, UTF-8 aware. Returns (token, next index
/// past the stop byte).
fn token(buf: &[u8], start: usize, stop: u8) -> Option<(&[u8], usize)> {
    let mut i = start;
    while i < buf.len() && buf[i] != stop {
        if buf[i] == b'\r' || buf[i] == b'\n' {
            return None;
        }
        i = utf8_step(buf, i)?;
    }
    if i >= buf.len() || i == start {
        return None;
    }
    Some((&buf[start..i], i + 1))
}

pub fn parse(buf: &[u8]) -> Parsed<'_> {
    let n = match head_len(buf) {
        None => return Parsed::Malformed,
        Some(0) => return Parsed::Partial,
        Some(n) => n,
    };
    let head = &buf[..n];
    // Request line: METHOD SP URI SP PROTO CRLF
    let Some((method, i)) = token(head, 0, b' ') else { return Parsed::Malformed };
    let Some((target, i)) = token(head, i, b' ') else { return Parsed::Malformed };
    let line_end = match bstr::find(&head[i..], b"\n") {
        Some(k) => i + k,
        None => return Parsed::Malformed,
    };
    let line = &head[i..line_end];
    let proto = bstr::trim(line.strip_suffix(b"\r").unwrap_or(line));
    if proto.is_empty() {
        return Parsed::Malformed;
    }
    let (uri, query) = match target.iter().position(|b| *b == b'?') {
        Some(q) => (&target[..q], &target[q + 1..]),
        None => (target, &b""[..]),
    };
    let mut hm = HttpMsg {
        method,
        uri,
        query,
        proto,
        headers: weft_utils::ArrayVec::new(),
        body: &buf[n..],
        head,
        message: buf,
    };
    // Header lines until the blank terminator
    let mut pos = line_end + 1;
    while pos < n {
        let rest = &head[pos..];
        if rest.starts_with(b"\r\n") || rest.starts_with(b"\n") {
            break;
        }
        let Some(eol) = bstr::find(rest, b"\n") else { return Parsed::Malformed };
        let line = &rest[..eol];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|b| *b == b':') else { return Parsed::Malformed };
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|b| *b <= b' ') {
            return Parsed::Malformed;
        }
        let value = bstr::trim(&line[colon + 1..]);
        if hm.headers.try_push((name, value)).is_some() {
            return Parsed::Malformed; // header table overflow
        }
        pos += eol + 1;
    }
    // Responses clip the buffered body below; real length comes from
    // body_len()
    if let BodyLen::Known(len) = body_len(&hm) {
        let have = (buf.len() - n).min(len as usize);
        hm.body = &buf[n..n + have];
        hm.message = &buf[..n + have];
    }
    Parsed::Complete(hm, n)
}

/// True when the message is a response (status line instead of request
/// line; the status token rides in `uri`).
pub fn is_response(hm: &HttpMsg<'_>) -> bool {
    hm.method.starts_with(b"HTTP/")
}

/// Body length rules: Content-Length, then chunked, then per-kind
/// defaults (responses run to close, requests default to zero except
/// PUT/POST which must declare one).
pub fn body_len(hm: &HttpMsg<'_>) -> BodyLen {
    if let Some(cl) = hm.header("Content-Length") {
        return match bstr::parse_dec(bstr::trim(cl), 15) {
            Some(v) => BodyLen::Known(v),
            None => BodyLen::BadEncoding,
        };
    }
    if let Some(te) = hm.header("Transfer-Encoding") {
        return if bstr::eq_ignore_case(bstr::trim(te), b"chunked") {
            BodyLen::Chunked
        } else {
            BodyLen::BadEncoding
        };
    }
    if is_response(hm) {
        let status = hm.status();
        if status < 200 || status == 204 || status == 304 {
            BodyLen::Known(0)
        } else {
            BodyLen::UntilClose
        }
    } else if bstr::eq_ignore_case(hm.method, b"POST") || bstr::eq_ignore_case(hm.method, b"PUT") {
        BodyLen::Missing
    } else {
        BodyLen::Known(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn complete(buf: &[u8]) -> (HttpMsg<'_>, usize) {
        match parse(buf) {
            Parsed::Complete(hm, n) => (hm, n),
            Parsed::Partial => panic!("partial"),
            Parsed::Malformed => panic!("malformed"),
        }
    }

    #[test]
    fn simple_get() {
        let (hm, n) = complete(b"GET /x HTTP/1.0\r\nHost: h\r\n\r\n");
        assert_eq!(hm.method, b"GET");
        assert_eq!(hm.uri, b"/x");
        assert_eq!(hm.query, b"");
        assert_eq!(hm.proto, b"HTTP/1.0");
        assert_eq!(hm.header("host"), Some(&b"h"[..]));
        assert_eq!(n, 28);
        assert_eq!(body_len(&hm), BodyLen::Known(0));
    }

    #[test]
    fn tri_state() {
        assert!(matches!(parse(b"GET / HTTP/1.1\r\nHo"), Parsed::Partial));
        assert!(matches!(parse(b"\x00\x01"), Parsed::Malformed));
        assert!(matches!(parse(b"GET / HTTP/1.1\r\n\r\n"), Parsed::Complete(..)));
    }

    #[test]
    fn prefix_stability() {
        let full = b"POST /u?k=v HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyEXTRA";
        let (a, na) = complete(&full[..47 + 4]);
        let (b, nb) = complete(full);
        assert_eq!(na, nb);
        assert_eq!(a.method, b.method);
        assert_eq!(a.uri, b.uri);
        assert_eq!(a.query, b"k=v");
        assert_eq!(a.body, b"body");
        assert_eq!(b.body, b"body"); // clipped to Content-Length
    }

    #[test]
    fn header_values_trimmed() {
        let (hm, _) = complete(b"GET / HTTP/1.1\r\nX-Pad:   spaced out  \r\n\r\n");
        assert_eq!(hm.header("X-Pad"), Some(&b"spaced out"[..]));
    }

    #[test]
    fn header_cap_is_forty() {
        let mut buf = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..40 {
            buf.extend_from_slice(format!("H{i}: v\r\n").as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        assert!(matches!(parse(&buf), Parsed::Complete(..)));
        let mut over = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..41 {
            over.extend_from_slice(format!("H{i}: v\r\n").as_bytes());
        }
        over.extend_from_slice(b"\r\n");
        assert!(matches!(parse(&over), Parsed::Malformed));
    }

    #[test]
    fn utf8_uri_accepted_bad_continuation_rejected() {
        assert!(matches!(parse("GET /caf\u{e9} HTTP/1.1\r\n\r\n".as_bytes()), Parsed::Complete(..)));
        assert!(matches!(parse(b"GET /\xc3\x28 HTTP/1.1\r\n\r\n"), Parsed::Malformed));
    }

    #[test]
    fn response_status_and_lengths() {
        let (hm, _) = complete(b"HTTP/1.1 204 No Content\r\n\r\n");
        assert!(is_response(&hm));
        assert_eq!(hm.status(), 204);
        assert_eq!(body_len(&hm), BodyLen::Known(0));

        let (hm, _) = complete(b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(body_len(&hm), BodyLen::UntilClose);

        let (hm, _) = complete(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(body_len(&hm), BodyLen::Chunked);

        let (hm, _) = complete(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\n");
        assert_eq!(body_len(&hm), BodyLen::BadEncoding);
    }

    #[test]
    fn put_without_length_is_missing() {
        let (hm, _) = complete(b"PUT /f HTTP/1.1\r\n\r\n");
        assert_eq!(body_len(&hm), BodyLen::Missing);
        let (hm, _) = complete(b"GET /f HTTP/1.1\r\n\r\n");
        assert_eq!(body_len(&hm), BodyLen::Known(0));
    }

    #[test]
    fn overflowing_content_length_rejected() {
        let (hm, _) = complete(b"GET / HTTP/1.1\r\nContent-Length: 99999999999999999999\r\n\r\n");
        assert_eq!(body_len(&hm), BodyLen::BadEncoding);
    }
}
