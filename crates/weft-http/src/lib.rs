//! HTTP/1.x and WebSocket on top of the connection manager: a streaming
//! zero-alloc parser, request/response helpers, static file serving over
//! a pluggable filesystem, multipart and upload helpers, and the RFC
//! 6455 frame codec.

mod fs;
mod multipart;
mod parse;
mod proto;
mod serve;
pub mod ws;

pub use fs::{Fs, FsFile, FsKind, StdFs};
pub use multipart::{Part, next_multipart};
pub use parse::{BodyLen, Parsed, body_len, parse};
pub use proto::{HttpProto, connect, listen};
pub use serve::{ServeOpts, reply, reply_fmt, serve_dir, serve_file, status_text, upload};

use weft::HttpMsg;
use weft_utils::bstr;

/// Value of `name` in a query string or form body (`a=1&b=2`).
pub fn query_var<'a>(query: &'a [u8], name: &str) -> Option<&'a [u8]> {
    for pair in query.split(|b| *b == b'&') {
        let mut it = pair.splitn(2, |b| *b == b'=');
        let k = it.next()?;
        if bstr::eq_ignore_case(k, name.as_bytes()) {
            return Some(it.next().unwrap_or(b""));
        }
    }
    None
}

/// Basic-auth credentials from the `Authorization` header, falling back
/// to `user:pass` URL userinfo conventions passed as a header.
pub fn creds(hm: &HttpMsg<'_>) -> Option<(String, String)> {
    let auth = hm.header("Authorization")?;
    let auth = bstr::trim(auth);
    let rest = auth.strip_prefix(b"Basic ")?;
    let decoded = {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.decode(bstr::trim(rest)).ok()?
    };
    let s = String::from_utf8(decoded).ok()?;
    let (u, p) = s.split_once(':')?;
    Some((u.to_string(), p.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_lookup() {
        assert_eq!(query_var(b"a=1&b=two&c=", "b"), Some(&b"two"[..]));
        assert_eq!(query_var(b"a=1&b=two&c=", "c"), Some(&b""[..]));
        assert_eq!(query_var(b"a=1", "z"), None);
    }
}
