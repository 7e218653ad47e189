//! Response helpers and static file serving.

use std::fmt::Write as _;

use tracing::debug;
use weft::{Connection, Flags, HttpMsg, Manager, url_decode};
use weft_utils::bstr;

use crate::{
    fs::{Fs, FsFile, FsKind},
    query_var,
};

pub fn status_text(code: u32) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

/// Sends a complete response with `Content-Length`. `extra_headers` is
/// zero or more CRLF-terminated header lines. Clears the response gate
/// so the next pipelined request decodes.
pub fn reply(c: &mut Connection, code: u32, extra_headers: &str, body: &[u8]) {
    c.send_fmt(format_args!(
        "HTTP/1.1 {} {}\r\n{}Content-Length: {}\r\n\r\n",
        code,
        status_text(code),
        extra_headers,
        body.len()
    ));
    c.send(body);
    c.flags.remove(Flags::RESP);
}

/// Formatted variant of [`reply`].
pub fn reply_fmt(c: &mut Connection, code: u32, extra_headers: &str, args: std::fmt::Arguments<'_>) {
    let mut body = String::new();
    let _ = body.write_fmt(args);
    reply(c, code, extra_headers, body.as_bytes());
}

/// Static serving options.
#[derive(Default, Clone)]
pub struct ServeOpts {
    pub root_dir: String,
    /// Extra CRLF-terminated header lines for every response.
    pub extra_headers: String,
    /// Glob-free suffix match for SSI processing (e.g. `.shtml`).
    pub ssi_suffix: String,
    pub dir_listing: bool,
}

/// File being streamed to a connection; lives in the connection's
/// protocol scratch slot and is pumped by the HTTP driver.
pub(crate) struct Serving {
    pub file: Box<dyn FsFile>,
    pub remaining: u64,
}

const MAX_PATH: usize = 1024;
const SSI_DEPTH: usize = 5;

fn mime_type(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "html" | "htm" | "shtml" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

/// Resolves the request URI under `root_dir`, refusing traversal.
fn resolve_path(hm: &HttpMsg<'_>, opts: &ServeOpts) -> Result<String, &'static str> {
    let uri = url_decode(hm.uri, false).ok_or("Invalid path")?;
    let uri = std::str::from_utf8(&uri).map_err(|_| "Invalid path")?;
    if uri.split('/').any(|seg| seg == "..") {
        return Err("Invalid path");
    }
    let mut path = opts.root_dir.clone();
    if !uri.starts_with('/') {
        path.push('/');
    }
    path.push_str(uri);
    if path.len() > MAX_PATH {
        return Err("Exceeded path size");
    }
    Ok(path)
}

/// Serves a filesystem subtree: ETag/304, ranges, gzip variants, index
/// fallbacks, SSI and optional directory listings.
pub fn serve_dir(
    mgr: &mut Manager,
    c: &mut Connection,
    hm: &HttpMsg<'_>,
    fs: &dyn Fs,
    opts: &ServeOpts,
) {
    let path = match resolve_path(hm, opts) {
        Ok(p) => p,
        Err(e) => {
            debug!(id = c.id, "{e}");
            reply(c, 400, &opts.extra_headers, e.as_bytes());
            return;
        }
    };
    let stat = fs.stat(&path);
    if let Some((kind, ..)) = stat
        && kind.contains(FsKind::DIR)
    {
        for index in ["index.html", "index.shtml", "index.html.gz"] {
            let candidate = format!("{}/{index}", path.trim_end_matches('/'));
            if fs.stat(&candidate).is_some() {
                serve_file(mgr, c, hm, fs, &candidate, opts);
                return;
            }
        }
        if opts.dir_listing {
            dir_listing(c, hm, fs, &path, opts);
        } else {
            reply(c, 403, &opts.extra_headers, b"Forbidden");
        }
        return;
    }
    serve_file(mgr, c, hm, fs, &path, opts);
}

/// Serves one file: `.gz` sibling when the client accepts gzip,
/// `"mtime.size"` ETag with If-None-Match, byte ranges, SSI expansion.
pub fn serve_file(
    _mgr: &mut Manager,
    c: &mut Connection,
    hm: &HttpMsg<'_>,
    fs: &dyn Fs,
    path: &str,
    opts: &ServeOpts,
) {
    let mut path = path.to_string();
    let mut encoding = "";
    let accepts_gzip = hm
        .header("Accept-Encoding")
        .is_some_and(|v| bstr::find(&v.to_ascii_lowercase(), b"gzip").is_some());
    if accepts_gzip && !path.ends_with(".gz") {
        let gz = format!("{path}.gz");
        if fs.stat(&gz).is_some() {
            path = gz;
            encoding = "Content-Encoding: gzip\r\n";
        }
    }
    let Some((kind, size, mtime)) = fs.stat(&path) else {
        reply(c, 404, &opts.extra_headers, b"Not found");
        return;
    };
    if !kind.contains(FsKind::READ) || kind.contains(FsKind::DIR) {
        reply(c, 403, &opts.extra_headers, b"Forbidden");
        return;
    }
    if !opts.ssi_suffix.is_empty() && path.ends_with(&opts.ssi_suffix) {
        serve_ssi(c, fs, &path, opts);
        return;
    }
    let etag = format!("\"{mtime}.{size}\"");
    if hm.header("If-None-Match").is_some_and(|v| bstr::trim(v) == etag.as_bytes()) {
        c.send_fmt(format_args!("HTTP/1.1 304 Not Modified\r\n{}Content-Length: 0\r\n\r\n", opts.extra_headers));
        c.flags.remove(Flags::RESP);
        return;
    }
    // Range: bytes=a-b (single range only)
    let mut offset = 0u64;
    let mut length = size;
    let mut status = 200;
    let mut range_hdr = String::new();
    if let Some(r) = hm.header("Range") {
        match parse_range(r, size) {
            Some((a, b)) => {
                offset = a;
                length = b - a + 1;
                status = 206;
                let _ = write!(range_hdr, "Content-Range: bytes {a}-{b}/{size}\r\n");
            }
            None => {
                reply(c, 416, &opts.extra_headers, b"");
                return;
            }
        }
    }
    let Some(mut file) = fs.open(&path, false) else {
        reply(c, 404, &opts.extra_headers, b"Not found");
        return;
    };
    if offset > 0 && file.seek(offset).is_err() {
        reply(c, 500, &opts.extra_headers, b"seek");
        return;
    }
    c.send_fmt(format_args!(
        "HTTP/1.1 {} {}\r\n{}{}{}Content-Type: {}\r\nEtag: {}\r\nContent-Length: {}\r\n\r\n",
        status,
        status_text(status),
        opts.extra_headers,
        encoding,
        range_hdr,
        mime_type(&path),
        etag,
        length,
    ));
    c.flags.remove(Flags::RESP);
    // Body streams from the scratch slot as the send buffer drains
    c.scratch = Some(Box::new(Serving { file, remaining: length }));
}

/// `Range: bytes=a-b` to an inclusive byte span, `None` if
/// unsatisfiable.
fn parse_range(v: &[u8], size: u64) -> Option<(u64, u64)> {
    let v = bstr::trim(v);
    let spec = v.strip_prefix(b"bytes=")?;
    let dash = spec.iter().position(|b| *b == b'-')?;
    let (a, b) = (bstr::trim(&spec[..dash]), bstr::trim(&spec[dash + 1..]));
    if a.is_empty() {
        // suffix form: last N bytes
        let n = bstr::parse_dec(b, 15)?;
        if n == 0 || size == 0 {
            return None;
        }
        let n = n.min(size);
        return Some((size - n, size - 1));
    }
    let start = bstr::parse_dec(a, 15)?;
    let end = if b.is_empty() { size.checked_sub(1)? } else { bstr::parse_dec(b, 15)?.min(size.saturating_sub(1)) };
    if start > end || start >= size {
        return None;
    }
    Some((start, end))
}

/// Expands `<!--#include file=...-->` and `virtual=...` directives,
/// bounded to [`SSI_DEPTH`] nested includes.
fn serve_ssi(c: &mut Connection, fs: &dyn Fs, path: &str, opts: &ServeOpts) {
    let mut out = Vec::new();
    expand_ssi(fs, path, &opts.root_dir, 0, &mut out);
    let mut hdrs = String::from("Content-Type: text/html; charset=utf-8\r\n");
    hdrs.push_str(&opts.extra_headers);
    reply(c, 200, &hdrs, &out);
}

fn expand_ssi(fs: &dyn Fs, path: &str, root: &str, depth: usize, out: &mut Vec<u8>) {
    if depth > SSI_DEPTH {
        return;
    }
    let Some(mut file) = fs.open(path, false) else { return };
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    while let Ok(n) = file.read(&mut buf) {
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    let mut pos = 0;
    while let Some(start) = bstr::find(&data[pos..], b"<!--#include ") {
        let start = pos + start;
        out.extend_from_slice(&data[pos..start]);
        let Some(end) = bstr::find(&data[start..], b"-->") else {
            pos = start;
            break;
        };
        let directive = &data[start + 13..start + end];
        let include = if let Some(f) = directive.strip_prefix(b"file=") {
            // Relative to the including file's directory
            let name = trim_quotes(f);
            let dir = path.rsplit_once('/').map_or(".", |(d, _)| d);
            Some(format!("{dir}/{}", String::from_utf8_lossy(name)))
        } else if let Some(v) = directive.strip_prefix(b"virtual=") {
            // Relative to the server root
            let name = trim_quotes(v);
            Some(format!("{root}/{}", String::from_utf8_lossy(name)))
        } else {
            None
        };
        if let Some(inc) = include {
            expand_ssi(fs, &inc, root, depth + 1, out);
        }
        pos = start + end + 3;
    }
    out.extend_from_slice(&data[pos..]);
}

fn trim_quotes(v: &[u8]) -> &[u8] {
    let v = bstr::trim(v);
    v.strip_prefix(b"\"")
        .and_then(|v| v.strip_suffix(b"\""))
        .unwrap_or(v)
}

/// HTML directory listing with a client-side sortable table.
fn dir_listing(c: &mut Connection, hm: &HttpMsg<'_>, fs: &dyn Fs, path: &str, opts: &ServeOpts) {
    let uri = String::from_utf8_lossy(hm.uri).to_string();
    let mut rows = String::new();
    fs.list(path, &mut |name| {
        let full = format!("{}/{name}", path.trim_end_matches('/'));
        let (size, mtime, slash) = match fs.stat(&full) {
            Some((k, s, t)) if k.contains(FsKind::DIR) => (s, t, "/"),
            Some((_, s, t)) => (s, t, ""),
            None => (0, 0, ""),
        };
        let _ = write!(
            rows,
            "<tr><td><a href=\"{name}{slash}\">{name}{slash}</a></td>\
             <td data-s=\"{mtime}\">{mtime}</td><td data-s=\"{size}\">{size}</td></tr>\n"
        );
    });
    let body = format!(
        "<!DOCTYPE html><html><head><title>Index of {uri}</title>\
         <script>function srt(t,c){{var b=t.tBodies[0],r=[...b.rows];\
         r.sort((x,y)=>(+x.cells[c].dataset.s||x.cells[c].innerText)<\
         (+y.cells[c].dataset.s||y.cells[c].innerText)?-1:1);\
         r.forEach(e=>b.appendChild(e));}}</script></head>\
         <body><h1>Index of {uri}</h1><table id=t border=0>\
         <thead><tr><th onclick=\"srt(t,0)\">Name</th>\
         <th onclick=\"srt(t,1)\">Modified</th>\
         <th onclick=\"srt(t,2)\">Size</th></tr></thead>\
         <tbody>{rows}</tbody></table></body></html>"
    );
    let mut hdrs = String::from("Content-Type: text/html; charset=utf-8\r\n");
    hdrs.push_str(&opts.extra_headers);
    reply(c, 200, &hdrs, body.as_bytes());
}

/// Chunked file upload receiver: `POST /upload?offset=N&file=NAME`
/// appends the request body at `offset` under `dir`.
pub fn upload(c: &mut Connection, hm: &HttpMsg<'_>, fs: &dyn Fs, dir: &str) {
    let Some(name) = query_var(hm.query, "file").filter(|v| !v.is_empty()) else {
        reply(c, 400, "", b"file required");
        return;
    };
    let Some(offset) = query_var(hm.query, "offset").and_then(|v| bstr::parse_dec(v, 15)) else {
        reply(c, 400, "", b"offset required");
        return;
    };
    let Ok(name) = std::str::from_utf8(name) else {
        reply(c, 400, "", b"Invalid path");
        return;
    };
    if name.contains('/') || name.contains("..") || name.contains('\\') {
        reply(c, 400, "", b"Invalid path");
        return;
    }
    let path = format!("{dir}/{name}");
    if path.len() > MAX_PATH {
        reply(c, 400, "", b"Exceeded path size");
        return;
    }
    if offset == 0 {
        fs.remove(&path);
    }
    let Some(mut f) = fs.open(&path, true) else {
        reply(c, 400, "", format!("open({path})").as_bytes());
        return;
    };
    if f.seek(offset).is_err() || f.write(hm.body).is_err() {
        reply(c, 500, "", b"write error");
        return;
    }
    reply_fmt(c, 200, "", format_args!("{} bytes written\n", hm.body.len()));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ranges() {
        assert_eq!(parse_range(b"bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range(b"bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range(b"bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse_range(b"bytes=5-100", 10), Some((5, 9)));
        assert_eq!(parse_range(b"bytes=12-", 10), None);
        assert_eq!(parse_range(b"chars=1-2", 10), None);
    }

    #[test]
    fn mime_guesses() {
        assert_eq!(mime_type("/a/b.html"), "text/html; charset=utf-8");
        assert_eq!(mime_type("x.css"), "text/css");
        assert_eq!(mime_type("noext"), "application/octet-stream");
    }
}
