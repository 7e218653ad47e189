//! `multipart/form-data` body walker.

use weft_utils::bstr;

/// One decoded form part.
#[derive(Default, Clone, Copy)]
pub struct Part<'a> {
    pub name: &'a [u8],
    pub filename: &'a [u8],
    pub body: &'a [u8],
}

/// Walks `--boundary`-delimited parts. Call with `offset = 0` first,
/// then with each returned offset; 0 means no further part.
///
/// The scan is a plain subslice search per part; fine for form posts,
/// quadratic for adversarial megabyte uploads.
pub fn next_multipart<'a>(body: &'a [u8], offset: usize, part: &mut Part<'a>) -> usize {
    let rest = body.get(offset..).unwrap_or(b"");
    // Find the boundary line this part starts with
    if !rest.starts_with(b"--") {
        return 0;
    }
    let Some(bend) = bstr::find(rest, b"\r\n") else { return 0 };
    let boundary = &rest[..bend];
    if boundary.len() < 3 {
        return 0;
    }
    let head_start = bend + 2;
    let Some(hend) = bstr::find(&rest[head_start..], b"\r\n\r\n") else { return 0 };
    let head = &rest[head_start..head_start + hend];
    let body_start = head_start + hend + 4;
    // Part body runs to the next boundary line
    let mut delim = Vec::with_capacity(boundary.len() + 2);
    delim.extend_from_slice(b"\r\n");
    delim.extend_from_slice(boundary);
    let Some(blen) = bstr::find(&rest[body_start..], &delim) else { return 0 };
    part.body = &rest[body_start..body_start + blen];
    part.name = b"";
    part.filename = b"";
    for line in head.split(|b| *b == b'\n') {
        let line = bstr::trim(line.strip_suffix(b"\r").unwrap_or(line));
        if !bstr::eq_ignore_case(line.get(..20).unwrap_or(b""), b"content-disposition:") {
            continue;
        }
        if let Some(v) = attr(line, b"name=") {
            part.name = v;
        }
        if let Some(v) = attr(line, b"filename=") {
            part.filename = v;
        }
    }
    // Next call resumes at the boundary we stopped on
    offset + body_start + blen + 2
}

/// Extracts a quoted attribute value like `name="f"`.
fn attr<'a>(line: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let at = bstr::find(line, key)?;
    let rest = &line[at + key.len()..];
    let rest = rest.strip_prefix(b"\"")?;
    let end = rest.iter().position(|b| *b == b'"')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod test {
    use super::*;

    const BODY: &[u8] = b"--xyz\r\n\
Content-Disposition: form-data; name=\"a\"\r\n\r\n\
hello\r\n\
--xyz\r\n\
Content-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
file data\r\n\
--xyz--\r\n";

    #[test]
    fn walks_both_parts() {
        let mut part = Part::default();
        let o1 = next_multipart(BODY, 0, &mut part);
        assert!(o1 > 0);
        assert_eq!(part.name, b"a");
        assert_eq!(part.filename, b"");
        assert_eq!(part.body, b"hello");

        let o2 = next_multipart(BODY, o1, &mut part);
        assert!(o2 > 0);
        assert_eq!(part.name, b"f");
        assert_eq!(part.filename, b"x.txt");
        assert_eq!(part.body, b"file data");

        assert_eq!(next_multipart(BODY, o2, &mut part), 0);
    }

    #[test]
    fn garbage_returns_zero() {
        let mut part = Part::default();
        assert_eq!(next_multipart(b"not multipart", 0, &mut part), 0);
        assert_eq!(next_multipart(b"", 0, &mut part), 0);
    }
}
