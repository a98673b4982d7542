//! Reformats an HTTP payload for human-readable capture output (spec.md
//! §4.2 step 4): de-chunks a `Transfer-Encoding: chunked` body and decodes a
//! `Content-Encoding: gzip`/`deflate` body, updating headers to match.
//! Returns `None` when the payload can't be safely reformatted, matching the
//! "if that fails, skip" rule — the caller drops the message rather than
//! forwarding a body that no longer matches its headers.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder};

use crate::proto::{header, set_header};

pub fn prettify_http(payload: &[u8]) -> Option<Vec<u8>> {
    let mut current = payload.to_vec();

    if header(&current, b"Transfer-Encoding").eq_ignore_ascii_case(b"chunked") {
        let (head, body) = split_head_body(&current)?;
        let dechunked = dechunk(body)?;
        current = set_header(head, b"Transfer-Encoding", b"identity");
        current = append_body(&current, &dechunked);
    }

    let encoding = header(&current, b"Content-Encoding").to_ascii_lowercase();
    if !encoding.is_empty() {
        let (head, body) = split_head_body(&current)?;
        let decoded = decode_body(&encoding, body)?;
        current = set_header(head, b"Content-Encoding", b"identity");
        current = append_body(&current, &decoded);
    }

    Some(current)
}

fn split_head_body(payload: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(idx) = find_subslice(payload, b"\r\n\r\n") {
        return Some((&payload[..idx + 4], &payload[idx + 4..]));
    }
    find_subslice(payload, b"\n\n").map(|idx| (&payload[..idx + 2], &payload[idx + 2..]))
}

fn append_body(head_with_stale_body: &[u8], new_body: &[u8]) -> Vec<u8> {
    let head = split_head_body(head_with_stale_body)
        .map(|(h, _)| h)
        .unwrap_or(head_with_stale_body);
    let mut out = Vec::with_capacity(head.len() + new_body.len());
    out.extend_from_slice(head);
    out.extend_from_slice(new_body);
    out
}

fn dechunk(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut rest = body;
    loop {
        let line_end = find_subslice(rest, b"\r\n")?;
        let size_line = std::str::from_utf8(&rest[..line_end]).ok()?;
        let size_str = size_line.split(';').next().unwrap_or(size_line).trim();
        let size = usize::from_str_radix(size_str, 16).ok()?;
        rest = rest.get(line_end + 2..)?;
        if size == 0 {
            return Some(out);
        }
        out.extend_from_slice(rest.get(..size)?);
        rest = rest.get(size + 2..)?;
    }
}

fn decode_body(encoding: &[u8], body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        b"gzip" => GzDecoder::new(body).read_to_end(&mut out).ok()?,
        b"deflate" => DeflateDecoder::new(body).read_to_end(&mut out).ok()?,
        _ => return None,
    };
    Some(out)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dechunks_a_chunked_body() {
        let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n";
        let out = prettify_http(req).unwrap();
        assert!(out.windows(4).any(|w| w == b"Wiki"));
        assert_eq!(header(&out, b"Transfer-Encoding"), b"identity");
    }

    #[test]
    fn leaves_plain_payload_untouched_in_shape() {
        let req = b"GET / HTTP/1.1\r\n\r\n";
        let out = prettify_http(req).unwrap();
        assert_eq!(out, req);
    }

    #[test]
    fn malformed_chunk_size_fails_cleanly() {
        let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert!(prettify_http(req).is_none());
    }
}
