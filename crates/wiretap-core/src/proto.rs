//! Framing and raw-byte HTTP helpers (spec.md §4.1).
//!
//! These work directly on byte slices without parsing into structs, to avoid
//! allocation in the hot path. Mutating helpers (`set_header`, `set_path`,
//! ...) return a freshly built `Vec<u8>` since HTTP payloads are
//! variable-length once a header or path changes.

use crate::message::PayloadType;

/// Formats a meta header: `<type> <uuid_hex> <ts_ns> <lat_ns>\n`.
pub fn payload_header(kind: PayloadType, uuid_hex: &[u8], ts_ns: i64, latency_ns: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(uuid_hex.len() + 24);
    out.push(kind.as_byte());
    out.push(b' ');
    out.extend_from_slice(uuid_hex);
    out.push(b' ');
    out.extend_from_slice(ts_ns.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(latency_ns.to_string().as_bytes());
    out.push(b'\n');
    out
}

/// Splits a meta header on spaces, stripping the trailing newline.
pub fn payload_meta(meta: &[u8]) -> Vec<&[u8]> {
    let trimmed = meta.strip_suffix(b"\n").unwrap_or(meta);
    trimmed.split(|&b| b == b' ').collect()
}

/// Splits a full frame (`meta\ndata`) into its two parts.
pub fn payload_meta_with_body(frame: &[u8]) -> (&[u8], &[u8]) {
    match frame.iter().position(|&b| b == b'\n') {
        Some(idx) => (&frame[..=idx], &frame[idx + 1..]),
        None => (frame, &[]),
    }
}

pub fn payload_id<'a>(meta: &'a [u8]) -> &'a [u8] {
    let fields = payload_meta(meta);
    fields.get(1).copied().unwrap_or(&[])
}

pub fn payload_type(meta: &[u8]) -> Option<PayloadType> {
    payload_meta(meta).first().and_then(|f| f.first()).copied().and_then(PayloadType::from_byte)
}

pub fn is_request_payload(meta: &[u8]) -> bool {
    payload_type(meta) == Some(PayloadType::Request)
}

pub fn is_response_payload(meta: &[u8]) -> bool {
    payload_type(meta) == Some(PayloadType::Response)
}

pub fn is_replayed_response_payload(meta: &[u8]) -> bool {
    payload_type(meta) == Some(PayloadType::ReplayedResponse)
}

/// Request or response captured live — excludes replayed responses.
pub fn is_origin_payload(meta: &[u8]) -> bool {
    matches!(
        payload_type(meta),
        Some(PayloadType::Request) | Some(PayloadType::Response)
    )
}

const HTTP_METHODS: &[&[u8]] = &[
    b"GET", b"POST", b"PUT", b"DELETE", b"PATCH", b"HEAD", b"OPTIONS", b"CONNECT", b"TRACE",
];

/// Detects an HTTP request line by inspecting the first token of the payload.
pub fn has_request_title(payload: &[u8]) -> bool {
    let first_line_end = payload.iter().position(|&b| b == b'\n').unwrap_or(payload.len());
    let line = &payload[..first_line_end];
    let method_end = line.iter().position(|&b| b == b' ').unwrap_or(line.len());
    let method = &line[..method_end];
    HTTP_METHODS.contains(&method)
}

pub fn method(payload: &[u8]) -> &[u8] {
    let first_line_end = payload.iter().position(|&b| b == b'\n').unwrap_or(payload.len());
    let line = &payload[..first_line_end];
    let method_end = line.iter().position(|&b| b == b' ').unwrap_or(line.len());
    &line[..method_end]
}

/// Returns the request path (without query string) from the request line.
pub fn path(payload: &[u8]) -> &[u8] {
    let (_, uri) = split_request_line(payload);
    match uri.iter().position(|&b| b == b'?') {
        Some(idx) => &uri[..idx],
        None => uri,
    }
}

fn split_request_line(payload: &[u8]) -> (&[u8], &[u8]) {
    let first_line_end = payload.iter().position(|&b| b == b'\n').unwrap_or(payload.len());
    let line = &payload[..first_line_end];
    let method_end = line.iter().position(|&b| b == b' ').unwrap_or(line.len());
    let rest = line.get(method_end + 1..).unwrap_or(&[]);
    let uri_end = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
    (&line[..method_end], &rest[..uri_end])
}

fn full_uri(payload: &[u8]) -> &[u8] {
    split_request_line(payload).1
}

/// Rewrites the request path, preserving method, query string, version, and
/// every header/body byte after the request line.
pub fn set_path(payload: &[u8], new_path: &[u8]) -> Vec<u8> {
    let first_line_end = payload.iter().position(|&b| b == b'\n').unwrap_or(payload.len());
    let uri = full_uri(payload);
    let query_start = uri.iter().position(|&b| b == b'?');
    let query = query_start.map(|i| &uri[i..]);

    let mut out = Vec::with_capacity(payload.len());
    out.extend_from_slice(method(payload));
    out.push(b' ');
    out.extend_from_slice(new_path);
    if let Some(q) = query {
        out.extend_from_slice(q);
    }
    out.extend_from_slice(&payload[first_line_end..]);
    out
}

/// Returns the value of a case-insensitively matched header, or empty slice.
pub fn header<'a>(payload: &'a [u8], name: &[u8]) -> &'a [u8] {
    for line in header_lines(payload) {
        if let Some((k, v)) = split_header_line(line)
            && k.eq_ignore_ascii_case(name)
        {
            return v;
        }
    }
    &[]
}

fn header_lines(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    let body_start = find_header_block_end(payload);
    let block = &payload[..body_start];
    let first_nl = block.iter().position(|&b| b == b'\n').map(|i| i + 1).unwrap_or(block.len());
    block[first_nl..].split(|&b| b == b'\n').map(trim_cr).filter(|l| !l.is_empty())
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn split_header_line(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let idx = line.iter().position(|&b| b == b':')?;
    let name = &line[..idx];
    let mut value = &line[idx + 1..];
    while value.first() == Some(&b' ') {
        value = &value[1..];
    }
    Some((name, value))
}

/// Finds the start of the body: the blank line that terminates headers
/// (`\r\n\r\n` or bare `\n\n`), or the end of the buffer if absent.
fn find_header_block_end(payload: &[u8]) -> usize {
    if let Some(idx) = find_subslice(payload, b"\r\n\r\n") {
        return idx + 4;
    }
    if let Some(idx) = find_subslice(payload, b"\n\n") {
        return idx + 2;
    }
    payload.len()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Upserts a header: replaces the first case-insensitive match, or appends a
/// new header line just before the blank line separating headers from body.
pub fn set_header(payload: &[u8], name: &[u8], value: &[u8]) -> Vec<u8> {
    let body_start = find_header_block_end(payload);
    let (head, body) = payload.split_at(body_start.min(payload.len()));
    let first_nl = head.iter().position(|&b| b == b'\n').map(|i| i + 1).unwrap_or(head.len());
    let (request_line, rest_headers) = head.split_at(first_nl);

    let mut replaced = false;
    let mut out_headers: Vec<u8> = Vec::with_capacity(rest_headers.len() + value.len() + name.len() + 16);
    for line in rest_headers.split(|&b| b == b'\n') {
        let trimmed = trim_cr(line);
        if trimmed.is_empty() {
            continue;
        }
        if let Some((k, _)) = split_header_line(trimmed)
            && k.eq_ignore_ascii_case(name)
            && !replaced
        {
            out_headers.extend_from_slice(name);
            out_headers.extend_from_slice(b": ");
            out_headers.extend_from_slice(value);
            out_headers.extend_from_slice(b"\r\n");
            replaced = true;
            continue;
        }
        out_headers.extend_from_slice(trimmed);
        out_headers.extend_from_slice(b"\r\n");
    }
    if !replaced {
        out_headers.extend_from_slice(name);
        out_headers.extend_from_slice(b": ");
        out_headers.extend_from_slice(value);
        out_headers.extend_from_slice(b"\r\n");
    }

    let mut out = Vec::with_capacity(request_line.len() + out_headers.len() + 2 + body.len());
    out.extend_from_slice(request_line);
    out.extend_from_slice(&out_headers);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Returns `(value, start_index)` of a query parameter, or `(&[], -1)` if
/// absent — mirrors the reference's `(value, start, err)` triple without the
/// unused error.
pub fn path_param<'a>(payload: &'a [u8], name: &str) -> (&'a [u8], isize) {
    let uri = full_uri(payload);
    let Some(q_idx) = uri.iter().position(|&b| b == b'?') else {
        return (&[], -1);
    };
    let query = &uri[q_idx + 1..];
    let mut offset = q_idx + 1;
    for pair in query.split(|&b| b == b'&') {
        if let Some(eq) = pair.iter().position(|&b| b == b'=') {
            let k = &pair[..eq];
            if k == name.as_bytes() {
                return (&pair[eq + 1..], offset as isize);
            }
        }
        offset += pair.len() + 1;
    }
    (&[], -1)
}

/// Upserts a query parameter on the request URL.
pub fn set_path_param(payload: &[u8], name: &str, value: &str) -> Vec<u8> {
    let first_line_end = payload.iter().position(|&b| b == b'\n').unwrap_or(payload.len());
    let uri = full_uri(payload);
    let (uri_path, query): (&[u8], Option<&[u8]>) = match uri.iter().position(|&b| b == b'?') {
        Some(idx) => (&uri[..idx], Some(&uri[idx + 1..])),
        None => (uri, None),
    };

    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    if let Some(q) = query {
        for pair in q.split(|&b| b == b'&') {
            if pair.is_empty() {
                continue;
            }
            if let Some(eq) = pair.iter().position(|&b| b == b'=') {
                pairs.push((pair[..eq].to_vec(), pair[eq + 1..].to_vec()));
            } else {
                pairs.push((pair.to_vec(), Vec::new()));
            }
        }
    }
    let mut replaced = false;
    for (k, v) in pairs.iter_mut() {
        if k.as_slice() == name.as_bytes() {
            *v = value.as_bytes().to_vec();
            replaced = true;
            break;
        }
    }
    if !replaced {
        pairs.push((name.as_bytes().to_vec(), value.as_bytes().to_vec()));
    }

    let mut new_query = Vec::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            new_query.push(b'&');
        }
        new_query.extend_from_slice(k);
        new_query.push(b'=');
        new_query.extend_from_slice(v);
    }

    let mut out = Vec::with_capacity(payload.len() + value.len() + name.len());
    out.extend_from_slice(method(payload));
    out.push(b' ');
    out.extend_from_slice(uri_path);
    out.push(b'?');
    out.extend_from_slice(&new_query);
    out.extend_from_slice(&payload[first_line_end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_meta_round_trip() {
        for kind in [
            PayloadType::Request,
            PayloadType::Response,
            PayloadType::ReplayedResponse,
        ] {
            let uuid = b"aabbccddeeff00112233445566778899aabbccd";
            let header = payload_header(kind, uuid, 12345, 67);
            let fields = payload_meta(&header);
            assert_eq!(fields[0], &[kind.as_byte()]);
            assert_eq!(fields[1], uuid);
            assert_eq!(fields[2], b"12345");
            assert_eq!(fields[3], b"67");
        }
    }

    #[test]
    fn malformed_meta_has_too_few_fields() {
        assert!(payload_meta(b"1 abc\n").len() < 3);
    }

    #[test]
    fn has_request_title_detects_methods() {
        assert!(has_request_title(b"GET / HTTP/1.1\r\n\r\n"));
        assert!(!has_request_title(b"HTTP/1.1 200 OK\r\n\r\n"));
    }

    #[test]
    fn path_extracts_without_query() {
        assert_eq!(path(b"GET /a/b?x=1 HTTP/1.1\r\n\r\n"), b"/a/b");
    }

    #[test]
    fn set_path_preserves_query_and_headers() {
        let req = b"GET /old?x=1 HTTP/1.1\r\nHost: h\r\n\r\n";
        let out = set_path(req, b"/new");
        assert_eq!(path(&out), b"/new");
        assert_eq!(header(&out, b"Host"), b"h");
        assert!(out.windows(2).any(|w| w == b"x="));
    }

    #[test]
    fn header_is_case_insensitive() {
        let req = b"GET / HTTP/1.1\r\nHOST: example.com\r\n\r\n";
        assert_eq!(header(req, b"host"), b"example.com");
    }

    #[test]
    fn set_header_replaces_existing() {
        let req = b"GET / HTTP/1.1\r\nHost: old.com\r\n\r\nbody";
        let out = set_header(req, b"Host", b"new.com");
        assert_eq!(header(&out, b"Host"), b"new.com");
        assert!(out.ends_with(b"body"));
    }

    #[test]
    fn set_header_appends_when_missing() {
        let req = b"GET / HTTP/1.1\r\n\r\n";
        let out = set_header(req, b"X-Trace", b"1");
        assert_eq!(header(&out, b"X-Trace"), b"1");
    }

    #[test]
    fn path_param_roundtrip() {
        let req = b"GET /a?x=1&y=2 HTTP/1.1\r\n\r\n";
        let (v, start) = path_param(req, "y");
        assert_eq!(v, b"2");
        assert!(start >= 0);
        let (v, start) = path_param(req, "missing");
        assert_eq!(v, b"");
        assert_eq!(start, -1);
    }

    #[test]
    fn set_path_param_upserts() {
        let req = b"GET /a?x=1 HTTP/1.1\r\n\r\n";
        let out = set_path_param(req, "y", "2");
        let (v, _) = path_param(&out, "y");
        assert_eq!(v, b"2");
        let (v, _) = path_param(&out, "x");
        assert_eq!(v, b"1");

        let out2 = set_path_param(&out, "x", "9");
        let (v, _) = path_param(&out2, "x");
        assert_eq!(v, b"9");
    }
}
