//! Declarative, pure, single-pass HTTP request modifier (spec.md §4.3).
//!
//! Rule evaluation order and short-circuit-on-drop semantics match the
//! reference exactly; see `original_source/goreplay/core/http_modifier.go`.
//! Flag grammars (colon/percent/comma delimiters) are reproduced from
//! `original_source/goreplay/settings/http_modifier_settings.go` since
//! spec.md §6 only lists the flag names, not their exact syntax.

use regex::bytes::Regex;

use crate::proto;

#[derive(Debug, Clone)]
pub struct HeaderSet {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ParamSet {
    pub name: String,
    pub value: String,
}

#[derive(Clone)]
pub struct HeaderFilter {
    pub name: Vec<u8>,
    pub regex: Regex,
}

#[derive(Clone)]
pub struct BasicAuthFilter {
    pub regex: Regex,
}

#[derive(Debug, Clone)]
pub struct HashFilter {
    pub name: Vec<u8>,
    pub percent: u32,
}

#[derive(Clone)]
pub struct UrlRewrite {
    pub src: Regex,
    pub target: Vec<u8>,
}

#[derive(Clone)]
pub struct HeaderRewrite {
    pub header: Vec<u8>,
    pub src: Regex,
    pub target: Vec<u8>,
}

/// Mirrors `HTTPModifierConfig`: one list per `--http-*` flag, in the order
/// they are evaluated.
#[derive(Default, Clone)]
pub struct ModifierConfig {
    pub methods: Vec<Vec<u8>>,
    pub headers: Vec<HeaderSet>,
    pub params: Vec<ParamSet>,
    pub url_regexp: Vec<Regex>,
    pub url_negative_regexp: Vec<Regex>,
    pub header_filters: Vec<HeaderFilter>,
    pub header_negative_filters: Vec<HeaderFilter>,
    pub header_basic_auth_filters: Vec<BasicAuthFilter>,
    pub header_hash_filters: Vec<HashFilter>,
    pub param_hash_filters: Vec<HashFilter>,
    pub url_rewrite: Vec<UrlRewrite>,
    pub header_rewrite: Vec<HeaderRewrite>,
}

impl ModifierConfig {
    fn is_empty(&self) -> bool {
        self.methods.is_empty()
            && self.headers.is_empty()
            && self.params.is_empty()
            && self.url_regexp.is_empty()
            && self.url_negative_regexp.is_empty()
            && self.header_filters.is_empty()
            && self.header_negative_filters.is_empty()
            && self.header_basic_auth_filters.is_empty()
            && self.header_hash_filters.is_empty()
            && self.param_hash_filters.is_empty()
            && self.url_rewrite.is_empty()
            && self.header_rewrite.is_empty()
    }
}

pub struct HttpModifier {
    config: ModifierConfig,
}

impl HttpModifier {
    /// Returns `None` when no rule is configured — the fast path that skips
    /// modification entirely, matching `NewHTTPModifier`'s nil return.
    pub fn build(config: ModifierConfig) -> Option<Self> {
        if config.is_empty() {
            return None;
        }
        Some(Self { config })
    }

    /// Rewrites (or drops) a single request payload. Non-request payloads
    /// pass through unchanged. An empty return means "drop this request".
    pub fn rewrite(&self, payload: &[u8]) -> Vec<u8> {
        if !proto::has_request_title(payload) {
            return payload.to_vec();
        }

        if !self.config.methods.is_empty() {
            let method = proto::method(payload);
            if !self.config.methods.iter().any(|m| m.as_slice() == method) {
                return Vec::new();
            }
        }

        let mut payload = payload.to_vec();

        for h in &self.config.headers {
            payload = proto::set_header(&payload, h.name.as_bytes(), h.value.as_bytes());
        }

        for p in &self.config.params {
            payload = proto::set_path_param(&payload, &p.name, &p.value);
        }

        if !self.config.url_regexp.is_empty() {
            let path = proto::path(&payload).to_vec();
            if !self.config.url_regexp.iter().any(|r| r.is_match(&path)) {
                return Vec::new();
            }
        }

        if !self.config.url_negative_regexp.is_empty() {
            let path = proto::path(&payload).to_vec();
            if self.config.url_negative_regexp.iter().any(|r| r.is_match(&path)) {
                return Vec::new();
            }
        }

        for f in &self.config.header_filters {
            let value = proto::header(&payload, &f.name);
            if value.is_empty() || !f.regex.is_match(value) {
                return Vec::new();
            }
        }

        for f in &self.config.header_negative_filters {
            let value = proto::header(&payload, &f.name);
            if !value.is_empty() && f.regex.is_match(value) {
                return Vec::new();
            }
        }

        for f in &self.config.header_basic_auth_filters {
            let value = proto::header(&payload, b"Authorization");
            if let Some(encoded) = value.strip_prefix(b"Basic ") {
                if let Ok(decoded) = base64_decode(encoded) {
                    if !f.regex.is_match(&decoded) {
                        return Vec::new();
                    }
                }
            }
        }

        for f in &self.config.header_hash_filters {
            let value = proto::header(&payload, &f.name);
            if !value.is_empty() && (crate::hash::fnv1a32(value) % 100) >= f.percent {
                return Vec::new();
            }
        }

        for f in &self.config.param_hash_filters {
            let (value, start) = proto::path_param(&payload, &String::from_utf8_lossy(&f.name));
            if start != -1 && (crate::hash::fnv1a32(value) % 100) >= f.percent {
                return Vec::new();
            }
        }

        if !self.config.url_rewrite.is_empty() {
            let path = proto::path(&payload).to_vec();
            for f in &self.config.url_rewrite {
                if f.src.is_match(&path) {
                    let new_path = f.src.replace_all(&path, f.target.as_slice());
                    payload = proto::set_path(&payload, &new_path);
                    break;
                }
            }
        }

        for f in &self.config.header_rewrite {
            let value = proto::header(&payload, &f.header).to_vec();
            if value.is_empty() {
                break;
            }
            if f.src.is_match(&value) {
                let new_value = f.src.replace_all(&value, f.target.as_slice());
                payload = proto::set_header(&payload, &f.header, &new_value);
            }
        }

        payload
    }
}

fn base64_decode(input: &[u8]) -> Result<Vec<u8>, ()> {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut rev = [255u8; 256];
    for (i, &c) in TABLE.iter().enumerate() {
        rev[c as usize] = i as u8;
    }
    let input: Vec<u8> = input.iter().copied().filter(|&b| b != b'=').collect();
    let mut out = Vec::with_capacity(input.len() * 3 / 4);
    for chunk in input.chunks(4) {
        let mut buf = [0u8; 4];
        let mut n = 0;
        for (i, &c) in chunk.iter().enumerate() {
            let v = rev[c as usize];
            if v == 255 {
                return Err(());
            }
            buf[i] = v;
            n += 1;
        }
        let triple = ((buf[0] as u32) << 18) | ((buf[1] as u32) << 12) | ((buf[2] as u32) << 6) | buf[3] as u32;
        out.push((triple >> 16) as u8);
        if n > 2 {
            out.push((triple >> 8) as u8);
        }
        if n > 3 {
            out.push(triple as u8);
        }
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────
// CLI flag grammars
// ─────────────────────────────────────────────────────────────────────────

pub fn parse_header_filter(s: &str) -> Result<HeaderFilter, String> {
    let (name, re) = s
        .split_once(':')
        .ok_or("need both header and value, colon-delimited (ex. user_id:^169$)")?;
    let regex = Regex::new(re.trim()).map_err(|e| e.to_string())?;
    Ok(HeaderFilter {
        name: name.as_bytes().to_vec(),
        regex,
    })
}

pub fn parse_basic_auth_filter(s: &str) -> Result<BasicAuthFilter, String> {
    Ok(BasicAuthFilter {
        regex: Regex::new(s).map_err(|e| e.to_string())?,
    })
}

pub fn parse_hash_filter(s: &str) -> Result<HashFilter, String> {
    let (name, val) = s
        .split_once(':')
        .ok_or("need both header and value, colon-delimited (ex. user_id:50%)")?;
    let val = val.trim();
    let percent = if let Some(pct) = val.strip_suffix('%') {
        pct.parse::<u32>().map_err(|e| e.to_string())?
    } else if let Some((num, den)) = val.split_once('/') {
        let num: f64 = num.parse().map_err(|_| "invalid numerator")?;
        let den: f64 = den.parse().map_err(|_| "invalid denominator")?;
        ((num / den) * 100.0) as u32
    } else {
        return Err("value should be percent and contain '%'".into());
    };
    Ok(HashFilter {
        name: name.as_bytes().to_vec(),
        percent,
    })
}

pub fn parse_header_set(s: &str) -> Result<HeaderSet, String> {
    let (name, value) = s.split_once(':').ok_or("expected `Key: Value`")?;
    Ok(HeaderSet {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
    })
}

pub fn parse_param_set(s: &str) -> Result<ParamSet, String> {
    let (name, value) = s.split_once('=').ok_or("expected `Key=Value`")?;
    Ok(ParamSet {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
    })
}

pub fn parse_url_regexp(s: &str) -> Result<Regex, String> {
    Regex::new(s).map_err(|e| e.to_string())
}

pub fn parse_url_rewrite(s: &str) -> Result<UrlRewrite, String> {
    let (src, target) = s
        .split_once(':')
        .ok_or("need both src and target, colon-delimited (ex. /a:/b)")?;
    Ok(UrlRewrite {
        src: Regex::new(src).map_err(|e| e.to_string())?,
        target: target.as_bytes().to_vec(),
    })
}

pub fn parse_header_rewrite(s: &str) -> Result<HeaderRewrite, String> {
    let (header, rest) = s
        .split_once(':')
        .ok_or("need header, regexp and rewrite target (ex. Header: regexp,target)")?;
    let (src, target) = rest
        .trim()
        .split_once(',')
        .ok_or("need header, regexp and rewrite target (ex. Header: regexp,target)")?;
    Ok(HeaderRewrite {
        header: header.as_bytes().to_vec(),
        src: Regex::new(src).map_err(|e| e.to_string())?,
        target: target.as_bytes().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_rules_is_identity() {
        assert!(HttpModifier::build(ModifierConfig::default()).is_none());
    }

    #[test]
    fn method_allow_list_drops_others() {
        let mut cfg = ModifierConfig::default();
        cfg.methods.push(b"GET".to_vec());
        let m = HttpModifier::build(cfg).unwrap();

        let get = b"GET / HTTP/1.1\r\n\r\n";
        let post = b"POST / HTTP/1.1\r\n\r\n";
        assert_eq!(m.rewrite(get), get);
        assert!(m.rewrite(post).is_empty());
    }

    #[test]
    fn non_request_payload_passes_through() {
        let cfg = {
            let mut c = ModifierConfig::default();
            c.methods.push(b"GET".to_vec());
            c
        };
        let m = HttpModifier::build(cfg).unwrap();
        let response = b"HTTP/1.1 200 OK\r\n\r\n";
        assert_eq!(m.rewrite(response), response);
    }

    #[test]
    fn header_set_is_upserted() {
        let mut cfg = ModifierConfig::default();
        cfg.headers.push(HeaderSet {
            name: "X-Injected".into(),
            value: "1".into(),
        });
        let m = HttpModifier::build(cfg).unwrap();
        let out = m.rewrite(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(proto::header(&out, b"X-Injected"), b"1");
    }

    #[test]
    fn url_rewrite_applies_first_match() {
        let mut cfg = ModifierConfig::default();
        cfg.url_rewrite.push(parse_url_rewrite("^/old$:/new").unwrap());
        let m = HttpModifier::build(cfg).unwrap();
        let out = m.rewrite(b"GET /old HTTP/1.1\r\n\r\n");
        assert_eq!(proto::path(&out), b"/new");
    }

    #[test]
    fn header_hash_filter_is_deterministic() {
        let mut cfg = ModifierConfig::default();
        cfg.header_hash_filters.push(parse_hash_filter("X-User:100%").unwrap());
        let m = HttpModifier::build(cfg).unwrap();
        let req = b"GET / HTTP/1.1\r\nX-User: alice\r\n\r\n";
        assert_eq!(m.rewrite(req), req);

        let mut cfg2 = ModifierConfig::default();
        cfg2.header_hash_filters.push(parse_hash_filter("X-User:0%").unwrap());
        let m2 = HttpModifier::build(cfg2).unwrap();
        assert!(m2.rewrite(req).is_empty());
    }

    #[test]
    fn basic_auth_filter_decodes_and_matches() {
        let mut cfg = ModifierConfig::default();
        cfg.header_basic_auth_filters.push(parse_basic_auth_filter("^admin:").unwrap());
        let m = HttpModifier::build(cfg).unwrap();
        // base64("admin:secret") = YWRtaW46c2VjcmV0
        let req = b"GET / HTTP/1.1\r\nAuthorization: Basic YWRtaW46c2VjcmV0\r\n\r\n";
        assert_eq!(m.rewrite(req), req);

        let req_other = b"GET / HTTP/1.1\r\nAuthorization: Basic Z3Vlc3Q6Z3Vlc3Q=\r\n\r\n";
        assert!(m.rewrite(req_other).is_empty());
    }
}
