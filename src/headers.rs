//! Header fields and header-list validation (RFC 7540 section 8.1.2).
//!
//! Validation runs in both directions: on receive after HPACK
//! decompression and before the list is surfaced to the stream reader, and
//! on send before anything is framed, so a malformed list never reaches
//! the wire.

use bytes::Bytes;

/// A single header field: lowercase name, opaque value, and a sensitivity
/// flag requesting the never-indexed HPACK representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: Bytes,
    pub sensitive: bool,
}

impl HeaderField {
    /// Build a field, lowercasing the name. The name must be a valid
    /// (pseudo-)header name and the value free of NUL/CR/LF; violations
    /// are rejected here rather than at frame time.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Result<Self, InvalidHeader> {
        let name = name.into().to_ascii_lowercase();
        let value = value.into();
        check_name(&name)?;
        check_value(&value)?;
        Ok(Self {
            name,
            value,
            sensitive: false,
        })
    }

    /// Mark the field sensitive (never-indexed on the wire).
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Raw constructor for decoded fields; validation happens list-wide
    /// afterwards.
    pub(crate) fn raw(name: String, value: Bytes, sensitive: bool) -> Self {
        Self {
            name,
            value,
            sensitive,
        }
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }

    /// RFC 7541 section 4.1 size: name + value + 32.
    pub fn hpack_size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// Reason a header list failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidHeader(pub &'static str);

impl std::fmt::Display for InvalidHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Cumulative RFC 7541 size of a list, for MAX_HEADER_LIST_SIZE checks.
pub fn list_size(fields: &[HeaderField]) -> usize {
    fields.iter().map(HeaderField::hpack_size).sum()
}

/// Headers forbidden in HTTP/2 (connection-specific semantics).
const FORBIDDEN: [&str; 5] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'a'..=b'z' | b'0'..=b'9' |
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' |
        b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

fn check_name(name: &str) -> Result<(), InvalidHeader> {
    let bytes = name.as_bytes();
    let rest = match bytes.first() {
        None => return Err(InvalidHeader("empty header name")),
        Some(b':') => &bytes[1..],
        Some(_) => bytes,
    };
    if rest.is_empty() {
        return Err(InvalidHeader("empty header name"));
    }
    for &b in rest {
        if b.is_ascii_uppercase() {
            return Err(InvalidHeader("uppercase character in header name"));
        }
        if !is_token_char(b) {
            return Err(InvalidHeader("invalid character in header name"));
        }
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<(), InvalidHeader> {
    if value.iter().any(|&b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(InvalidHeader("NUL/CR/LF in header value"));
    }
    Ok(())
}

/// Checks shared by requests, responses and trailers: charset, pseudo
/// ordering, forbidden connection-specific headers, `te: trailers`.
fn check_common(fields: &[HeaderField]) -> Result<(), InvalidHeader> {
    let mut seen_regular = false;
    for field in fields {
        check_name(&field.name)?;
        check_value(&field.value)?;

        if field.is_pseudo() {
            if seen_regular {
                return Err(InvalidHeader("pseudo-header after regular header"));
            }
        } else {
            seen_regular = true;
            if FORBIDDEN.contains(&field.name.as_str()) {
                return Err(InvalidHeader("connection-specific header forbidden"));
            }
            if field.name == "te" && &field.value[..] != b"trailers" {
                return Err(InvalidHeader("te header value must be \"trailers\""));
            }
        }
    }
    Ok(())
}

/// Validate a request header list (server receive path, client send path).
pub fn validate_request(fields: &[HeaderField]) -> Result<(), InvalidHeader> {
    check_common(fields)?;

    let mut method: Option<&HeaderField> = None;
    let mut scheme = false;
    let mut path: Option<&HeaderField> = None;
    let mut authority = false;

    for field in fields.iter().filter(|f| f.is_pseudo()) {
        let slot = match field.name.as_str() {
            ":method" => {
                if method.replace(field).is_some() {
                    return Err(InvalidHeader("duplicate :method"));
                }
                continue;
            }
            ":path" => {
                if path.replace(field).is_some() {
                    return Err(InvalidHeader("duplicate :path"));
                }
                continue;
            }
            ":scheme" => &mut scheme,
            ":authority" => &mut authority,
            _ => return Err(InvalidHeader("unknown request pseudo-header")),
        };
        if *slot {
            return Err(InvalidHeader("duplicate request pseudo-header"));
        }
        *slot = true;
    }

    let method = method.ok_or(InvalidHeader("missing :method"))?;
    if &method.value[..] == b"CONNECT" {
        // RFC 7540 section 8.3: CONNECT omits :scheme and :path.
        if scheme || path.is_some() {
            return Err(InvalidHeader("CONNECT must omit :scheme and :path"));
        }
        if !authority {
            return Err(InvalidHeader("CONNECT requires :authority"));
        }
    } else {
        if !scheme {
            return Err(InvalidHeader("missing :scheme"));
        }
        match path {
            None => return Err(InvalidHeader("missing :path")),
            Some(p) if p.value.is_empty() => return Err(InvalidHeader("empty :path")),
            Some(_) => {}
        }
    }
    Ok(())
}

/// Validate a response header list (client receive path, server send path).
pub fn validate_response(fields: &[HeaderField]) -> Result<(), InvalidHeader> {
    check_common(fields)?;

    let mut status = None;
    for field in fields.iter().filter(|f| f.is_pseudo()) {
        if field.name != ":status" {
            return Err(InvalidHeader("unknown response pseudo-header"));
        }
        if status.replace(field).is_some() {
            return Err(InvalidHeader("duplicate :status"));
        }
    }

    let status = status.ok_or(InvalidHeader("missing :status"))?;
    if status.value.len() != 3 || !status.value.iter().all(u8::is_ascii_digit) {
        return Err(InvalidHeader(":status must be three ASCII digits"));
    }
    Ok(())
}

/// Validate a trailer list: no pseudo-headers at all.
pub fn validate_trailers(fields: &[HeaderField]) -> Result<(), InvalidHeader> {
    check_common(fields)?;
    if fields.iter().any(HeaderField::is_pseudo) {
        return Err(InvalidHeader("pseudo-header in trailers"));
    }
    Ok(())
}
