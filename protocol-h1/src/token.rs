//! Byte-class validators and known-header lookup.

/// `tchar` from RFC 9110 section 5.6.2.
const TOKEN: [bool; 256] = {
    let mut table = [false; 256];
    let mut i = 0;
    while i < 256 {
        let b = i as u8;
        table[i] = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'!' | b'#'
                    | b'$'
                    | b'%'
                    | b'&'
                    | b'\''
                    | b'*'
                    | b'+'
                    | b'-'
                    | b'.'
                    | b'^'
                    | b'_'
                    | b'`'
                    | b'|'
                    | b'~'
            );
        i += 1;
    }
    table
};

/// Returns true if `s` is a non-empty HTTP token (method or field name).
#[inline]
pub fn is_token(s: &[u8]) -> bool {
    !s.is_empty() && s.iter().all(|&b| TOKEN[b as usize])
}

/// Returns true if every byte of `v` may appear in a field value:
/// HTAB, visible ASCII, space, or obs-text.
#[inline]
pub fn is_valid_header_value(v: &[u8]) -> bool {
    v.iter()
        .all(|&b| b == b'\t' || (0x20..=0x7e).contains(&b) || b >= 0x80)
}

/// Returns true if `p` contains no control bytes, spaces or DEL.
#[inline]
pub fn is_valid_path(p: &[u8]) -> bool {
    p.iter().all(|&b| (0x21..=0x7e).contains(&b) || b >= 0x80)
}

/// Header names the engine treats specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownHeader {
    Host,
    ContentLength,
    ContentType,
    ContentDisposition,
    Connection,
    TransferEncoding,
    KeepAlive,
    Upgrade,
    Expect,
}

/// Length of the longest known name, `content-disposition`.
const MAX_KNOWN_LEN: usize = 19;

impl KnownHeader {
    /// Case-insensitive lookup. Unknown names return `None`.
    pub fn lookup(name: &[u8]) -> Option<KnownHeader> {
        if name.len() > MAX_KNOWN_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_KNOWN_LEN];
        let lower = &mut buf[..name.len()];
        lower.copy_from_slice(name);
        lower.make_ascii_lowercase();
        match &*lower {
            b"host" => Some(KnownHeader::Host),
            b"content-length" => Some(KnownHeader::ContentLength),
            b"content-type" => Some(KnownHeader::ContentType),
            b"content-disposition" => Some(KnownHeader::ContentDisposition),
            b"connection" => Some(KnownHeader::Connection),
            b"transfer-encoding" => Some(KnownHeader::TransferEncoding),
            b"keep-alive" => Some(KnownHeader::KeepAlive),
            b"upgrade" => Some(KnownHeader::Upgrade),
            b"expect" => Some(KnownHeader::Expect),
            _ => None,
        }
    }

    /// Lowercase canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            KnownHeader::Host => "host",
            KnownHeader::ContentLength => "content-length",
            KnownHeader::ContentType => "content-type",
            KnownHeader::ContentDisposition => "content-disposition",
            KnownHeader::Connection => "connection",
            KnownHeader::TransferEncoding => "transfer-encoding",
            KnownHeader::KeepAlive => "keep-alive",
            KnownHeader::Upgrade => "upgrade",
            KnownHeader::Expect => "expect",
        }
    }

    /// Headers that must not be sent more than once.
    pub fn is_singular(&self) -> bool {
        matches!(
            self,
            KnownHeader::Host
                | KnownHeader::ContentLength
                | KnownHeader::ContentType
                | KnownHeader::ContentDisposition
        )
    }
}

/// Parses a `Keep-Alive` header value and returns the `timeout` hint in
/// seconds, if present and numeric.
pub fn parse_keep_alive_timeout(value: &[u8]) -> Option<u64> {
    for param in value.split(|&b| b == b',') {
        let param = trim(param);
        let Some(eq) = param.iter().position(|&b| b == b'=') else {
            continue;
        };
        let (key, rest) = param.split_at(eq);
        if !trim(key).eq_ignore_ascii_case(b"timeout") {
            continue;
        }
        let digits = trim(&rest[1..]);
        let end = digits
            .iter()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(digits.len());
        if end == 0 {
            return None;
        }
        return std::str::from_utf8(&digits[..end]).ok()?.parse().ok();
    }
    None
}

/// Trims leading and trailing SP / HTAB.
pub fn trim(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}
