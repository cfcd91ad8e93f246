//! Line-ending translation for ASCII-mode transfers.
//!
//! FTP's ASCII representation puts CRLF on the wire regardless of the host
//! convention. Outbound data expands bare LF to CRLF; inbound data collapses
//! CRLF back to LF. Image (binary) mode never calls into this module — the
//! transfer engine gates on the session's representation type.

/// Expand every LF that is not already preceded by CR into CRLF.
pub fn expand_lf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 8);
    let mut prev = 0u8;
    for &b in bytes {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// Collapse every CRLF pair into a bare LF. A CR not followed by LF is kept.
pub fn collapse_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expands_bare_lf() {
        assert_eq!(expand_lf(b"Hi\n"), b"Hi\r\n");
        assert_eq!(expand_lf(b"a\nb\nc"), b"a\r\nb\r\nc");
    }

    #[test]
    fn existing_crlf_is_untouched() {
        assert_eq!(expand_lf(b"Hi\r\n"), b"Hi\r\n");
        assert_eq!(expand_lf(b"a\r\nb\n"), b"a\r\nb\r\n");
    }

    #[test]
    fn collapses_crlf() {
        assert_eq!(collapse_crlf(b"Hi\r\n"), b"Hi\n");
        assert_eq!(collapse_crlf(b"a\r\nb\r\n"), b"a\nb\n");
    }

    #[test]
    fn lone_cr_survives_collapse() {
        assert_eq!(collapse_crlf(b"a\rb"), b"a\rb");
    }

    #[test]
    fn round_trip_restores_host_form() {
        let host = b"one\ntwo\nthree\n";
        assert_eq!(collapse_crlf(&expand_lf(host)), host);
    }
}
