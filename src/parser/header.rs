//! Part header block parsing: charset fallback and line unfolding.

use crate::model::headers::Headers;

/// Parse a raw header block (without the terminating blank line).
///
/// Malformed lines (no colon, not a continuation) are skipped, matching
/// what mail software generally tolerates.
pub fn parse_headers(raw: &[u8]) -> Headers {
    let text = decode_header_bytes(raw);
    let mut headers = Headers::new();
    for (name, value) in unfold_headers(&text) {
        headers.push(name, value);
    }
    headers
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &bytes[3..]
    } else {
        bytes
    };

    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Unfold headers: join continuation lines (starting with space or tab) with the previous header.
///
/// Returns `(name, value)` pairs with the name's original spelling.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            if !name.is_empty() {
                result.push((name, value));
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfold_headers() {
        let text = "Content-Type: multipart/related;\n\tboundary=xyz\nContent-ID: <a>\n";
        let headers = unfold_headers(text);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, "Content-Type");
        assert_eq!(headers[0].1, "multipart/related; boundary=xyz");
        assert_eq!(headers[1].1, "<a>");
    }

    #[test]
    fn test_parse_headers_crlf() {
        let headers = parse_headers(b"Content-ID: <b>\r\nContent-Type: text/xml\r\n");
        assert_eq!(headers.content_id().as_deref(), Some("b"));
        assert_eq!(headers.content_type(), "text/xml");
    }

    #[test]
    fn test_windows_1252_fallback() {
        let headers = parse_headers(b"X-Name: M\xfcller\n");
        assert_eq!(headers.first("x-name"), Some("Müller"));
    }

    #[test]
    fn test_lines_without_colon_are_skipped() {
        let headers = parse_headers(b"garbage line\nX-Ok: yes\n");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.first("x-ok"), Some("yes"));
    }
}
