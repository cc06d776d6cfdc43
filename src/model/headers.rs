//! Part headers.
//!
//! Headers are kept in arrival order. Lookups are case-insensitive and
//! always return every value for a name, since MIME allows repeats.

use serde::Serialize;

/// Content type reported for parts that carry no `Content-Type` header.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Ordered header block of one part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header. The name is stored as given.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Builder-style [`Headers::push`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// All values for `name`, in arrival order.
    pub fn get(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value for `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Content-ID` with surrounding angle brackets removed.
    pub fn content_id(&self) -> Option<String> {
        self.first("content-id").map(strip_angle_brackets)
    }

    /// `Content-Type`, or `application/octet-stream` when absent.
    pub fn content_type(&self) -> &str {
        self.first("content-type").unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Parameter `param` of header `name`, e.g. `boundary` of `Content-Type`.
    ///
    /// Quoted values are unquoted. Parameter names match case-insensitively.
    pub fn param(&self, name: &str, param: &str) -> Option<String> {
        let value = self.first(name)?;
        value.split(';').skip(1).find_map(|p| {
            let (k, v) = p.split_once('=')?;
            k.trim()
                .eq_ignore_ascii_case(param)
                .then(|| v.trim().trim_matches('"').to_string())
        })
    }

    /// Suggested file name from `Content-Disposition` or `Content-Type`.
    pub fn filename(&self) -> Option<String> {
        self.param("content-disposition", "filename")
            .or_else(|| self.param("content-type", "name"))
            .filter(|f| !f.is_empty())
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn strip_angle_brackets(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(value)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive_and_ordered() {
        let headers = Headers::new()
            .with("Content-Type", "text/plain")
            .with("X-Tag", "one")
            .with("x-tag", "two");
        assert_eq!(headers.get("X-TAG"), vec!["one", "two"]);
        assert_eq!(headers.first("content-type"), Some("text/plain"));
        assert!(headers.get("missing").is_empty());
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_content_id_strips_brackets() {
        let headers = Headers::new().with("Content-ID", " <part1@example.com> ");
        assert_eq!(headers.content_id().as_deref(), Some("part1@example.com"));
        let bare = Headers::new().with("Content-ID", "plain");
        assert_eq!(bare.content_id().as_deref(), Some("plain"));
    }

    #[test]
    fn test_default_content_type() {
        assert_eq!(Headers::new().content_type(), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn test_filename_from_disposition_or_type() {
        let headers = Headers::new()
            .with("Content-Type", "image/png; name=\"fallback.png\"")
            .with("Content-Disposition", "attachment; FileName=\"logo.png\"");
        assert_eq!(headers.filename().as_deref(), Some("logo.png"));

        let only_type = Headers::new().with("Content-Type", "text/plain; charset=utf-8; name=a.txt");
        assert_eq!(only_type.filename().as_deref(), Some("a.txt"));
        assert_eq!(only_type.param("content-type", "charset").as_deref(), Some("utf-8"));
        assert_eq!(Headers::new().filename(), None);
    }
}
