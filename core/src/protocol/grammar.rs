// Line grammar: `COMMAND KEY=VALUE KEY=VALUE ...`
//
// Commands are case-insensitive. Parameter keys and values are kept verbatim;
// a token without `=` becomes a key with an empty value.

use crate::crypto::VALIDATION_MARKER;

/// Line terminator used on the wire
pub const CRLF: &str = "\r\n";

/// Ordered key/value parameters.
///
/// Lookups return the first occurrence of a key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter, keeping earlier ones with the same key.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value for `key` when present and non-empty.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Split a `KEY=VALUE` token on its first `=`.
fn split_pair(token: &str) -> (String, String) {
    match token.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (token.to_string(), String::new()),
    }
}

/// Parse one received line into an upper-cased command and its parameters.
///
/// Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Option<(String, Params)> {
    let mut tokens = line.split_whitespace();
    let command = tokens.next()?.to_ascii_uppercase();

    let mut params = Params::new();
    for token in tokens {
        let (key, value) = split_pair(token);
        params.push(key, value);
    }

    Some((command, params))
}

/// Parse a decrypted key/value body (one `KEY=VALUE` per line).
pub fn parse_body(body: &str) -> Params {
    let mut params = Params::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (key, value) = split_pair(line);
        params.push(key, value);
    }
    params
}

/// Format a key/value body, validation marker first, lines joined by CR-LF.
pub fn format_body(params: &Params) -> String {
    let (marker_key, _) = VALIDATION_MARKER
        .split_once('=')
        .unwrap_or((VALIDATION_MARKER, ""));

    let mut lines = Vec::with_capacity(params.len());
    if let Some(value) = params.get(marker_key) {
        lines.push(format!("{}={}", marker_key, value));
    }
    for (key, value) in params.iter().filter(|(k, _)| *k != marker_key) {
        lines.push(format!("{}={}", key, value));
    }
    lines.join(CRLF)
}

/// Terminate a response line with CR-LF unless it already is.
pub fn frame_response(payload: &str) -> String {
    if payload.ends_with(CRLF) {
        payload.to_string()
    } else {
        format!("{}{}", payload, CRLF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_command_case() {
        let (command, params) = parse_line("init HST=PCAB ATP=POS").unwrap();
        assert_eq!(command, "INIT");
        assert_eq!(params.get("HST"), Some("PCAB"));
        assert_eq!(params.get("ATP"), Some("POS"));
    }

    #[test]
    fn test_parse_line_blank() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   \t ").is_none());
    }

    #[test]
    fn test_parse_line_splits_on_first_equals() {
        let (_, params) = parse_line("INFO DATA=abc=def FLAG").unwrap();
        assert_eq!(params.get("DATA"), Some("abc=def"));
        assert_eq!(params.get("FLAG"), Some(""));
        assert!(params.get_non_empty("FLAG").is_none());
    }

    #[test]
    fn test_parse_line_keeps_order_and_first_wins() {
        let (_, params) = parse_line("X B=1 A=2 B=3").unwrap();
        let keys: Vec<&str> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["B", "A", "B"]);
        assert_eq!(params.get("B"), Some("1"));
    }

    #[test]
    fn test_parse_body_lines() {
        let params = parse_body("TT=Test\r\nCID=SHOP-1\r\n\r\nNAME=Till 2\n");
        assert_eq!(params.get("TT"), Some("Test"));
        assert_eq!(params.get("CID"), Some("SHOP-1"));
        assert_eq!(params.get("NAME"), Some("Till 2"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_format_body_marker_first() {
        let params = Params::new()
            .with("CID", "A")
            .with("TT", "Test")
            .with("ENB", "1");
        assert_eq!(format_body(&params), "TT=Test\r\nCID=A\r\nENB=1");
    }

    #[test]
    fn test_format_body_without_marker() {
        let params = Params::new().with("A", "1");
        assert_eq!(format_body(&params), "A=1");
    }

    #[test]
    fn test_frame_response() {
        assert_eq!(frame_response("200"), "200\r\n");
        assert_eq!(frame_response("200\r\n"), "200\r\n");
        assert_eq!(frame_response(""), "\r\n");
    }
}
