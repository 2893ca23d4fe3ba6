//! Control-port reply grammar.
//!
//! Pure functions for interpreting the body lines of a control-port reply. A
//! reply line such as
//!
//! ```text
//! AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/var/lib/tor/control_auth_cookie"
//! ```
//!
//! is first split into its type (`AUTH`) and remainder with
//! [`split_reply_line`], and the remainder is then turned into a key/value
//! mapping with [`parse_reply_mapping`].
//!
//! # Grammar
//!
//! ```text
//! Mapping      = *(Key "=" Value SP) [OptArguments]
//! Value        = QuotedString / 1*(any char except SP)
//! QuotedString = DQUOTE *(qchar / "\" any) DQUOTE
//! ```
//!
//! Escapes inside quoted strings: `\n`, `\t`, `\r`, octal `\ooo` (at most
//! three digits, a leading digit of 4-7 limits the sequence to two), and any
//! other escaped character stands for itself.
//!
//! None of these functions fail. Malformed input yields an empty mapping, which
//! callers treat as "could not parse".

use std::collections::BTreeMap;

/// Status code of a successful synchronous reply.
pub const REPLY_OK: u16 = 250;

/// Status code the daemon returns for a command it does not know.
pub const REPLY_UNRECOGNIZED: u16 = 510;

/// Replies at or above this code are asynchronous notifications.
pub const ASYNC_THRESHOLD: u16 = 600;

/// Parsed key/value pairs from a reply line.
pub type ReplyMapping = BTreeMap<String, String>;

/// Parsed key/value pairs with values kept as the decoded bytes.
pub type RawReplyMapping = BTreeMap<String, Vec<u8>>;

/// One complete control-port reply, possibly spanning several lines.
///
/// The status code applies to the whole reply. Body lines are stored without
/// the `NNN-`/`NNN ` framing prefix, in the order they arrived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlReply {
    /// Three-digit status code.
    pub code: u16,
    /// Body lines in arrival order.
    pub lines: Vec<String>,
}

impl ControlReply {
    /// Creates a reply from a code and its body lines.
    pub fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// Returns true for a `250` reply.
    pub fn is_ok(&self) -> bool {
        self.code == REPLY_OK
    }

    /// Returns true if this reply is an asynchronous notification.
    pub fn is_async(&self) -> bool {
        self.code >= ASYNC_THRESHOLD
    }

    /// Resets the reply so it can be reused while framing.
    pub fn clear(&mut self) {
        self.code = 0;
        self.lines.clear();
    }
}

/// Splits a reply line into its type and the remainder.
///
/// The type is everything before the first space. The remainder is everything
/// after it, or the empty string if the line contains no space.
///
/// # Example
///
/// ```rust
/// use onion_control::reply::split_reply_line;
///
/// assert_eq!(split_reply_line("AUTH METHODS=NULL"), ("AUTH", "METHODS=NULL"));
/// assert_eq!(split_reply_line("OK"), ("OK", ""));
/// ```
pub fn split_reply_line(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (line, ""),
    }
}

/// Parses `key=value` pairs from the remainder of a reply line.
///
/// A bare token followed by a space ends the mapping; whatever follows is
/// treated as unstructured trailing arguments. An unterminated key or quoted
/// string makes the whole line invalid and an empty mapping is returned.
///
/// # Example
///
/// ```rust
/// use onion_control::reply::parse_reply_mapping;
///
/// let m = parse_reply_mapping(r#"METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/tmp/a b""#);
/// assert_eq!(m["METHODS"], "COOKIE,SAFECOOKIE");
/// assert_eq!(m["COOKIEFILE"], "/tmp/a b");
/// ```
pub fn parse_reply_mapping(s: &str) -> ReplyMapping {
    parse_reply_mapping_raw(s)
        .into_iter()
        .map(|(key, value)| (key, lossy_string(value)))
        .collect()
}

/// Like [`parse_reply_mapping`], but keeps each value as the bytes it
/// decodes to.
///
/// Octal escapes may encode bytes that are not valid UTF-8, such as a
/// non-UTF-8 `COOKIEFILE` path.
///
/// # Example
///
/// ```rust
/// use onion_control::reply::parse_reply_mapping_raw;
///
/// let m = parse_reply_mapping_raw(r#"K="\377" L=x"#);
/// assert_eq!(m["K"], vec![0xffu8]);
/// assert_eq!(m["L"], b"x".to_vec());
/// ```
pub fn parse_reply_mapping_raw(s: &str) -> RawReplyMapping {
    let bytes = s.as_bytes();
    let len = bytes.len();
    let mut mapping = RawReplyMapping::new();
    let mut ptr = 0;

    while ptr < len {
        let key_start = ptr;
        while ptr < len && bytes[ptr] != b'=' && bytes[ptr] != b' ' {
            ptr += 1;
        }
        if ptr == len {
            return RawReplyMapping::new();
        }
        if bytes[ptr] == b' ' {
            break;
        }
        let key = &s[key_start..ptr];
        ptr += 1; // '='

        let value = if ptr < len && bytes[ptr] == b'"' {
            ptr += 1;
            let start = ptr;
            // Backslash runs are consumed in pairs, so an even run before a
            // quote does not escape it.
            let mut escape_next = false;
            while ptr < len && (escape_next || bytes[ptr] != b'"') {
                escape_next = bytes[ptr] == b'\\' && !escape_next;
                ptr += 1;
            }
            if ptr == len {
                return RawReplyMapping::new();
            }
            let raw = &bytes[start..ptr];
            ptr += 1; // closing '"'
            unescape(raw)
        } else {
            let start = ptr;
            while ptr < len && bytes[ptr] != b' ' {
                ptr += 1;
            }
            bytes[start..ptr].to_vec()
        };

        if ptr < len && bytes[ptr] == b' ' {
            ptr += 1;
        }
        mapping.insert(key.to_string(), value);
    }

    mapping
}

fn lossy_string(value: Vec<u8>) -> String {
    match String::from_utf8(value) {
        Ok(value) => value,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Decodes the body of a quoted string.
fn unescape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        if raw[i] != b'\\' {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        i += 1;
        let Some(&c) = raw.get(i) else {
            break;
        };
        match c {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'0'..=b'7' => {
                let mut digits = 1;
                while digits < 3 && i + digits < raw.len() && is_octal(raw[i + digits]) {
                    digits += 1;
                }
                // Three-digit escapes only go up to \377.
                if digits == 3 && c > b'3' {
                    digits -= 1;
                }
                let value = raw[i..i + digits]
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += digits;
                continue;
            }
            other => out.push(other),
        }
        i += 1;
    }

    out
}

fn is_octal(b: u8) -> bool {
    (b'0'..=b'7').contains(&b)
}

/// Encodes a value as a control-port quoted string, including the quotes.
///
/// This is the inverse of the quoted-string handling in
/// [`parse_reply_mapping`]: backslash and double quote are escaped, `\n`,
/// `\t` and `\r` use their short forms, and other control bytes are written
/// as three-digit octal escapes.
///
/// # Example
///
/// ```rust
/// use onion_control::reply::quote_string;
///
/// assert_eq!(quote_string(r#"pa"ss"#), r#""pa\"ss""#);
/// ```
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() => out.push_str(&format!("\\{:03o}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Strips everything but printable ASCII from text destined for the log.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reply_line() {
        assert_eq!(
            split_reply_line("AUTH METHODS=NULL COOKIEFILE=\"x\""),
            ("AUTH", "METHODS=NULL COOKIEFILE=\"x\"")
        );
        assert_eq!(split_reply_line("OK"), ("OK", ""));
        assert_eq!(split_reply_line(""), ("", ""));
        assert_eq!(split_reply_line("VERSION "), ("VERSION", ""));
    }

    #[test]
    fn test_parse_plain_and_quoted() {
        let m = parse_reply_mapping(r#"K1="v1" K2=v2"#);
        assert_eq!(m.len(), 2);
        assert_eq!(m["K1"], "v1");
        assert_eq!(m["K2"], "v2");
    }

    #[test]
    fn test_parse_unquoted_value_may_contain_equals() {
        let m = parse_reply_mapping("PrivateKey=ED25519-V3:abc+/= ServiceID=xyz");
        assert_eq!(m["PrivateKey"], "ED25519-V3:abc+/=");
        assert_eq!(m["ServiceID"], "xyz");
    }

    #[test]
    fn test_parse_protocolinfo_auth_line() {
        let (kind, rest) = split_reply_line(
            r#"AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/home/x/.tor/control_auth_cookie""#,
        );
        assert_eq!(kind, "AUTH");
        let m = parse_reply_mapping(rest);
        assert_eq!(m["METHODS"], "COOKIE,SAFECOOKIE");
        assert_eq!(m["COOKIEFILE"], "/home/x/.tor/control_auth_cookie");
    }

    #[test]
    fn test_trailing_arguments_stop_parsing() {
        let m = parse_reply_mapping("Tor=\"0.4.8.9\" some trailing args");
        assert_eq!(m.len(), 1);
        assert_eq!(m["Tor"], "0.4.8.9");
    }

    #[test]
    fn test_bare_token_at_end_is_invalid() {
        assert!(parse_reply_mapping("KEY=value BARE").is_empty());
        assert!(parse_reply_mapping("BARE").is_empty());
    }

    #[test]
    fn test_unterminated_quote_is_invalid() {
        assert!(parse_reply_mapping(r#"K="never closed"#).is_empty());
        assert!(parse_reply_mapping(r#"K="escaped end\""#).is_empty());
    }

    #[test]
    fn test_escapes() {
        let m = parse_reply_mapping(r#"K="a\nb\tc\rd\"e\\f\qg""#);
        assert_eq!(m["K"], "a\nb\tc\rd\"e\\fqg");
    }

    #[test]
    fn test_even_backslash_run_does_not_escape_quote() {
        let m = parse_reply_mapping(r#"K="x\\" L=1"#);
        assert_eq!(m["K"], "x\\");
        assert_eq!(m["L"], "1");
    }

    #[test]
    fn test_octal_escapes() {
        assert_eq!(parse_reply_mapping(r#"K="\101""#)["K"], "A");
        assert_eq!(parse_reply_mapping(r#"K="\12x""#)["K"], "\nx");
        assert_eq!(parse_reply_mapping(r#"K="\0""#)["K"], "\0");
        // \477 is \47 followed by a literal '7'
        assert_eq!(parse_reply_mapping(r#"K="\477""#)["K"], "'7");
        // At most three digits are consumed
        assert_eq!(parse_reply_mapping(r#"K="\1011""#)["K"], "A1");
    }

    #[test]
    fn test_octal_escapes_rebuild_utf8() {
        let m = parse_reply_mapping(r#"COOKIEFILE="/home/caf\303\251/cookie""#);
        assert_eq!(m["COOKIEFILE"], "/home/café/cookie");
    }

    #[test]
    fn test_octal_escapes_keep_high_bytes() {
        let m = parse_reply_mapping_raw(
            r#"COOKIEFILE="/var/lib/caf\351/control_auth_cookie" K="\377""#,
        );
        assert_eq!(m["K"], vec![0xffu8]);
        assert_eq!(m["COOKIEFILE"], b"/var/lib/caf\xe9/control_auth_cookie".to_vec());

        // The string view stays lossy.
        assert_eq!(parse_reply_mapping(r#"K="\377""#)["K"], "\u{fffd}");
    }

    #[test]
    fn test_raw_and_string_mappings_agree_on_utf8() {
        let line = r#"METHODS=NULL COOKIEFILE="/home/caf\303\251/cookie" Tor="0.4.8.9""#;
        let raw = parse_reply_mapping_raw(line);
        let text = parse_reply_mapping(line);
        assert_eq!(raw.len(), text.len());
        for (key, value) in &text {
            assert_eq!(&raw[key], value.as_bytes());
        }
        assert!(parse_reply_mapping_raw("BARE").is_empty());
    }

    #[test]
    fn test_quote_string() {
        assert_eq!(quote_string("plain"), "\"plain\"");
        assert_eq!(quote_string("a\"b\\c"), r#""a\"b\\c""#);
        assert_eq!(quote_string("line\n"), r#""line\n""#);
        assert_eq!(quote_string("\x01"), r#""\001""#);
    }

    #[test]
    fn test_reply_flags() {
        let mut reply = ControlReply::new(250, vec!["OK".to_string()]);
        assert!(reply.is_ok());
        assert!(!reply.is_async());
        reply.clear();
        assert_eq!(reply.code, 0);
        assert!(reply.lines.is_empty());
        assert!(ControlReply::new(650, vec![]).is_async());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("ok\x1b[31mred\r\n"), "ok[31mred");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn quoted_values_survive_parsing(value in "\\PC*", ctrl in "[\\x00-\\x1f\"\\\\ ]{0,8}") {
            let value = format!("{}{}", value, ctrl);
            let line = format!("First={} Second=plain", quote_string(&value));
            let m = parse_reply_mapping(&line);
            prop_assert_eq!(m.get("First"), Some(&value));
            prop_assert_eq!(m.get("Second").map(String::as_str), Some("plain"));
        }

        #[test]
        fn unquoted_values_survive_parsing(
            pairs in prop::collection::btree_map("[A-Za-z]{1,8}", "[!-~&&[^\"]][!-~]{0,16}", 1..6)
        ) {
            let line = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" ");
            prop_assert_eq!(parse_reply_mapping(&line), pairs);
        }

        #[test]
        fn parsing_never_panics(input in "\\PC{0,64}") {
            let _ = parse_reply_mapping(&input);
            let _ = split_reply_line(&input);
        }
    }
}
