//! Scanner for `key=value` formatted message payloads.
//!
//! Keys are runs of `[A-Za-z0-9_.-]`; stray words between pairs attach to
//! the preceding value. Values end at a comma-space, at whitespace which
//! precedes the next `key=` token, or at end of input (trailing spaces
//! trimmed). A value starting with a quote is unquoted C-string style;
//! when the closing quote is missing the quote is taken literally.

use std::borrow::Cow;

/// One scanned pair. `value` borrows the input unless unquoting or a
/// transform produced a new string.
#[derive(Debug, PartialEq, Eq)]
pub struct KvPair<'a> {
    pub key: &'a str,
    pub value: Cow<'a, str>,
    pub was_quoted: bool,
}

pub type TransformValue = fn(&str) -> String;

#[derive(Clone, Copy)]
pub struct KvScannerOptions {
    pub value_separator: u8,
    pub transform_value: Option<TransformValue>,
}

impl Default for KvScannerOptions {
    fn default() -> Self {
        KvScannerOptions {
            value_separator: b'=',
            transform_value: None,
        }
    }
}

pub struct KvScanner<'a> {
    input: &'a str,
    pos: usize,
    options: KvScannerOptions,
}

fn is_key_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || byte == b'.'
}

impl<'a> KvScanner<'a> {
    pub fn new(input: &'a str) -> KvScanner<'a> {
        Self::with_options(input, KvScannerOptions::default())
    }

    pub fn with_options(input: &'a str, options: KvScannerOptions) -> KvScanner<'a> {
        KvScanner {
            input,
            pos: 0,
            options,
        }
    }

    /// Whether `at` begins (after optional spaces) a `key=` token.
    fn at_key_boundary(&self, at: usize) -> bool {
        let bytes = self.input.as_bytes();
        let mut i = at;
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && is_key_char(bytes[i]) {
            i += 1;
        }
        if i == key_start {
            return false;
        }
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        i < bytes.len() && bytes[i] == self.options.value_separator
    }

    /// Find the next `key=`, returning the key and the position right
    /// after the separator. Words not followed by the separator are
    /// skipped.
    fn locate_key(&self) -> Option<(&'a str, usize)> {
        let bytes = self.input.as_bytes();
        let mut i = self.pos;
        while i < bytes.len() {
            if !is_key_char(bytes[i]) {
                i += 1;
                continue;
            }
            let start = i;
            while i < bytes.len() && is_key_char(bytes[i]) {
                i += 1;
            }
            // Spaces between the key and the separator are trimmed.
            let mut j = i;
            while j < bytes.len() && bytes[j] == b' ' {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == self.options.value_separator {
                return Some((&self.input[start..i], j + 1));
            }
        }
        None
    }

    /// Unquote a C-string style quoted value beginning at `at` (which
    /// holds the opening quote). Returns the unquoted content and the
    /// position after the closing quote, or None when the quote is never
    /// closed.
    fn parse_quoted(&self, at: usize) -> Option<(String, usize)> {
        let bytes = self.input.as_bytes();
        let quote = bytes[at];
        let mut value = String::new();
        let mut i = at + 1;
        while i < bytes.len() {
            match bytes[i] {
                b if b == quote => return Some((value, i + 1)),
                b'\\' if i + 1 < bytes.len() => {
                    let escaped = bytes[i + 1];
                    match escaped {
                        b'b' => value.push('\u{8}'),
                        b'f' => value.push('\u{c}'),
                        b'n' => value.push('\n'),
                        b'r' => value.push('\r'),
                        b't' => value.push('\t'),
                        b'\\' | b'"' | b'\'' => value.push(escaped as char),
                        _ => {
                            value.push('\\');
                            value.push(escaped as char);
                        }
                    }
                    i += 2;
                }
                _ => {
                    // Multi-byte characters pass through untouched.
                    let ch = self.input[i..].chars().next().expect("in-bounds char");
                    value.push(ch);
                    i += ch.len_utf8();
                }
            }
        }
        None
    }

    fn parse_value(&mut self, after_sep: usize) -> (Cow<'a, str>, bool) {
        let bytes = self.input.as_bytes();
        let mut pos = after_sep;
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }

        // The next token may itself be a `key=`; this value is empty then.
        if self.at_key_boundary(pos) {
            self.pos = pos;
            return (Cow::Borrowed(""), false);
        }

        if pos < bytes.len() && (bytes[pos] == b'"' || bytes[pos] == b'\'') {
            if let Some((value, end)) = self.parse_quoted(pos) {
                self.pos = end;
                return (Cow::Owned(value), true);
            }
            // Unclosed quote: taken literally, scanned as unquoted.
        }

        let start = pos;
        let mut i = pos;
        loop {
            if i >= bytes.len() {
                self.pos = i;
                return (
                    Cow::Borrowed(self.input[start..].trim_end_matches(' ')),
                    false,
                );
            }
            if bytes[i] == b',' && i + 1 < bytes.len() && bytes[i + 1] == b' ' {
                self.pos = i + 1;
                return (Cow::Borrowed(&self.input[start..i]), false);
            }
            if bytes[i] == b' ' && self.at_key_boundary(i) {
                self.pos = i;
                return (Cow::Borrowed(&self.input[start..i]), false);
            }
            i += 1;
        }
    }
}

impl<'a> Iterator for KvScanner<'a> {
    type Item = KvPair<'a>;

    fn next(&mut self) -> Option<KvPair<'a>> {
        let (key, after_sep) = self.locate_key()?;
        let (value, was_quoted) = self.parse_value(after_sep);
        let value = match self.options.transform_value {
            Some(transform) => Cow::Owned(transform(&value)),
            None => value,
        };
        Some(KvPair {
            key,
            value,
            was_quoted,
        })
    }
}
