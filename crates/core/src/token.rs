//! Opaque authentication tokens.
//!
//! A token is a credential. Its `Debug` and `Display` output only ever show
//! the masked form; the raw value is reachable through [`Token::expose`].

use compact_str::CompactString;
use std::fmt;

/// Number of trailing characters shown by [`Token::masked`].
pub const VISIBLE_SUFFIX_LEN: usize = 6;

/// Opaque credential identifying one ceremony participant slot.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(CompactString);

impl Token {
    /// Create a token from raw text. Surrounding whitespace is trimmed.
    /// Returns `None` for empty input.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(CompactString::new(trimmed)))
        }
    }

    /// The full credential. Only for request headers and storage.
    #[inline]
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Masked display form, e.g. `...9xyz12`.
    ///
    /// Tokens no longer than the visible suffix mask to `...` alone,
    /// since the suffix would otherwise be the whole credential.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= VISIBLE_SUFFIX_LEN {
            return "...".to_string();
        }
        let suffix: String = chars[chars.len() - VISIBLE_SUFFIX_LEN..].iter().collect();
        format!("...{}", suffix)
    }

    /// Check whether the token ends with the given (visible) suffix.
    pub fn matches_suffix(&self, suffix: &str) -> bool {
        let suffix = suffix.trim().trim_start_matches("...");
        !suffix.is_empty()
            && suffix.chars().count() <= VISIBLE_SUFFIX_LEN
            && self.0.len() > suffix.len()
            && self.0.ends_with(suffix)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Token").field(&self.masked()).finish()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Parse pasted text into tokens.
///
/// Tokens are separated by newlines or whitespace. Empty entries and
/// repeats are dropped, first occurrence order is kept.
pub fn parse_token_list(text: &str) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    for token in text.split_whitespace().filter_map(Token::new) {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}
