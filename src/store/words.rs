//! Content tokenizer feeding the full-text word index.
//!
//! Splits on non-alphanumerics and lower-cases. Whole words that are URLs,
//! `nostr:` URIs, bech32-style mention references or `#[n]` positional
//! mentions are discarded before splitting; tokens shorter than two
//! characters or that are 64-char hex strings are discarded after.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::Event;

/// Minimum indexed token length in characters.
pub const MIN_TOKEN: usize = 2;

/// Maximum indexed token length in bytes; longer tokens are truncated.
pub const MAX_TOKEN: usize = 24;

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(https?://|www\.)").expect("url pattern"));

static NOSTR_URI: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^nostr:").expect("uri pattern"));

static BECH32_MENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(npub1|nsec1|note1|nevent1|nprofile1|naddr1)[0-9a-z]+$")
        .expect("mention pattern")
});

static POSITIONAL_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#\[\d+\]$").expect("positional pattern"));

static HEX64: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").expect("hex pattern"));

/// Tokenize free text into the sorted, deduplicated token list used for
/// both indexing and query matching.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split_whitespace() {
        if URL.is_match(word)
            || NOSTR_URI.is_match(word)
            || BECH32_MENTION.is_match(word)
            || POSITIONAL_MENTION.is_match(word)
        {
            continue;
        }
        for raw in word.split(|c: char| !c.is_alphanumeric()) {
            if raw.chars().count() < MIN_TOKEN || HEX64.is_match(raw) {
                continue;
            }
            let mut token = raw.to_lowercase();
            if token.len() > MAX_TOKEN {
                let mut cut = MAX_TOKEN;
                while !token.is_char_boundary(cut) {
                    cut -= 1;
                }
                token.truncate(cut);
            }
            out.push(token);
        }
    }
    out.sort();
    out.dedup();
    out
}

/// Tokens of an event: its content plus the values of its `t` tags.
pub fn event_tokens(event: &Event) -> Vec<String> {
    let mut out = tokenize(&event.content);
    for value in event.tag_values("t") {
        out.extend(tokenize(value));
    }
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tokenization() {
        assert_eq!(tokenize("Alpha beta ALPHA"), vec!["alpha", "beta"]);
        assert_eq!(tokenize("mixed-case words"), vec!["case", "mixed", "words"]);
        assert_eq!(tokenize(""), Vec::<String>::new());
    }

    #[test]
    fn test_short_tokens_dropped() {
        assert_eq!(tokenize("a I x yz"), vec!["yz"]);
    }

    #[test]
    fn test_urls_dropped_whole() {
        assert_eq!(
            tokenize("Alpha beta https://example.com"),
            vec!["alpha", "beta"]
        );
        assert_eq!(tokenize("see www.example.org #[1]"), vec!["see"]);
    }

    #[test]
    fn test_hex_and_mentions_dropped() {
        let hex = "deadbeef".repeat(8);
        assert_eq!(tokenize(&format!("alpha {hex}")), vec!["alpha"]);
        assert_eq!(
            tokenize("beta and GAMMA with nostr:nevent1qqsxyz"),
            vec!["and", "beta", "gamma", "with"]
        );
        assert_eq!(tokenize("npub1xyzabc alone"), vec!["alone"]);
        assert_eq!(tokenize(&hex), Vec::<String>::new());
    }

    #[test]
    fn test_long_tokens_truncated() {
        let long = "x".repeat(40);
        let tokens = tokenize(&long);
        assert_eq!(tokens, vec!["x".repeat(MAX_TOKEN)]);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // 13 two-byte characters: 26 bytes, boundary falls inside a char
        let text = "é".repeat(13);
        let tokens = tokenize(&text);
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].len() <= MAX_TOKEN);
        assert!(tokens[0].chars().all(|c| c == 'é'));
    }
}
