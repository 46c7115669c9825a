//! Utterance normalization and tokenization.
//!
//! The preprocessor is a pure function from raw text to a token stream.
//! Stopwords are flagged rather than deleted so entity spans stay aligned
//! with the original text, and double-quoted literals are preserved
//! verbatim because they usually carry names or paths.

use serde::{Deserialize, Serialize};

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "to", "for", "on", "in", "at", "by", "with", "and", "or", "please",
    "me", "my", "your", "you", "i", "we", "can", "could", "would", "will", "shall", "is", "are",
    "was", "were", "be", "been", "do", "does", "did", "hey", "hi", "hello", "thanks", "thank",
];

const CONTRACTIONS: &[(&str, &[&str])] = &[
    ("don't", &["do", "not"]),
    ("doesn't", &["does", "not"]),
    ("didn't", &["did", "not"]),
    ("can't", &["can", "not"]),
    ("cannot", &["can", "not"]),
    ("won't", &["will", "not"]),
    ("isn't", &["is", "not"]),
    ("aren't", &["are", "not"]),
    ("wasn't", &["was", "not"]),
    ("shouldn't", &["should", "not"]),
    ("couldn't", &["could", "not"]),
    ("wouldn't", &["would", "not"]),
    ("it's", &["it", "is"]),
    ("that's", &["that", "is"]),
    ("what's", &["what", "is"]),
    ("i'm", &["i", "am"]),
    ("i'd", &["i", "would"]),
    ("let's", &["let", "us"]),
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Lowercased form used for matching. Quoted literals keep their
    /// original casing.
    pub normalized: String,
    /// The exact slice of the raw utterance this token came from.
    pub original: String,
    /// Byte span into the raw utterance.
    pub span: (usize, usize),
    pub stopword: bool,
    pub quoted: bool,
    /// Light suffix-stripped form, used only as an auxiliary signal for
    /// pattern scoring. Never used for entity values.
    pub stem: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStream {
    pub tokens: Vec<Token>,
    pub normalized_text: String,
}

impl TokenStream {
    /// The empty-utterance sentinel: no tokens, or nothing but stopwords.
    /// Short-circuits the rest of the pipeline with a reprompt.
    pub fn is_effectively_empty(&self) -> bool {
        self.tokens.iter().all(|token| token.stopword)
    }

    pub fn content_tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter().filter(|token| !token.stopword)
    }

    pub fn contains_normalized(&self, word: &str) -> bool {
        self.tokens.iter().any(|token| token.normalized == word)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Preprocessor;

impl Preprocessor {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, text: &str) -> TokenStream {
        let tokens = tokenize(text);
        let normalized_text = tokens
            .iter()
            .map(|token| token.normalized.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        TokenStream { tokens, normalized_text }
    }
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        let rest = &text[index..];
        let ch = rest.chars().next().unwrap_or(' ');

        if ch.is_whitespace() {
            index += ch.len_utf8();
            continue;
        }

        if ch == '"' {
            let start = index;
            if let Some(close) = text[index + 1..].find('"') {
                let inner = &text[index + 1..index + 1 + close];
                let end = index + close + 2;
                if !inner.trim().is_empty() {
                    tokens.push(quoted_token(inner, (start, end)));
                }
                index = end;
                continue;
            }
            // Unterminated quote: fall through and treat it as plain text.
            index += 1;
            continue;
        }

        let start = index;
        let mut end = index;
        for word_char in rest.chars() {
            if word_char.is_whitespace() || word_char == '"' {
                break;
            }
            end += word_char.len_utf8();
        }
        push_word(&mut tokens, &text[start..end], (start, end));
        index = end;
    }

    tokens
}

fn quoted_token(inner: &str, span: (usize, usize)) -> Token {
    Token {
        normalized: inner.to_string(),
        original: inner.to_string(),
        span,
        stopword: false,
        quoted: true,
        stem: inner.to_ascii_lowercase(),
    }
}

fn push_word(tokens: &mut Vec<Token>, raw: &str, span: (usize, usize)) {
    let is_punct = |c: char| matches!(c, '.' | ',' | '!' | '?' | ';' | ':');
    let trimmed = raw.trim_matches(is_punct);
    if trimmed.is_empty() {
        return;
    }
    // The span must keep indexing the exact slice `original` came from,
    // so it shrinks along with the punctuation trim.
    let lead = raw.len() - raw.trim_start_matches(is_punct).len();
    let span = (span.0 + lead, span.0 + lead + trimmed.len());

    let lowered = trimmed.to_ascii_lowercase();
    if let Some((_, expansion)) =
        CONTRACTIONS.iter().find(|(contraction, _)| *contraction == lowered)
    {
        for word in expansion.iter() {
            tokens.push(plain_token(word, trimmed, span));
        }
        return;
    }

    tokens.push(plain_token(&lowered, trimmed, span));
}

fn plain_token(normalized: &str, original: &str, span: (usize, usize)) -> Token {
    Token {
        normalized: normalized.to_string(),
        original: original.to_string(),
        span,
        stopword: STOPWORDS.contains(&normalized),
        quoted: false,
        stem: stem(normalized),
    }
}

/// Cheap suffix stripping. A scoring aid, nothing more.
fn stem(word: &str) -> String {
    if word.len() > 5 && word.ends_with("ing") {
        return word[..word.len() - 3].to_string();
    }
    if word.len() > 4 && word.ends_with("ed") {
        return word[..word.len() - 2].to_string();
    }
    // "-es" only follows a sibilant (boxes, statuses); elsewhere the "e"
    // belongs to the stem (services).
    if word.len() > 4 && word.ends_with("es") {
        let before = word.as_bytes()[word.len() - 3];
        if matches!(before, b's' | b'x' | b'z' | b'h') {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.len() > 3 && word.ends_with('s') {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

#[cfg(test)]
mod tests {
    use super::{Preprocessor, TokenStream};

    fn run(text: &str) -> TokenStream {
        Preprocessor::new().run(text)
    }

    #[test]
    fn empty_and_whitespace_input_hit_the_sentinel() {
        assert!(run("").is_effectively_empty());
        assert!(run("   \t ").is_effectively_empty());
    }

    #[test]
    fn stopword_only_input_hits_the_sentinel() {
        assert!(run("please can you").is_effectively_empty());
        assert!(!run("please stop the vm").is_effectively_empty());
    }

    #[test]
    fn quoted_literals_keep_their_casing() {
        let stream = run("deploy \"Media Server\" on node1");
        let quoted = stream.tokens.iter().find(|token| token.quoted).expect("quoted token");
        assert_eq!(quoted.normalized, "Media Server");
        assert_eq!(quoted.original, "Media Server");
    }

    #[test]
    fn contractions_expand_without_losing_span() {
        let stream = run("don't stop it");
        let normalized: Vec<&str> =
            stream.tokens.iter().map(|token| token.normalized.as_str()).collect();
        assert_eq!(normalized, vec!["do", "not", "stop", "it"]);
        assert_eq!(stream.tokens[0].span, stream.tokens[1].span);
    }

    #[test]
    fn spans_address_the_raw_text() {
        let text = "restart vm 100";
        let stream = run(text);
        for token in &stream.tokens {
            assert_eq!(&text[token.span.0..token.span.1], token.original);
        }
    }

    #[test]
    fn punctuation_is_trimmed_from_word_edges() {
        let stream = run("status of vm 100, please!");
        assert!(stream.contains_normalized("100"));
        assert!(!stream.contains_normalized("100,"));
    }

    #[test]
    fn stems_strip_common_suffixes() {
        let stream = run("restarting services");
        assert_eq!(stream.tokens[0].stem, "restart");
        assert_eq!(stream.tokens[1].stem, "service");
    }

    #[test]
    fn spans_index_the_exact_original_slice() {
        let text = "stop vm 100, please.";
        let stream = run(text);
        for token in &stream.tokens {
            assert_eq!(&text[token.span.0..token.span.1], token.original);
        }
        let id = stream.tokens.iter().find(|t| t.normalized == "100").expect("id token");
        assert_eq!(id.original, "100");
    }

    #[test]
    fn sibilant_plurals_lose_their_es() {
        let stream = run("statuses boxes");
        assert_eq!(stream.tokens[0].stem, "status");
        assert_eq!(stream.tokens[1].stem, "box");
    }
}
