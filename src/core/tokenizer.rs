use std::cmp::Ordering;

use regex::Regex;
use tracing::{debug, warn};

use crate::core::error::{ClipError, Result};
use crate::core::types::{ClipContext, TokenIndex, Tokenization, Tokenizer, UnknownPiece, Vocab};

pub const START_OF_TEXT: &str = "<|startoftext|>";
pub const END_OF_TEXT: &str = "<|endoftext|>";
pub const END_OF_WORD: &str = "</w>";

// Contractions, letters, digits, other symbols, each optionally after one space, then whitespace.
// A whitespace run followed by a non-space gives its last character back to the next span, see
// `pre_tokenize`; the `regex` crate has no look-ahead to express that inline.
const BASE_PATTERN: &str = r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

impl Ord for TokenIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl PartialOrd for TokenIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn is_special(token: &[u8]) -> bool {
    token.len() > 4 && token.starts_with(b"<|") && token.ends_with(b"|>")
}

impl Vocab {
    /// Build from tokens in id order (id = position).
    pub fn from_tokens(tokens: Vec<Vec<u8>>) -> Self {
        let mut sorted_vocab: Vec<TokenIndex> = tokens.iter()
            .enumerate()
            .map(|(id, bytes)| TokenIndex { bytes: bytes.clone(), id })
            .collect();
        sorted_vocab.sort();

        let mut special_tokens: Vec<String> = tokens.iter()
            .filter(|t| is_special(t))
            .filter_map(|t| String::from_utf8(t.clone()).ok())
            .collect();
        sort_special(&mut special_tokens);

        let mut vocab = Vocab {
            id_to_token: tokens,
            sorted_vocab,
            special_tokens,
            start_id: 0,
            end_id: 0,
        };
        let n = vocab.len();
        vocab.start_id = vocab.lookup(START_OF_TEXT.as_bytes()).unwrap_or(n.saturating_sub(2));
        vocab.end_id = vocab.lookup(END_OF_TEXT.as_bytes()).unwrap_or(n.saturating_sub(1));
        vocab
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn lookup(&self, bytes: &[u8]) -> Option<usize> {
        // efficiently find the perfect match for bytes in vocab,
        // return its index or None if not found
        self.sorted_vocab.binary_search_by(|token| token.bytes.as_slice().cmp(bytes))
            .ok()
            .map(|index| self.sorted_vocab[index].id)
    }

    pub fn token(&self, id: usize) -> Option<&[u8]> {
        self.id_to_token.get(id).map(Vec::as_slice)
    }
}

// longest first so a special token never loses to one of its own prefixes
fn sort_special(special_tokens: &mut Vec<String>) {
    special_tokens.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    special_tokens.dedup();
}

fn build_pattern(special_tokens: &[String]) -> Result<Regex> {
    let mut pattern = String::new();
    for special in special_tokens {
        pattern.push_str(&regex::escape(special));
        pattern.push('|');
    }
    pattern.push_str(BASE_PATTERN);
    Regex::new(&pattern).map_err(|e| ClipError::InvalidFormat(format!("tokenizer pattern: {e}")))
}

impl Tokenizer {
    pub fn new(vocab: Vocab) -> Result<Self> {
        let pattern = build_pattern(&vocab.special_tokens)?;
        Ok(Tokenizer { vocab, pattern })
    }

    /// Treat `token` as one indivisible span from now on.
    pub fn add_special_token(&mut self, token: &str) -> Result<()> {
        if token.is_empty() {
            return Err(ClipError::InvalidInput("special token is empty".to_string()));
        }
        if self.vocab.lookup(token.as_bytes()).is_none() {
            warn!(token, "special token is not in the vocabulary, it will be split");
        }
        let mut special_tokens = self.vocab.special_tokens.clone();
        special_tokens.push(token.to_string());
        sort_special(&mut special_tokens);
        self.pattern = build_pattern(&special_tokens)?;
        self.vocab.special_tokens = special_tokens;
        Ok(())
    }

    /// Split `text` into word-like spans, returned with their byte offsets.
    pub fn pre_tokenize<'t>(&self, text: &'t str) -> Vec<(usize, &'t str)> {
        let mut spans = Vec::new();
        let mut pos = 0;
        while let Some(m) = self.pattern.find_at(text, pos) {
            let span = m.as_str();
            let mut end = m.end();
            // `\s+(?!\S)`: a run that is followed by a non-space keeps all but its last character
            if end < text.len() && span.chars().all(char::is_whitespace) {
                if let Some(last) = span.chars().last() {
                    if span.len() > last.len_utf8() {
                        end -= last.len_utf8();
                    }
                }
            }
            spans.push((m.start(), &text[m.start()..end]));
            pos = end;
        }
        spans
    }

    pub fn encode(&self, text: &str) -> Tokenization {
        let vocab = &self.vocab;
        let mut ids = vec![vocab.start_id];
        let mut unknown = Vec::new();

        for (offset, word) in self.pre_tokenize(text) {
            // feel lucky? the whole word may be a single token
            let mut full_word = word.strip_prefix(' ').unwrap_or(word).as_bytes().to_vec();
            full_word.extend_from_slice(END_OF_WORD.as_bytes());
            if let Some(id) = vocab.lookup(&full_word) {
                ids.push(id);
                continue;
            }

            // greedy longest match from the left
            let bytes = word.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                let longest = (i + 1..=bytes.len())
                    .rev()
                    .find_map(|j| vocab.lookup(&bytes[i..j]).map(|id| (id, j)));
                match longest {
                    Some((id, j)) => {
                        ids.push(id);
                        i = j;
                    }
                    None => {
                        warn!(offset = offset + i, byte = bytes[i], "unknown token byte skipped");
                        unknown.push(UnknownPiece { offset: offset + i, byte: bytes[i] });
                        i += 1;
                    }
                }
            }
        }

        ids.push(vocab.end_id);
        debug!(n_tokens = ids.len(), "tokenized");
        Tokenization { ids, unknown }
    }

    pub fn decode(&self, ids: &[usize]) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            if id == self.vocab.start_id || id == self.vocab.end_id {
                continue;
            }
            let Some(token) = self.vocab.token(id) else {
                continue;
            };
            match token.strip_suffix(END_OF_WORD.as_bytes()) {
                Some(word) => {
                    bytes.extend_from_slice(word);
                    bytes.push(b' ');
                }
                None => bytes.extend_from_slice(token),
            }
        }
        String::from_utf8_lossy(&bytes).trim_end().to_string()
    }
}

impl ClipContext {
    pub fn tokenize(&self, text: &str) -> Vec<usize> {
        self.tokenizer.encode(text).ids
    }

    /// Like `tokenize`, also reporting every input byte that was dropped.
    pub fn tokenize_detailed(&self, text: &str) -> Tokenization {
        self.tokenizer.encode(text)
    }

    pub fn decode(&self, ids: &[usize]) -> String {
        self.tokenizer.decode(ids)
    }

    pub fn add_special_token(&mut self, token: &str) -> Result<()> {
        self.tokenizer.add_special_token(token)
    }
}
