// normalize.rs — Canonical text form shared by the text and audio paths.
//
// Typed, OCR'd-by-eye and transcribed input all go through the same cleanup so
// their embeddings are comparable:
// 1. Lowercase
// 2. Undo common leetspeak substitutions (h3ll0 -> hello)
// 3. Drop everything outside [a-z0-9], whitespace and ?!.,
// 4. Collapse punctuation runs to their first mark (!!! -> !, ?! -> ?)
// 5. Collapse whitespace runs to one space, trim the ends
//
// The order matters: substitution runs before filtering so '$' and '@' survive
// as letters, and punctuation is collapsed before whitespace so "! !" stays two
// separate marks.

use std::fmt;

use serde::Serialize;

const LEETSPEAK: [(char, char); 6] = [('@', 'a'), ('0', 'o'), ('1', 'i'), ('3', 'e'), ('5', 's'), ('$', 's')];

/// Text that has been through [`normalize`].
///
/// Guarantees: only `[a-z0-9 ?!.,]`, no two adjacent punctuation marks, no
/// double spaces, no leading/trailing space. Only `normalize` constructs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct NormalizedText(String);

impl NormalizedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NormalizedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize free-form text. Total: `None` and `""` give an empty result.
pub fn normalize(text: Option<&str>) -> NormalizedText {
    let Some(text) = text else {
        return NormalizedText::default();
    };
    if text.is_empty() {
        return NormalizedText::default();
    }

    let lowered = text.to_lowercase();
    let substituted = substitute_leetspeak(&lowered);
    let filtered = strip_disallowed(&substituted);
    let collapsed = collapse_punctuation(&filtered);
    NormalizedText(collapse_whitespace(&collapsed))
}

pub fn is_punctuation(c: char) -> bool {
    matches!(c, '?' | '!' | '.' | ',')
}

/// Unicode whitespace plus the ASCII information separators (U+001C..=U+001F),
/// which Python's `str.isspace` also treats as whitespace.
fn is_space(c: char) -> bool {
    c.is_whitespace() || ('\u{1c}'..='\u{1f}').contains(&c)
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || is_space(c) || is_punctuation(c)
}

fn substitute_leetspeak(text: &str) -> String {
    text.chars()
        .map(|c| {
            LEETSPEAK
                .iter()
                .find(|(from, _)| *from == c)
                .map(|&(_, to)| to)
                .unwrap_or(c)
        })
        .collect()
}

fn strip_disallowed(text: &str) -> String {
    text.chars().filter(|&c| is_allowed(c)).collect()
}

fn collapse_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_was_punct = false;
    for c in text.chars() {
        let punct = is_punctuation(c);
        if !(punct && prev_was_punct) {
            out.push(c);
        }
        prev_was_punct = punct;
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split(is_space).filter(|w| !w.is_empty()).collect::<Vec<_>>().join(" ")
}
