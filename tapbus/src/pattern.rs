//! Subscription key matching.
//!
//! A key containing `*` is a wildcard: each `*` stands for any (possibly
//! empty) substring and the match is anchored at both ends. No other
//! character is special, so `items.*` only matches types that start with the
//! literal `items.`.

/// Returns `true` if `key` is a wildcard key.
#[inline]
pub fn is_wildcard(key: &str) -> bool {
    key.contains('*')
}

/// A compiled wildcard subscription key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pattern: String,
}

impl Pattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    #[inline]
    pub fn matches(&self, event_type: &str) -> bool {
        star_match(self.pattern.as_bytes(), event_type.as_bytes())
    }
}

/// Anchored match where `*` matches any byte sequence.
///
/// Operates on bytes: `*` is ASCII and every literal run in a valid UTF-8
/// pattern starts on a character boundary, so a literal can never match
/// starting inside a multi-byte character.
fn star_match(p: &[u8], t: &[u8]) -> bool {
    let mut pi = 0;
    let mut ti = 0;
    // pattern index after the last star, and the text index it is anchored to
    let mut resume: Option<(usize, usize)> = None;

    while ti < t.len() || pi < p.len() {
        if pi < p.len() {
            if p[pi] == b'*' {
                while pi < p.len() && p[pi] == b'*' {
                    pi += 1;
                }
                if pi == p.len() {
                    return true;
                }
                resume = Some((pi, ti));
                continue;
            }
            if ti < t.len() && p[pi] == t[ti] {
                pi += 1;
                ti += 1;
                continue;
            }
        }

        // mismatch: let the last star swallow one more byte
        match resume {
            Some((spi, sti)) if sti < t.len() => {
                pi = spi;
                ti = sti + 1;
                resume = Some((spi, ti));
            }
            _ => return false,
        }
    }

    true
}
