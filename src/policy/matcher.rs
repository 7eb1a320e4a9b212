//! Wildcard patterns for hosts and request paths

use crate::error::{Error, Result};

/// A compiled `*` wildcard pattern
///
/// `*` matches any run of characters, including none. Everything else is
/// literal. Host patterns are compiled case-insensitively.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: String,
    segments: Vec<Segment>,
    ignore_case: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Wildcard,
}

impl PatternMatcher {
    /// Compile a case-sensitive pattern (request paths)
    pub fn new(pattern: &str) -> Result<Self> {
        Self::compile(pattern, false)
    }

    /// Compile a host pattern; matching ignores ASCII case
    pub fn host(pattern: &str) -> Result<Self> {
        if pattern.contains(['/', ':', ' ']) {
            return Err(Error::pattern(format!(
                "host pattern {:?} may not contain '/', ':' or spaces",
                pattern
            )));
        }
        Self::compile(&pattern.to_ascii_lowercase(), true)
    }

    fn compile(pattern: &str, ignore_case: bool) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::pattern("pattern is empty"));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        for ch in pattern.chars() {
            if ch == '*' {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                if segments.last() != Some(&Segment::Wildcard) {
                    segments.push(Segment::Wildcard);
                }
            } else {
                literal.push(ch);
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
            ignore_case,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        if self.ignore_case {
            match_segments(&self.segments, &text.to_ascii_lowercase())
        } else {
            match_segments(&self.segments, text)
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

fn match_segments(segments: &[Segment], text: &str) -> bool {
    match segments.split_first() {
        None => text.is_empty(),
        Some((Segment::Literal(lit), rest)) => text
            .strip_prefix(lit.as_str())
            .is_some_and(|remaining| match_segments(rest, remaining)),
        Some((Segment::Wildcard, [])) => true,
        Some((Segment::Wildcard, rest)) => text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .any(|i| match_segments(rest, &text[i..])),
    }
}

/// A list of patterns where an empty list matches everything
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<PatternMatcher>,
}

impl PatternSet {
    pub fn hosts<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| PatternMatcher::host(p.as_ref()))
            .collect::<Result<_>>()?;
        Ok(Self { patterns })
    }

    pub fn paths<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| PatternMatcher::new(p.as_ref()))
            .collect::<Result<_>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(text))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
