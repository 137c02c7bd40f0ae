//! Stream Transform Pipeline
//!
//! Builds the inspector (match logging) and mutator (regex substitution)
//! applied by the relay pumps to every chunk they forward.
//!
//! Both stages work on the chunk delivered by a single read. A pattern whose
//! occurrence straddles two reads is neither reported nor replaced; buffering
//! across reads would trade that for unbounded memory and added latency.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::bytes::Regex;
use tracing::{info, warn};

use crate::error::{RelayError, RelayResult};

/// Separator between pattern and replacement in a replace expression
pub const REPLACE_SEPARATOR: char = '~';

/// A single occurrence reported by the inspector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEvent {
    pub id: u64,
    pub text: String,
}

/// Read-only pattern matcher. Reports matches, never touches the bytes.
#[derive(Debug)]
pub struct Inspector {
    pattern: Regex,
    next_match_id: AtomicU64,
}

impl Inspector {
    /// Compile an inspector from a match expression
    pub fn new(expr: &str) -> RelayResult<Self> {
        let pattern = Regex::new(expr)
            .map_err(|e| RelayError::config(format!("invalid match regex: {}", e)))?;
        Ok(Self {
            pattern,
            next_match_id: AtomicU64::new(0),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Find every non-overlapping match in `chunk` and log it.
    ///
    /// Match ids are shared by every session using this inspector and are
    /// strictly increasing.
    pub fn inspect(&self, chunk: &[u8]) -> Vec<MatchEvent> {
        self.pattern
            .find_iter(chunk)
            .map(|m| {
                let id = self.next_match_id.fetch_add(1, Ordering::Relaxed) + 1;
                let text = String::from_utf8_lossy(m.as_bytes()).into_owned();
                info!("Match #{}: {}", id, text);
                MatchEvent { id, text }
            })
            .collect()
    }

    /// Number of matches reported so far
    pub fn match_count(&self) -> u64 {
        self.next_match_id.load(Ordering::Relaxed)
    }
}

/// Pattern based rewriter applied to each chunk before it is forwarded
#[derive(Debug)]
pub struct Mutator {
    pattern: Regex,
    replacement: Vec<u8>,
}

impl Mutator {
    /// Compile a mutator from a `pattern~replacement` expression.
    ///
    /// `\~` stands for a literal tilde on either side of the separator.
    pub fn new(expr: &str) -> RelayResult<Self> {
        let (pattern, replacement) = split_replace_expr(expr)?;
        let pattern = Regex::new(&pattern)
            .map_err(|e| RelayError::config(format!("invalid replace regex: {}", e)))?;
        Ok(Self {
            pattern,
            replacement: replacement.into_bytes(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }

    /// Replace every non-overlapping match inside `chunk`.
    ///
    /// Capture references such as `$1` or `${name}` in the replacement are
    /// expanded. Borrowed output means nothing matched.
    pub fn apply<'a>(&self, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        self.pattern.replace_all(chunk, self.replacement.as_slice())
    }
}

/// Split a replace expression on its unescaped separator.
///
/// Exactly one unescaped `~` is required.
pub fn split_replace_expr(expr: &str) -> RelayResult<(String, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = expr.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&REPLACE_SEPARATOR) => {
                chars.next();
                current.push(REPLACE_SEPARATOR);
            }
            REPLACE_SEPARATOR => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    parts.push(current);

    if parts.len() != 2 {
        return Err(RelayError::config(format!(
            "invalid replace option '{}': expected 'regex{}replacement', found {} part(s)",
            expr,
            REPLACE_SEPARATOR,
            parts.len()
        )));
    }

    let replacement = parts.pop().unwrap_or_default();
    let pattern = parts.pop().unwrap_or_default();
    Ok((pattern, replacement))
}

/// Build the inspector for a match expression.
///
/// An empty expression disables inspection. An invalid one is reported and
/// also disables inspection; the relay keeps running.
pub fn build_inspector(expr: &str) -> Option<Inspector> {
    if expr.is_empty() {
        return None;
    }
    match Inspector::new(expr) {
        Ok(inspector) => {
            info!("Matching {}", inspector.pattern());
            Some(inspector)
        }
        Err(e) => {
            warn!("{}; match logging disabled", e);
            None
        }
    }
}

/// Build the mutator for a replace expression, same degradation rules as
/// [`build_inspector`].
pub fn build_mutator(expr: &str) -> Option<Mutator> {
    if expr.is_empty() {
        return None;
    }
    match Mutator::new(expr) {
        Ok(mutator) => {
            info!(
                "Replacing {} with {}",
                mutator.pattern(),
                String::from_utf8_lossy(mutator.replacement())
            );
            Some(mutator)
        }
        Err(e) => {
            warn!("{}; replacement disabled", e);
            None
        }
    }
}

/// Inspector and mutator shared read-only by every session
#[derive(Debug, Default)]
pub struct TransformPipeline {
    inspector: Option<Inspector>,
    mutator: Option<Mutator>,
}

impl TransformPipeline {
    pub fn new(inspector: Option<Inspector>, mutator: Option<Mutator>) -> Self {
        Self { inspector, mutator }
    }

    /// Build from the configured match and replace expressions
    pub fn build(match_expr: &str, replace_expr: &str) -> Self {
        Self::new(build_inspector(match_expr), build_mutator(replace_expr))
    }

    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn inspector(&self) -> Option<&Inspector> {
        self.inspector.as_ref()
    }

    pub fn mutator(&self) -> Option<&Mutator> {
        self.mutator.as_ref()
    }

    pub fn is_passthrough(&self) -> bool {
        self.inspector.is_none() && self.mutator.is_none()
    }

    /// Run a chunk through the pipeline: inspect the original bytes, then
    /// rewrite them.
    pub fn apply<'a>(&self, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        if let Some(inspector) = &self.inspector {
            inspector.inspect(chunk);
        }
        match &self.mutator {
            Some(mutator) => mutator.apply(chunk),
            None => Cow::Borrowed(chunk),
        }
    }
}
