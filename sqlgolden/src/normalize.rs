//! Normalization of volatile output.
//!
//! Expected and actual output go through the same [`Normalizer`] before they are compared.
//! Environment dependent values are collapsed into their symbolic names (see [`VolatileTokens`])
//! and the enabled [`VolatilePattern`]s replace generated text with fixed placeholders. Since the
//! rewriter writes normalized output, regenerated files carry the placeholders, not the values of
//! the machine that regenerated them.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use itertools::Itertools;
use regex::Regex;

/// Symbol of the workspace root in expected output.
pub const WORKSPACE_ROOT: &str = "WORKSPACE_ROOT";

/// Environment variable supplying the value of [`WORKSPACE_ROOT`].
pub const WORKSPACE_ROOT_ENV: &str = "SQLGOLDEN_WORKSPACE_ROOT";

/// Symbolic names and the values they stand for in the current run environment.
///
/// Read-only once a run starts; shared between file workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolatileTokens {
    /// `(symbol, value)`, kept sorted by descending value length.
    tokens: Vec<(String, String)>,
}

impl VolatileTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding [`WORKSPACE_ROOT`], taken from [`WORKSPACE_ROOT_ENV`] or else the current
    /// directory.
    pub fn from_env() -> Self {
        let root = std::env::var(WORKSPACE_ROOT_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|d| d.to_string_lossy().into_owned())
            });
        let mut tokens = Self::new();
        if let Some(root) = root {
            tokens.insert(WORKSPACE_ROOT, root);
        }
        tokens
    }

    /// Sets the workspace root explicitly.
    pub fn with_workspace_root(mut self, root: impl AsRef<Path>) -> Self {
        self.insert(WORKSPACE_ROOT, root.as_ref().to_string_lossy());
        self
    }

    /// Binds `symbol` to `value`, replacing a previous binding of the symbol.
    ///
    /// Trailing path separators are not part of the value. Empty values are ignored.
    pub fn insert(&mut self, symbol: impl Into<String>, value: impl Into<String>) {
        let symbol = symbol.into();
        let value = value.into();
        let value = match value.trim_end_matches('/') {
            "" => return,
            trimmed => trimmed.to_string(),
        };
        self.tokens.retain(|(s, _)| *s != symbol);
        self.tokens.push((symbol, value));
        self.tokens
            .sort_by(|(_, l), (_, r)| r.len().cmp(&l.len()).then_with(|| l.cmp(r)));
    }

    pub fn get(&self, symbol: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Replaces every value by its symbol. Longer values are replaced first.
    ///
    /// A value only matches a whole path prefix: `/home/ci/work` does not match inside
    /// `/home/ci/workspace`.
    pub fn collapse<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut text = Cow::Borrowed(text);
        for (symbol, value) in &self.tokens {
            if let Some(collapsed) = replace_bounded(&text, value, symbol) {
                text = Cow::Owned(collapsed);
            }
        }
        text
    }

    /// Replaces every symbol by its value.
    pub fn expand<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut text = Cow::Borrowed(text);
        for (symbol, value) in &self.tokens {
            if text.contains(symbol.as_str()) {
                text = Cow::Owned(text.replace(symbol.as_str(), value));
            }
        }
        text
    }
}

/// Replaces the occurrences of `value` in `text` that are not followed by a file name character.
/// Returns `None` when nothing was replaced.
fn replace_bounded(text: &str, value: &str, symbol: &str) -> Option<String> {
    let continues_name = |c: char| c.is_alphanumeric() || matches!(c, '_' | '-' | '.');
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, _) in text.match_indices(value) {
        let end = start + value.len();
        if text[end..].starts_with(continues_name) {
            continue;
        }
        out.push_str(&text[last..start]);
        out.push_str(symbol);
        last = end;
    }
    if last == 0 {
        return None;
    }
    out.push_str(&text[last..]);
    Some(out)
}

/// Generated text that never compares equal across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolatilePattern {
    /// Byte ranges of scanned files, `:1024..2048`.
    ByteRanges,
    /// Timestamps such as `2024-05-01T12:00:00.123Z`.
    Timestamps,
    /// Dumps of struct literals such as `{c0: 1, c1: foo}`.
    StructLiterals,
}

impl VolatilePattern {
    pub const ALL: [VolatilePattern; 3] = [
        VolatilePattern::ByteRanges,
        VolatilePattern::Timestamps,
        VolatilePattern::StructLiterals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ByteRanges => "byte-ranges",
            Self::Timestamps => "timestamps",
            Self::StructLiterals => "struct-literals",
        }
    }

    pub fn placeholder(&self) -> &'static str {
        match self {
            Self::ByteRanges => ":BYTE_RANGE",
            Self::Timestamps => "TIMESTAMP",
            Self::StructLiterals => "{STRUCT_LITERAL}",
        }
    }

    fn regex(&self) -> &'static Regex {
        static BYTE_RANGES: OnceLock<Regex> = OnceLock::new();
        static TIMESTAMPS: OnceLock<Regex> = OnceLock::new();
        static STRUCT_LITERALS: OnceLock<Regex> = OnceLock::new();

        let (cell, pattern) = match self {
            Self::ByteRanges => (&BYTE_RANGES, r":\d+\.\.\d+"),
            Self::Timestamps => (
                &TIMESTAMPS,
                r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
            ),
            Self::StructLiterals => (
                &STRUCT_LITERALS,
                r"\{[A-Za-z_][A-Za-z0-9_]*: [^{}]*\}",
            ),
        };
        cell.get_or_init(|| Regex::new(pattern).expect("builtin pattern should be valid"))
    }

    fn apply<'a>(&self, text: Cow<'a, str>) -> Cow<'a, str> {
        let regex = self.regex();
        if !regex.is_match(&text) {
            return text;
        }
        Cow::Owned(regex.replace_all(&text, self.placeholder()).into_owned())
    }
}

impl fmt::Display for VolatilePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown volatile pattern: {0:?}, expected one of: {}", VolatilePattern::ALL.iter().join(", "))]
pub struct UnknownPattern(String);

impl FromStr for VolatilePattern {
    type Err = UnknownPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPattern(s.to_string()))
    }
}

/// Canonicalizes text before it is compared or written back to a test file.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    tokens: Arc<VolatileTokens>,
    patterns: Vec<VolatilePattern>,
}

impl Normalizer {
    pub fn new(tokens: VolatileTokens) -> Self {
        Self {
            tokens: Arc::new(tokens),
            patterns: vec![],
        }
    }

    /// Enables a pattern. Patterns are applied in the order they were enabled.
    #[must_use]
    pub fn with_pattern(mut self, pattern: VolatilePattern) -> Self {
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
        self
    }

    pub fn tokens(&self) -> &Arc<VolatileTokens> {
        &self.tokens
    }

    pub fn patterns(&self) -> &[VolatilePattern] {
        &self.patterns
    }

    pub fn normalize<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let text = self.tokens.collapse(text);
        self.patterns
            .iter()
            .fold(text, |text, pattern| pattern.apply(text))
    }

    /// Normalizes a query cell or result line. Surrounding whitespace is dropped and inner runs of
    /// whitespace are collapsed into one space.
    pub fn normalize_cell(&self, cell: &str) -> String {
        let cell = cell.split_ascii_whitespace().join(" ");
        self.normalize(&cell).into_owned()
    }

    /// Normalizes a plan line. Whitespace is significant in plans and kept as is.
    pub fn normalize_plan_line(&self, line: &str) -> String {
        self.normalize(line).into_owned()
    }
}
