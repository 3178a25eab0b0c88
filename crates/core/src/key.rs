//! Series key parsing and canonicalization (spec §3, §6).
//!
//! A series key identifies one `{application, labels}` time series. Its
//! canonical textual form is `app-name{k1=v1,k2=v2,...}`; labels are
//! sorted lexicographically by key so that two keys naming the same set
//! of `(k, v)` pairs always produce byte-identical canonical strings,
//! which is what lets the backend prefixes (`s:`, `t:`, `d:`) use the
//! canonical string directly as (part of) their on-disk key.

use std::fmt;
use thiserror::Error;

/// The reserved label holding the application name.
pub const NAME_LABEL: &str = "__name__";

/// Errors raised while parsing a series key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key string did not match `name{k=v,...}`.
    #[error("malformed series key: {0}")]
    Malformed(String),

    /// A label name or the application name contained characters outside
    /// `[A-Za-z0-9_.-]`.
    #[error("invalid label name: {0}")]
    InvalidLabelName(String),

    /// A label value contained a `,` or `}`.
    #[error("invalid label value: {0}")]
    InvalidLabelValue(String),
}

/// A canonicalized `{application, labels}` series identity.
///
/// Two `SeriesKey`s are equal iff they have identical `__name__` and an
/// identical set of `(k, v)` pairs, regardless of the order labels were
/// supplied in (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    app: String,
    // Sorted by label name; canonical form depends on this ordering.
    labels: Vec<(String, String)>,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn validate_name(s: &str) -> std::result::Result<(), KeyError> {
    if s.is_empty() || !s.chars().all(is_name_char) {
        return Err(KeyError::InvalidLabelName(s.to_string()));
    }
    Ok(())
}

fn validate_value(s: &str) -> std::result::Result<(), KeyError> {
    if s.chars().any(|c| c == ',' || c == '}' || c.is_control()) {
        return Err(KeyError::InvalidLabelValue(s.to_string()));
    }
    Ok(())
}

impl SeriesKey {
    /// Build a series key from an application name and label pairs,
    /// validating and sorting labels into canonical order.
    pub fn new(
        app: impl Into<String>,
        labels: impl IntoIterator<Item = (String, String)>,
    ) -> std::result::Result<Self, KeyError> {
        let app = app.into();
        validate_name(&app)?;
        let mut labels: Vec<(String, String)> = labels.into_iter().collect();
        for (k, v) in &labels {
            validate_name(k)?;
            validate_value(v)?;
        }
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        labels.dedup_by(|a, b| a.0 == b.0);
        Ok(SeriesKey { app, labels })
    }

    /// Parse the textual form `app{k=v,k=v,...}`. The braces and their
    /// contents may be omitted for an application with no labels.
    pub fn parse(s: &str) -> std::result::Result<Self, KeyError> {
        let s = s.trim();
        let (app, rest) = match s.find('{') {
            None => (s, None),
            Some(idx) => {
                if !s.ends_with('}') {
                    return Err(KeyError::Malformed(s.to_string()));
                }
                (&s[..idx], Some(&s[idx + 1..s.len() - 1]))
            }
        };
        validate_name(app)?;

        let mut labels = Vec::new();
        if let Some(body) = rest {
            if !body.is_empty() {
                for pair in body.split(',') {
                    let eq = pair
                        .find('=')
                        .ok_or_else(|| KeyError::Malformed(s.to_string()))?;
                    let k = &pair[..eq];
                    let v = &pair[eq + 1..];
                    validate_name(k)?;
                    validate_value(v)?;
                    labels.push((k.to_string(), v.to_string()));
                }
            }
        }
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        labels.dedup_by(|a, b| a.0 == b.0);
        Ok(SeriesKey {
            app: app.to_string(),
            labels,
        })
    }

    /// The application name (the value the reserved `__name__` label
    /// would hold).
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Label pairs in canonical (sorted-by-key) order. Does not include
    /// the implicit `__name__` pair.
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    /// Canonical string encoding, e.g. `myapp{env=prod,region=us}`.
    /// Segment keys and tree keys share this encoding; callers prefix it
    /// with their own backend namespace byte(s) (spec §6).
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.app)?;
        if !self.labels.is_empty() {
            write!(f, "{{")?;
            for (i, (k, v)) in self.labels.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{k}={v}")?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}
