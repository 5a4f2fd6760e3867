//! Label text rules.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::ContactError;

static SCHEME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*:").ok());

/// Trim and check one label. Labels are bare tokens (`Business`) or URIs (`wab:Spouse`).
pub fn normalize_label(label: &str) -> Result<String, ContactError> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Err(ContactError::InvalidArgument(
            "Labels cannot be empty".to_string(),
        ));
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '<' | '>' | '"'))
    {
        return Err(ContactError::InvalidArgument(format!(
            "'{trimmed}' is not a valid label"
        )));
    }
    let has_scheme = SCHEME
        .as_ref()
        .map(|re| re.is_match(trimmed))
        .unwrap_or(false);
    if has_scheme {
        Url::parse(trimmed)?;
    }
    Ok(trimmed.to_string())
}

/// Normalize `labels` and drop any already in `existing` or repeated, comparing
/// case-insensitively.
pub fn new_labels<S: AsRef<str>>(
    existing: &[String],
    labels: &[S],
) -> Result<Vec<String>, ContactError> {
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        let label = normalize_label(label.as_ref())?;
        let seen = existing
            .iter()
            .chain(out.iter())
            .any(|have| have.eq_ignore_ascii_case(&label));
        if !seen {
            out.push(label);
        }
    }
    Ok(out)
}
