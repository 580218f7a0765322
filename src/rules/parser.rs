//! Parsing of the engine's active-rule listing.
//!
//! Two shapes are accepted. JSON (an array of rule objects, or an object with
//! a `rules` array) and line text, one rule per line:
//!
//! ```text
//! hide /system/app/Foo id=3
//! add /system/fonts /data/fonts id=4 flags=1
//! ```

use std::path::PathBuf;

use serde::Deserialize;

use super::{Rule, RuleFlags, RuleId, RuleKind};

/// Listing text that could not be turned into rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("active rule listing line {line}: {message}")]
pub struct ParseError {
    /// 1-based line number (0 for JSON documents).
    pub line: usize,
    /// What was wrong.
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    id: Option<u32>,
    #[serde(alias = "type")]
    kind: String,
    #[serde(alias = "src")]
    source: PathBuf,
    #[serde(default, alias = "dst", alias = "dest")]
    target: Option<PathBuf>,
    #[serde(default)]
    flags: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawListing {
    Bare(Vec<RawRule>),
    Wrapped { rules: Vec<RawRule> },
}

/// Parse an active-rule listing in either supported shape.
///
/// # Errors
///
/// Returns [`ParseError`] on malformed JSON, unknown rule kinds, or lines
/// without a source path.
pub fn parse_active_rules(text: &str) -> Result<Vec<Rule>, ParseError> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return parse_json(trimmed);
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| parse_line(index + 1, line))
        .collect()
}

fn parse_json(text: &str) -> Result<Vec<Rule>, ParseError> {
    let listing: RawListing = serde_json::from_str(text).map_err(|e| ParseError {
        line: 0,
        message: e.to_string(),
    })?;
    let raw = match listing {
        RawListing::Bare(rules) | RawListing::Wrapped { rules } => rules,
    };
    raw.into_iter()
        .map(|r| {
            let kind = r.kind.parse::<RuleKind>().map_err(|message| ParseError {
                line: 0,
                message,
            })?;
            Ok(Rule {
                id: r.id.map(RuleId::new),
                kind,
                source: r.source,
                target: r.target.filter(|t| !t.as_os_str().is_empty()),
                flags: RuleFlags::from_bits_truncate(r.flags),
            })
        })
        .collect()
}

fn parse_line(line_no: usize, line: &str) -> Result<Rule, ParseError> {
    let fail = |message: String| ParseError {
        line: line_no,
        message,
    };
    let mut tokens = line.split_whitespace();
    let kind = tokens
        .next()
        .ok_or_else(|| fail("empty line".to_owned()))?
        .parse::<RuleKind>()
        .map_err(fail)?;

    let mut id = None;
    let mut flags = RuleFlags::empty();
    let mut positional = Vec::new();
    for token in tokens {
        match token.split_once('=') {
            Some(("id", value)) => {
                let parsed = value
                    .parse::<u32>()
                    .map_err(|e| fail(format!("bad id '{value}': {e}")))?;
                id = Some(RuleId::new(parsed));
            }
            Some(("flags", value)) => {
                let bits = value
                    .parse::<u32>()
                    .map_err(|e| fail(format!("bad flags '{value}': {e}")))?;
                flags = RuleFlags::from_bits_truncate(bits);
            }
            _ => positional.push(token),
        }
    }

    let mut positional = positional.into_iter();
    let source = positional
        .next()
        .ok_or_else(|| fail(format!("{kind} rule without a source path")))?;
    let target = positional.next().map(PathBuf::from);
    if let Some(extra) = positional.next() {
        return Err(fail(format!("unexpected token '{extra}'")));
    }

    Ok(Rule {
        id,
        kind,
        source: PathBuf::from(source),
        target,
        flags,
    })
}
