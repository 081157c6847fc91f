//! Regex and blocked-term matching against one event attribute.

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use mesh_config::ConfigError;

use crate::error::MeshError;
use crate::event::Event;

/// Longest excerpt of matched text kept as evidence.
const MAX_EXCERPT_CHARS: usize = 120;

/// What a pattern rule matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    pub attribute: String,
    /// Regex match text or the blocked term
    pub matched: String,
    pub by_term: bool,
}

/// Compiled pattern trigger.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    attribute: String,
    regex: Option<Regex>,
    terms: Vec<String>,
    case_insensitive: bool,
}

impl PatternMatcher {
    pub fn compile(
        rule_id: &str,
        pattern: Option<&str>,
        terms: &[String],
        attribute: &str,
        case_insensitive: bool,
    ) -> Result<Self, ConfigError> {
        let regex = pattern
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(case_insensitive)
                    .build()
                    .map_err(|e| ConfigError::InvalidPattern {
                        rule_id: rule_id.to_string(),
                        reason: e.to_string(),
                    })
            })
            .transpose()?;
        let terms = terms
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| {
                if case_insensitive {
                    t.to_lowercase()
                } else {
                    t.clone()
                }
            })
            .collect();

        Ok(Self {
            attribute: attribute.to_string(),
            regex,
            terms,
            case_insensitive,
        })
    }

    /// Match the configured attribute. A missing attribute is no match; a
    /// non-text attribute is an evaluation error.
    pub fn matches(&self, rule_id: &str, event: &Event) -> Result<Option<PatternHit>, MeshError> {
        let text = match event.attributes.get(&self.attribute) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Array(_) | Value::Object(_)) => {
                return Err(MeshError::RuleEvaluation {
                    rule_id: rule_id.to_string(),
                    reason: format!("attribute '{}' is not text", self.attribute),
                })
            }
            Some(_) => match event.attribute_text(&self.attribute) {
                Some(text) => text,
                None => return Ok(None),
            },
        };

        if let Some(found) = self.regex.as_ref().and_then(|r| r.find(&text)) {
            return Ok(Some(PatternHit {
                attribute: self.attribute.clone(),
                matched: excerpt(found.as_str()),
                by_term: false,
            }));
        }

        if self.terms.is_empty() {
            return Ok(None);
        }
        let haystack = if self.case_insensitive {
            text.to_lowercase()
        } else {
            text.into_owned()
        };
        Ok(self
            .terms
            .iter()
            .find(|term| haystack.contains(term.as_str()))
            .map(|term| PatternHit {
                attribute: self.attribute.clone(),
                matched: term.clone(),
                by_term: true,
            }))
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= MAX_EXCERPT_CHARS {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(MAX_EXCERPT_CHARS).collect();
        cut.push('…');
        cut
    }
}
