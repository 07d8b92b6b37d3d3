//! # Value Constraints
//!
//! Constraints attached to attribute templates, and the violations a
//! template check reports.

use crate::value::{AttributeValue, AttributeValueType};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A compiled regular expression constraint, serialised as its pattern.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TextRegex {
    regex: regex_lite::Regex,
}

impl TextRegex {
    pub fn new(pattern: &str) -> Result<Self, regex_lite::Error> {
        Ok(Self {
            regex: regex_lite::Regex::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl TryFrom<String> for TextRegex {
    type Error = regex_lite::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<TextRegex> for String {
    fn from(value: TextRegex) -> Self {
        value.pattern().to_string()
    }
}

impl PartialEq for TextRegex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern() == other.pattern()
    }
}

impl Eq for TextRegex {}

impl fmt::Debug for TextRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TextRegex").field(&self.pattern()).finish()
    }
}

/// A constraint on the value of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueConstraint {
    /// Character count of every text element.
    TextLength {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    /// Every text element must match.
    TextRegex { pattern: TextRegex },
    /// Number of array elements.
    ArrayLength {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
}

impl ValueConstraint {
    pub fn text_regex(pattern: &str) -> Result<Self, regex_lite::Error> {
        Ok(Self::TextRegex {
            pattern: TextRegex::new(pattern)?,
        })
    }

    /// Reject bounds where `min > max`.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::TextLength {
                min: Some(min),
                max: Some(max),
            }
            | Self::ArrayLength {
                min: Some(min),
                max: Some(max),
            } if min > max => Err(format!("minimum {} exceeds maximum {}", min, max)),
            _ => Ok(()),
        }
    }

    pub fn check(&self, value: &AttributeValue) -> Vec<TemplateViolation> {
        match self {
            Self::TextLength { min, max } => {
                let Some(elements) = text_elements(value) else {
                    return vec![not_applicable("text length", value)];
                };
                elements
                    .into_iter()
                    .filter_map(|text| {
                        let length = text.chars().count();
                        if let Some(min) = min.filter(|min| length < *min) {
                            Some(TemplateViolation::TextTooShort {
                                min,
                                actual: length,
                            })
                        } else if let Some(max) = max.filter(|max| length > *max) {
                            Some(TemplateViolation::TextTooLong {
                                max,
                                actual: length,
                            })
                        } else {
                            None
                        }
                    })
                    .collect()
            }
            Self::TextRegex { pattern } => {
                let Some(elements) = text_elements(value) else {
                    return vec![not_applicable("text regex", value)];
                };
                elements
                    .into_iter()
                    .filter(|text| !pattern.is_match(text))
                    .map(|text| TemplateViolation::RegexMismatch {
                        pattern: pattern.pattern().to_string(),
                        text: text.to_string(),
                    })
                    .collect()
            }
            Self::ArrayLength { min, max } => {
                if !value.is_array() {
                    return vec![not_applicable("array length", value)];
                }
                let count = value.element_count();
                if min.is_some_and(|min| count < min) || max.is_some_and(|max| count > max) {
                    vec![TemplateViolation::ArrayLength {
                        min: *min,
                        max: *max,
                        actual: count,
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

fn text_elements(value: &AttributeValue) -> Option<Vec<&str>> {
    match value {
        AttributeValue::Text(s) | AttributeValue::MultilineText(s) => Some(vec![s.as_str()]),
        AttributeValue::TextArray(v) | AttributeValue::MultilineTextArray(v) => {
            Some(v.iter().map(String::as_str).collect())
        }
        _ => None,
    }
}

fn not_applicable(constraint: &'static str, value: &AttributeValue) -> TemplateViolation {
    TemplateViolation::ConstraintNotApplicable {
        constraint,
        value_type: value.value_type(),
        is_array: value.is_array(),
    }
}

/// Why a value (or its absence) fails a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateViolation {
    #[error("attribute is missing")]
    Missing,

    #[error("expected type {expected}, found {found}")]
    WrongType {
        expected: AttributeValueType,
        found: AttributeValueType,
    },

    #[error("expected array: {expected}, found array: {found}")]
    WrongArrayness { expected: bool, found: bool },

    #[error("text shorter than {min} characters ({actual})")]
    TextTooShort { min: usize, actual: usize },

    #[error("text longer than {max} characters ({actual})")]
    TextTooLong { max: usize, actual: usize },

    #[error("text {text:?} does not match {pattern:?}")]
    RegexMismatch { pattern: String, text: String },

    #[error("array has {actual} elements, allowed {min:?}..{max:?}")]
    ArrayLength {
        min: Option<usize>,
        max: Option<usize>,
        actual: usize,
    },

    #[error("{constraint} constraint does not apply to {value_type} (array: {is_array})")]
    ConstraintNotApplicable {
        constraint: &'static str,
        value_type: AttributeValueType,
        is_array: bool,
    },

    #[error("relation count {actual} outside {min:?}..{max:?}")]
    Cardinality {
        min: Option<usize>,
        max: Option<usize>,
        actual: usize,
    },
}
