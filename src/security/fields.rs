//! Declarative parameter tables.
//!
//! Sanitization is keyed on field name alone: the same field means the same
//! thing in every operation. The tables are checked once when the middleware
//! is built; a broken table refuses to construct.

use std::collections::HashSet;

use thiserror::Error;

/// How a parameter is cleaned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// A single colour value.
    Color,
    /// Colours nested in arrays (palettes, colour sets).
    ColorArray,
    /// Fetched by a tool; must pass the URL sanitizer or the request fails.
    Url,
    /// Markup that is rendered; active content is stripped.
    Markup,
    /// Plain text; every HTML metacharacter is escaped.
    Text,
    /// Number within inclusive bounds. Numeric strings are coerced.
    Numeric { min: f64, max: f64, integer: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldRule {
    pub field: &'static str,
    pub kind: FieldKind,
}

const fn rule(field: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule { field, kind }
}

const fn int(min: f64, max: f64) -> FieldKind {
    FieldKind::Numeric { min, max, integer: true }
}

pub const FIELD_RULES: &[FieldRule] = &[
    rule("color", FieldKind::Color),
    rule("base_color", FieldKind::Color),
    rule("background_color", FieldKind::Color),
    rule("foreground_color", FieldKind::Color),
    rule("text_color", FieldKind::Color),
    rule("start_color", FieldKind::Color),
    rule("end_color", FieldKind::Color),
    rule("colors", FieldKind::ColorArray),
    rule("palette", FieldKind::ColorArray),
    rule("color_set", FieldKind::ColorArray),
    rule("color_sets", FieldKind::ColorArray),
    rule("url", FieldKind::Url),
    rule("image_url", FieldKind::Url),
    rule("source_url", FieldKind::Url),
    rule("callback_url", FieldKind::Url),
    rule("html", FieldKind::Markup),
    rule("custom_html", FieldKind::Markup),
    rule("template", FieldKind::Markup),
    rule("title", FieldKind::Text),
    rule("description", FieldKind::Text),
    rule("context", FieldKind::Text),
    rule("output_format", FieldKind::Text),
    rule("harmony_type", FieldKind::Text),
    rule("algorithm", FieldKind::Text),
    rule("format", FieldKind::Text),
    rule("width", int(1.0, 10_000.0)),
    rule("height", int(1.0, 10_000.0)),
    rule("count", int(1.0, 100.0)),
    rule("num_colors", int(1.0, 100.0)),
    rule("resolution", int(1.0, 1_200.0)),
    rule("quality", int(1.0, 100.0)),
    rule("steps", int(2.0, 256.0)),
    rule("size", int(1.0, 10_000.0)),
    rule(
        "angle",
        FieldKind::Numeric {
            min: 0.0,
            max: 360.0,
            integer: false,
        },
    ),
];

/// Parameters each operation cannot run without.
pub const REQUIRED_PARAMETERS: &[(&str, &[&str])] = &[
    ("convert_color", &["color", "output_format"]),
    ("analyze_color", &["color"]),
    ("generate_harmony_palette", &["base_color", "harmony_type"]),
    ("generate_contextual_palette", &["context"]),
    ("generate_algorithmic_palette", &["base_color"]),
    ("create_palette_html", &["palette"]),
    ("create_palette_png", &["palette"]),
    ("create_gradient_png", &["colors"]),
    ("create_color_comparison_png", &["color_sets"]),
    ("extract_palette_from_image", &["image_url"]),
];

/// Operations whose output dimensions are capped.
pub const IMAGE_OPERATIONS: &[&str] = &[
    "create_palette_png",
    "create_gradient_png",
    "create_color_comparison_png",
];

/// Operations whose palette size is capped.
pub const GENERATIVE_OPERATIONS: &[&str] = &[
    "generate_harmony_palette",
    "generate_contextual_palette",
    "generate_algorithmic_palette",
    "extract_palette_from_image",
];

/// Parameters read as a palette size.
pub const PALETTE_SIZE_FIELDS: &[&str] = &["count", "num_colors"];

pub fn rule_for(field: &str) -> Option<&'static FieldRule> {
    FIELD_RULES.iter().find(|r| r.field == field)
}

pub fn required_parameters(operation: &str) -> &'static [&'static str] {
    REQUIRED_PARAMETERS
        .iter()
        .find(|(op, _)| *op == operation)
        .map(|(_, fields)| *fields)
        .unwrap_or(&[])
}

#[derive(Debug, Error, PartialEq)]
pub enum FieldTableError {
    #[error("field '{0}' has more than one rule")]
    Duplicate(&'static str),

    #[error("field '{field}' has invalid bounds {min}..={max}")]
    InvalidBounds { field: &'static str, min: f64, max: f64 },

    #[error("required parameter '{field}' of '{operation}' has no sanitization rule")]
    MissingRule {
        operation: &'static str,
        field: &'static str,
    },
}

/// Check the tables for duplicates, bad bounds and uncovered required fields.
pub fn validate_tables(
    rules: &[FieldRule],
    required: &[(&'static str, &'static [&'static str])],
) -> Result<(), FieldTableError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert(rule.field) {
            return Err(FieldTableError::Duplicate(rule.field));
        }
        if let FieldKind::Numeric { min, max, .. } = rule.kind {
            if !(min.is_finite() && max.is_finite() && min <= max) {
                return Err(FieldTableError::InvalidBounds {
                    field: rule.field,
                    min,
                    max,
                });
            }
        }
    }

    for &(operation, fields) in required {
        for &field in fields {
            if !seen.contains(field) {
                return Err(FieldTableError::MissingRule { operation, field });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tables_valid() {
        assert_eq!(validate_tables(FIELD_RULES, REQUIRED_PARAMETERS), Ok(()));
    }

    #[test]
    fn test_duplicate_rejected() {
        let rules = [rule("color", FieldKind::Color), rule("color", FieldKind::Text)];
        assert_eq!(
            validate_tables(&rules, &[]),
            Err(FieldTableError::Duplicate("color"))
        );
    }

    #[test]
    fn test_bad_bounds_rejected() {
        let rules = [rule("width", int(10.0, 1.0))];
        assert!(matches!(
            validate_tables(&rules, &[]),
            Err(FieldTableError::InvalidBounds { field: "width", .. })
        ));
    }

    #[test]
    fn test_uncovered_required_field_rejected() {
        let rules = [rule("color", FieldKind::Color)];
        let required: &[(&str, &[&str])] = &[("convert_color", &["color", "output_format"])];
        assert_eq!(
            validate_tables(&rules, required),
            Err(FieldTableError::MissingRule {
                operation: "convert_color",
                field: "output_format"
            })
        );
    }

    #[test]
    fn test_lookups() {
        assert_eq!(rule_for("image_url").map(|r| r.kind), Some(FieldKind::Url));
        assert!(rule_for("unknown").is_none());
        assert_eq!(required_parameters("convert_color"), &["color", "output_format"]);
        assert!(required_parameters("unknown_op").is_empty());
    }
}
