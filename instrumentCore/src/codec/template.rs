//! Positional format templates for command arguments, e.g. `"{:.3f},{:d}"`.
//!
//! Supported fields are `{}`, `{N}`, `{:spec}`, and `{N:spec}` where `spec` is
//! `[0][width][.precision][type]` and `type` is one of `d`, `f`, `e`, `E`, `x`, `X`, or `s`.
//! Numbers are right aligned, everything else left aligned. `{{` and `}}` are literal braces.

use crate::{InstrumentError, Value};

use super::format_scientific;

#[derive(Debug, Default, PartialEq)]
struct FieldSpec {
    zero_pad: bool,
    width: Option<usize>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn template_error(template: &str, reason: &str) -> InstrumentError {
    InstrumentError::UnrecognizedType(format!("format template '{template}': {reason}"))
}

fn parse_spec(template: &str, spec: &str) -> Result<FieldSpec, InstrumentError> {
    let mut field = FieldSpec::default();
    let mut rest = spec;
    if let Some(stripped) = rest.strip_prefix('0') {
        field.zero_pad = true;
        rest = stripped;
    }
    let width_len = rest.chars().take_while(char::is_ascii_digit).count();
    if width_len > 0 {
        field.width = rest[..width_len].parse().ok();
        rest = &rest[width_len..];
    }
    if let Some(stripped) = rest.strip_prefix('.') {
        let prec_len = stripped.chars().take_while(char::is_ascii_digit).count();
        if prec_len == 0 {
            return Err(template_error(template, "missing precision"));
        }
        field.precision = stripped[..prec_len].parse().ok();
        rest = &stripped[prec_len..];
    }
    let mut chars = rest.chars();
    field.kind = chars.next();
    if chars.next().is_some() {
        return Err(template_error(template, "invalid field specification"));
    }
    if let Some(kind) = field.kind {
        if !"dfeExXs".contains(kind) {
            return Err(template_error(template, "unknown field type"));
        }
    }
    Ok(field)
}

fn pad(text: String, field: &FieldSpec, numeric: bool) -> String {
    let width = field.width.unwrap_or(0);
    let len = text.chars().count();
    if len >= width {
        return text;
    }
    let fill = width - len;
    if numeric && field.zero_pad {
        match text.strip_prefix('-') {
            Some(digits) => format!("-{}{digits}", "0".repeat(fill)),
            None => format!("{}{text}", "0".repeat(fill)),
        }
    } else if numeric {
        format!("{}{text}", " ".repeat(fill))
    } else {
        format!("{text}{}", " ".repeat(fill))
    }
}

fn format_field(value: &Value, field: &FieldSpec) -> Result<String, InstrumentError> {
    let (text, numeric) = match field.kind {
        Some('d') => (value.to_i64()?.to_string(), true),
        Some('x') => (format!("{:x}", value.to_i64()?), true),
        Some('X') => (format!("{:X}", value.to_i64()?), true),
        Some('f') => {
            let precision = field.precision.unwrap_or(6);
            (format!("{:.*}", precision, value.to_f64()?), true)
        }
        Some(kind @ ('e' | 'E')) => {
            let text = format_scientific(value.to_f64()?, field.precision.unwrap_or(6));
            let text = if kind == 'e' { text.to_lowercase() } else { text };
            (text, true)
        }
        _ => match (value, field.precision) {
            (Value::Float(x), Some(precision)) => (format!("{x:.precision$}"), true),
            (Value::Int(_) | Value::Float(_), None) => (value.to_string(), true),
            _ => (value.to_string(), false),
        },
    };
    Ok(pad(text, field, numeric))
}

/// Returns `true` if `template` should be treated as a format template.
pub(crate) fn is_template(template: &str) -> bool {
    template.contains(':') || template.contains("{}")
}

/// Apply a positional format template to `values`.
pub(crate) fn apply_template(template: &str, values: &[Value]) -> Result<String, InstrumentError> {
    let mut out = String::new();
    let mut auto_index = 0;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => inner.push(ch),
                        None => return Err(template_error(template, "unclosed field")),
                    }
                }
                let (index, spec) = inner.split_once(':').unwrap_or((inner.as_str(), ""));
                let index = if index.is_empty() {
                    auto_index += 1;
                    auto_index - 1
                } else {
                    index
                        .parse::<usize>()
                        .map_err(|_| template_error(template, "invalid field index"))?
                };
                let value = values.get(index).ok_or_else(|| {
                    InstrumentError::LengthMismatch {
                        expected: index + 1,
                        actual: values.len(),
                        context: format!("arguments for template '{template}'"),
                    }
                })?;
                out.push_str(&format_field(value, &parse_spec(template, spec)?)?);
            }
            '}' => return Err(template_error(template, "unmatched '}'")),
            _ => out.push(c),
        }
    }
    Ok(out)
}
