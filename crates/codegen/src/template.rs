//! `@NAME@` placeholder substitution for the C templates.
//!
//! C is brace-heavy, so `format!` escaping would drown the kernel text.

/// Replace every `@KEY@` in `template`. Unknown placeholders are left as is
/// and reported by [`unfilled`].
pub fn fill(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("@{key}@"), value);
    }
    out
}

/// First `@NAME@` placeholder still present, if any.
pub fn unfilled(text: &str) -> Option<&str> {
    let start = text.find('@')?;
    let rest = &text[start + 1..];
    let end = rest.find('@')?;
    let name = &rest[..end];
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        Some(name)
    } else {
        unfilled(&text[start + 1 + end..])
    }
}
