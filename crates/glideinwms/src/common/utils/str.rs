use std::borrow::Cow;

/// Return the input string with an added "s" at the end if `count` is not one.
pub fn pluralize(value: &str, count: usize) -> Cow<'_, str> {
    if count == 1 {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("{value}s"))
    }
}

/// Names that travel inside ad names and file paths may only contain `[A-Za-z0-9._@-]`.
pub fn is_safe_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-'))
}

/// Replaces characters that cannot appear in a path component.
pub fn sanitize_path_component(value: &str) -> String {
    if value.is_empty() || value.chars().all(|c| c == '.') {
        return "_".repeat(value.len().max(1));
    }
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
