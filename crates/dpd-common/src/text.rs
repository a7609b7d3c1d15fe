//! Text normalization for scraped page content

/// Collapse runs of whitespace (including non-breaking and zero-width
/// spaces) into single spaces and trim the ends.
pub fn collapse_whitespace(input: &str) -> String {
    input
        .split(|c: char| c.is_whitespace() || c == '\u{a0}' || c == '\u{200b}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize Windows and old-Mac line endings to `\n`.
pub fn normalize_newlines(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}
