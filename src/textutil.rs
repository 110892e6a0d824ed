pub const PREVIEW_CHARS: usize = 100;

/// First `max_chars` characters of `text` with an ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Log-sized preview with newlines flattened.
pub fn log_preview(text: &str) -> String {
    preview(text, PREVIEW_CHARS).replace('\n', "\\n")
}

/// `text` without one trailing `\n` or `\r\n`.
pub fn strip_line_ending(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}
