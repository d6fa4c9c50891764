/// Byte index of the `max_chars`-th character, or `s.len()` when shorter.
pub fn char_boundary_at(s: &str, max_chars: usize) -> usize {
    s.char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len())
}

/// Splits `text` into chunks of at most `max_chars` characters, preferring
/// to break at the last newline inside each window.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let boundary = char_boundary_at(remaining, max_chars);
        let chunk_len = if boundary == remaining.len() {
            boundary
        } else {
            match remaining[..boundary].rfind('\n') {
                Some(0) | None => boundary,
                Some(idx) => idx,
            }
        };
        chunks.push(remaining[..chunk_len].to_string());
        remaining = &remaining[chunk_len..];
        if let Some(rest) = remaining.strip_prefix('\n') {
            remaining = rest;
        }
    }
    chunks
}

/// First `max_chars` characters of `text`, for log previews.
pub fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
