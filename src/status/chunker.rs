//! Splitting long replies to fit the outbound message limit.
//!
//! Preferred split boundaries, best first: paragraph break, line break,
//! sentence end, hard cut.  A split never lands inside a fenced code block
//! unless a single block alone exceeds the limit (then a hard cut is the
//! only option).

/// Split `text` into chunks of at most `limit` characters.
pub fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.is_empty() {
        return vec![text.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > limit {
        let cut = split_point(rest, limit);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.trim_end().to_owned());
        rest = tail.trim_start_matches('\n');
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_owned());
    }
    chunks
}

/// Append `footer` to the final chunk, splitting it off if it cannot fit.
pub fn chunk_with_footer(text: &str, footer: &str, limit: usize) -> Vec<String> {
    let mut chunks = chunk_message(text, limit);
    if footer.is_empty() {
        return chunks;
    }
    if let Some(last) = chunks.last_mut()
        && last.chars().count() + footer.chars().count() + 1 <= limit
    {
        last.push('\n');
        last.push_str(footer);
    } else {
        chunks.push(footer.to_owned());
    }
    chunks
}

/// Byte index ≤ the char `limit` to split at, honoring boundary preference
/// and fence safety.
fn split_point(text: &str, limit: usize) -> usize {
    // Byte offset of the hard cap (limit is in chars).
    let cap = text
        .char_indices()
        .nth(limit)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..cap];

    for boundary in ["\n\n", "\n", ". "] {
        let mut candidate = None;
        let mut search_end = head.len();
        while let Some(pos) = head[..search_end].rfind(boundary) {
            let cut = pos + boundary.len();
            if !inside_fence(text, cut) {
                candidate = Some(cut);
                break;
            }
            if pos == 0 {
                break;
            }
            search_end = pos;
        }
        if let Some(cut) = candidate
            && cut > 0
        {
            return cut;
        }
    }
    // Hard cut on a char boundary.
    cap
}

/// Is byte offset `at` strictly inside a fenced code block?
fn inside_fence(text: &str, at: usize) -> bool {
    text[..at].matches("```").count() % 2 == 1
}
