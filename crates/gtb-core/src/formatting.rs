//! Plain-text helpers for answers: chunking, choice numbering, usage footer.

use crate::model::types::TokenUsage;

/// Split `text` into chunks of at most `limit` characters, preferring line breaks.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut out = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        // Byte offset of the `limit`-th char.
        let hard = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let cut = match rest[..hard].rfind('\n') {
            Some(i) if i > 0 => i + 1,
            _ => hard,
        };
        out.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() || out.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Keycap number prefix: `1⃣`, `2⃣`, ...
pub fn choice_marker(index: usize) -> String {
    format!("{}\u{20e3}", index + 1)
}

/// Join several choices into one answer, numbering each when there is more than one.
pub fn number_choices(choices: &[String]) -> String {
    if choices.len() == 1 {
        return choices[0].trim().to_string();
    }
    choices
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} {}", choice_marker(i), c.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Footer appended to an answer when usage display is enabled.
pub fn usage_footer(total_tokens: u64, usage: Option<&TokenUsage>) -> String {
    match usage {
        Some(u) => format!(
            "\n\n---\n💰 {total_tokens} tokens ({} prompt, {} completion)",
            u.prompt_tokens, u.completion_tokens
        ),
        None => format!("\n\n---\n💰 {total_tokens} tokens"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_text("hello", 10), vec!["hello"]);
        assert_eq!(split_text("", 10), vec![""]);
    }

    #[test]
    fn long_text_prefers_newlines() {
        let chunks = split_text("aaaa\nbbbb\ncc", 6);
        assert_eq!(chunks, vec!["aaaa\n", "bbbb\n", "cc"]);
        assert_eq!(chunks.concat(), "aaaa\nbbbb\ncc");
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let chunks = split_text("ééééé", 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn choices_are_numbered_only_when_several() {
        assert_eq!(number_choices(&[" one ".to_string()]), "one");
        assert_eq!(
            number_choices(&["a".to_string(), "b".to_string()]),
            "1\u{20e3} a\n\n2\u{20e3} b"
        );
    }

    #[test]
    fn footer_variants() {
        assert_eq!(usage_footer(42, None), "\n\n---\n💰 42 tokens");
        let u = TokenUsage {
            prompt_tokens: 30,
            completion_tokens: 12,
            total_tokens: 42,
        };
        assert_eq!(
            usage_footer(42, Some(&u)),
            "\n\n---\n💰 42 tokens (30 prompt, 12 completion)"
        );
    }
}
