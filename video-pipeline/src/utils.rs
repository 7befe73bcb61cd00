/// Text processing utilities
pub mod text {
    /// Truncate to at most `max_chars` characters, never splitting a character.
    pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
        match text.char_indices().nth(max_chars) {
            Some((index, _)) => &text[..index],
            None => text,
        }
    }

    /// Truncate at the last word boundary inside `max_chars` and append `...`.
    /// Text that already fits is returned unchanged.
    pub fn truncate_on_word(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            return text.to_string();
        }

        let truncated = truncate_chars(text, max_chars);
        match truncated.rfind(' ') {
            Some(last_space) => format!("{}...", &truncated[..last_space]),
            None => format!("{}...", truncated),
        }
    }

    /// Sentence split on `". "`, the boundary captions use between sentences.
    pub fn split_sentences(text: &str) -> Vec<&str> {
        text.split(". ").collect()
    }
}

/// Time utilities
pub mod time {
    use chrono::Duration;

    /// Video offset as `MM:SS`, or `HH:MM:SS` past the first hour.
    pub fn format_timestamp(seconds: f64) -> String {
        let total = seconds.max(0.0) as u64;
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let secs = total % 60;

        if hours > 0 {
            format!("{:02}:{:02}:{:02}", hours, minutes, secs)
        } else {
            format!("{:02}:{:02}", minutes, secs)
        }
    }

    /// Format duration in human-readable form
    pub fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.num_seconds();

        if total_seconds < 60 {
            format!("{}s", total_seconds)
        } else if total_seconds < 3600 {
            format!("{}m", total_seconds / 60)
        } else if total_seconds < 86400 || total_seconds % 86400 != 0 {
            format!("{}h", total_seconds / 3600)
        } else {
            format!("{}d", total_seconds / 86400)
        }
    }
}

/// Markdown escaping for chat platforms and the digest
pub mod markdown {
    const TELEGRAM_SPECIAL: &[char] = &[
        '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
    ];

    /// Escape every Telegram MarkdownV2 reserved character with a backslash.
    pub fn escape_telegram(value: &str) -> String {
        let mut escaped = String::with_capacity(value.len());
        for c in value.chars() {
            if TELEGRAM_SPECIAL.contains(&c) {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        escaped
    }

    /// Make text safe to use inside `[...]` of a markdown link.
    pub fn escape_link_text(value: &str) -> String {
        value.replace('[', "\\[").replace(']', "\\]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_truncation_respects_boundaries() {
        assert_eq!(text::truncate_on_word("short", 10), "short");
        assert_eq!(text::truncate_on_word("hello brave new world", 13), "hello brave...");
        assert_eq!(text::truncate_on_word("abcdefghij", 4), "abcd...");
        assert_eq!(text::truncate_chars("héllo", 2), "hé");
    }

    #[test]
    fn timestamps_switch_to_hours() {
        assert_eq!(time::format_timestamp(0.0), "00:00");
        assert_eq!(time::format_timestamp(83.9), "01:23");
        assert_eq!(time::format_timestamp(3725.0), "01:02:05");
    }

    #[test]
    fn durations_prefer_whole_days() {
        assert_eq!(time::format_duration(chrono::Duration::hours(24)), "1d");
        assert_eq!(time::format_duration(chrono::Duration::hours(36)), "36h");
        assert_eq!(time::format_duration(chrono::Duration::minutes(5)), "5m");
    }

    #[test]
    fn telegram_escaping_covers_reserved_chars() {
        assert_eq!(markdown::escape_telegram("v1.0 (beta)!"), "v1\\.0 \\(beta\\)\\!");
        assert_eq!(markdown::escape_telegram("a_b*c"), "a\\_b\\*c");
        assert_eq!(markdown::escape_telegram("plain"), "plain");
    }
}
