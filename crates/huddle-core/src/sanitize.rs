//! Terminal output sanitization.
//!
//! Agents run inside pipes or pseudo-terminals and their raw output carries
//! carriage returns, ANSI/VT100 escape sequences and assorted control bytes.
//! This module turns a raw chunk into printable display lines. The transform
//! is pure: no buffering, no state carried between chunks.

use regex::Regex;
use std::sync::LazyLock;

/// Matches CSI sequences ("ESC [ params intermediates final") and the
/// two-byte "ESC letter" forms.
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]|\x1B[@-_]").unwrap());

/// Non-printable Unicode beyond the Cc controls: format characters
/// (zero-width space, BOM, direction marks), private use, and the line and
/// paragraph separators.
static UNPRINTABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{Cf}\p{Co}\p{Zl}\p{Zp}]").unwrap());

/// Sanitize a raw output chunk into display lines.
///
/// Steps, in order: carriage returns become line breaks, escape sequences are
/// stripped, remaining control and format characters other than newline and
/// tab are dropped, and the result is split into lines. Lines that end up
/// blank are replaced with a single space so a line-oriented display keeps
/// the spacing without producing zero-width rows.
pub fn sanitize_chunk(raw: &str) -> Vec<String> {
    let normalized = raw.replace('\r', "\n");
    let stripped = ANSI_ESCAPE.replace_all(&normalized, "");
    let stripped = UNPRINTABLE.replace_all(&stripped, "");
    let cleaned: String = stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    cleaned
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                " ".to_string()
            } else {
                line.to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_forbidden_chars(lines: &[String]) -> bool {
        lines
            .iter()
            .flat_map(|l| l.chars())
            .any(|c| c == '\u{1b}' || (c.is_control() && c != '\t'))
    }

    #[test]
    fn strips_color_codes() {
        let lines = sanitize_chunk("\u{1b}[31mred text\u{1b}[0m\n");
        assert_eq!(lines, vec!["red text"]);
    }

    #[test]
    fn strips_cursor_movement_and_two_byte_escapes() {
        let raw = "\u{1b}[2J\u{1b}[H\u{1b}Mhello\u{1b}[1;32m world\u{1b}[0m\n";
        let lines = sanitize_chunk(raw);
        assert_eq!(lines, vec!["hello world"]);
        assert!(!has_forbidden_chars(&lines));
    }

    #[test]
    fn no_escape_bytes_survive() {
        let samples = [
            "\u{1b}[38;5;196mdeep color\u{1b}[0m",
            "progress\r\u{1b}[Kdone\n",
            "\u{1b}]0;title\u{1b}\\body", // OSC introducer is the two-byte ESC ] form
            "plain text, no escapes",
            "\u{1b}[?25l\u{1b}[?25h",
        ];
        for raw in samples {
            let lines = sanitize_chunk(raw);
            assert!(!has_forbidden_chars(&lines), "escapes survived in {raw:?}");
        }
    }

    #[test]
    fn carriage_returns_become_line_breaks() {
        let lines = sanitize_chunk("first\rsecond\r\nthird\n");
        // "\r\n" yields an empty segment which is preserved as a space.
        assert_eq!(lines, vec!["first", "second", " ", "third"]);
    }

    #[test]
    fn blank_lines_become_a_single_space() {
        let lines = sanitize_chunk("above\n\nbelow\n");
        assert_eq!(lines, vec!["above", " ", "below"]);
    }

    #[test]
    fn format_characters_are_dropped() {
        // Zero-width space, zero-width joiner, BOM, soft hyphen.
        let lines = sanitize_chunk("a\u{200B}b\u{200D}c\u{FEFF}d\u{00AD}e\n");
        assert_eq!(lines, vec!["abcde"]);
    }

    #[test]
    fn tabs_are_preserved() {
        let lines = sanitize_chunk("col1\tcol2\n");
        assert_eq!(lines, vec!["col1\tcol2"]);
    }

    #[test]
    fn unterminated_trailing_data_is_kept() {
        let lines = sanitize_chunk("no newline at end");
        assert_eq!(lines, vec!["no newline at end"]);
    }

    #[test]
    fn empty_input_yields_no_lines() {
        assert!(sanitize_chunk("").is_empty());
    }
}
