use std::sync::LazyLock;

use regex::Regex;

/// CSI, OSC and two-byte escape sequences, plus carriage returns.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]|\r")
        .expect("ANSI escape pattern is valid")
});

/// Longest unfinished sequence held back before it is let through as text.
const MAX_PENDING: usize = 4096;

/// Terminal output with escape sequences removed.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Strips a stream of output chunks, carrying an escape sequence that was
/// cut off at the end of one chunk over to the next.
#[derive(Debug, Default)]
pub(crate) struct AnsiStripper {
    pending: String,
}

impl AnsiStripper {
    pub(crate) fn push(&mut self, chunk: &str) -> String {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);
        if let Some(at) = unfinished_tail(&text) {
            if text.len() - at <= MAX_PENDING {
                self.pending = text.split_off(at);
            }
        }
        strip_ansi(&text)
    }
}

/// Byte offset of an escape sequence that starts in `text` but has not
/// ended yet.
fn unfinished_tail(text: &str) -> Option<usize> {
    let last = text.rfind('\x1b')?;
    let tail = &text[last..];
    let open = match tail.as_bytes().get(1) {
        None => true,
        Some(b'[') => tail[2..].bytes().all(|b| (0x20..=0x3f).contains(&b)),
        Some(b']') => !tail.contains('\x07'),
        Some(_) => false,
    };
    if !open {
        return None;
    }
    // A lone ESC may be the first half of the terminator of an OSC string.
    if tail.len() == 1 {
        if let Some(osc) = text[..last].rfind("\x1b]") {
            let body = &text[osc..last];
            if !body[2..].contains(['\x07', '\x1b']) {
                return Some(osc);
            }
        }
    }
    Some(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_colors_and_cursor_moves() {
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[0m done"), "ok done");
        assert_eq!(strip_ansi("\x1b[2K\x1b[1Gline"), "line");
        assert_eq!(strip_ansi("\x1b[?25lhidden\x1b[?25h"), "hidden");
    }

    #[test]
    fn removes_osc_titles_and_carriage_returns() {
        assert_eq!(strip_ansi("\x1b]0;title\x07hello\r\n"), "hello\n");
        assert_eq!(strip_ansi("\x1b]8;;http://x\x1b\\link"), "link");
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(strip_ansi("plain [text] 100%"), "plain [text] 100%");
    }

    #[test]
    fn sequence_split_across_chunks_is_stripped() {
        let mut stripper = AnsiStripper::default();
        assert_eq!(stripper.push("hello \x1b[3"), "hello ");
        assert_eq!(stripper.push("2mgreen\x1b[0m"), "green");
        assert_eq!(stripper.push("\x1b"), "");
        assert_eq!(stripper.push("[1mbold"), "bold");
    }

    #[test]
    fn osc_split_before_terminator_is_stripped() {
        let mut stripper = AnsiStripper::default();
        assert_eq!(stripper.push("a\x1b]0;long ti"), "a");
        assert_eq!(stripper.push("tle\x1b"), "");
        assert_eq!(stripper.push("\\b"), "b");
    }

    #[test]
    fn finished_chunks_pass_straight_through() {
        let mut stripper = AnsiStripper::default();
        assert_eq!(stripper.push("\x1b[1mdone\x1b[0m\r\n"), "done\n");
        assert_eq!(stripper.push("next"), "next");
    }

    #[test]
    fn runaway_sequence_is_not_held_forever() {
        let mut stripper = AnsiStripper::default();
        let junk = format!("\x1b]{}", "x".repeat(MAX_PENDING + 10));
        let out = stripper.push(&junk);
        assert!(out.ends_with('x'));
        assert_eq!(stripper.push("ok"), "ok");
    }
}
