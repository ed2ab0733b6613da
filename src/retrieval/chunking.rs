//! Splitting a document into line windows.

/// A window of consecutive lines. Line numbers are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineWindow {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

/// Split `text` into windows of `chunk_size` lines, each starting
/// `chunk_size - overlap` lines after the previous one.
///
/// Windows holding only whitespace are skipped. An `overlap` of
/// `chunk_size` or more is clamped so windows always advance.
pub fn chunk_lines(text: &str, chunk_size: usize, overlap: usize) -> Vec<LineWindow> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let size = chunk_size.max(1);
    let step = size.saturating_sub(overlap).max(1);
    let mut windows = Vec::new();
    let mut start = 0;

    loop {
        let end = (start + size).min(lines.len());
        let body = &lines[start..end];
        if body.iter().any(|l| !l.trim().is_empty()) {
            windows.push(LineWindow {
                start_line: start + 1,
                end_line: end,
                text: body.join("\n"),
            });
        }
        if end == lines.len() {
            break;
        }
        start += step;
    }

    windows
}
