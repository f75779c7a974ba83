//! Cleanup filter applied to model output before it is stored or displayed.
//!
//! [`clean`] runs a fixed sequence of substitutions until the text stops
//! changing, so applying it twice is the same as applying it once.

use once_cell::sync::Lazy;
use regex::Regex;

/// Markdown inserted wherever the model left an image instruction.
pub const PLACEHOLDER_IMAGE: &str =
    "![Brand visual placeholder](https://placehold.co/1200x630?text=Brand+Visual)";

static DIV_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*</?div\b[^>\n]*>[ \t]*(?:\n|$)").expect("valid div regex"));

// Single-line bracket whose text asks for an image, e.g. "[Generate and embed the image here]".
static IMAGE_INSTRUCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\[[ \t]*(?:(?:generate|insert|add|include|embed|place|create)\b[^\]\n]*\b(?:image|picture|photo|visual|illustration|graphic)s?\b[^\]\n]*|(?:image|picture|photo)\b[ \t]*(?::|of\b|here\b)[^\]\n]*)\]",
    )
    .expect("valid image instruction regex")
});

static BLANK_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").expect("valid blank-line regex"));

pub fn clean(input: &str) -> String {
    let mut current = pass(input);
    loop {
        let next = pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn pass(input: &str) -> String {
    let text = input.replace("\r\n", "\n");
    let text = strip_fences(&text);
    let text = DIV_LINE.replace_all(&text, "");
    let text = IMAGE_INSTRUCTION.replace_all(&text, PLACEHOLDER_IMAGE);
    let text = BLANK_RUN.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Removes a fence pair that wraps the whole reply, or a lone unmatched fence at
/// either end. Balanced code blocks inside the text are left alone.
fn strip_fences(input: &str) -> String {
    let mut lines: Vec<&str> = input.trim().lines().collect();
    loop {
        let scan = scan_fences(&lines);
        let first_is_fence = lines.first().is_some_and(|line| is_fence(line));
        let last_is_fence = lines.last().is_some_and(|line| is_fence(line));
        if scan.first_block_closes_at == Some(lines.len().saturating_sub(1)) && lines.len() >= 2 {
            lines.remove(0);
            lines.pop();
        } else if scan.unclosed > 0 && last_is_fence {
            lines.pop();
        } else if scan.unclosed > 0 && first_is_fence {
            lines.remove(0);
        } else {
            return lines.join("\n").trim().to_string();
        }
        while lines.first().is_some_and(|line| line.trim().is_empty()) {
            lines.remove(0);
        }
        while lines.last().is_some_and(|line| line.trim().is_empty()) {
            lines.pop();
        }
    }
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn is_bare_fence(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with("```") && trimmed.trim_start_matches('`').is_empty()
}

struct FenceScan {
    /// Line that closes a block opened on the first line.
    first_block_closes_at: Option<usize>,
    unclosed: usize,
}

// A bare fence closes the innermost open block; anything else opens one.
fn scan_fences(lines: &[&str]) -> FenceScan {
    let mut depth = 0usize;
    let mut first_block_closes_at = None;
    for (idx, line) in lines.iter().enumerate() {
        if !is_fence(line) {
            continue;
        }
        if depth > 0 && is_bare_fence(line) {
            depth -= 1;
            if depth == 0 && first_block_closes_at.is_none() && is_fence(lines[0]) {
                first_block_closes_at = Some(idx);
            }
        } else {
            depth += 1;
        }
    }
    FenceScan {
        first_block_closes_at,
        unclosed: depth,
    }
}

/// Whether `text` still contains an image instruction the filter would replace.
pub fn has_image_instruction(text: &str) -> bool {
    IMAGE_INSTRUCTION.is_match(text)
}

#[cfg(feature = "web")]
fn markdown_options() -> markdown::Options {
    // Raw HTML in model output stays escaped.
    markdown::Options::gfm()
}

/// Renders cleaned Markdown to HTML. Returns `None` for blank input.
#[cfg(feature = "web")]
pub fn render_html(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let options = markdown_options();
    let html = markdown::to_html_with_options(trimmed, &options)
        .unwrap_or_else(|_| markdown::to_html(trimmed));
    Some(html)
}
