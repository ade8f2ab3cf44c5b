//! Cleanup passes for fragment Markdown.
//!
//! Each pass is a function `&str -> String` applied in sequence. Fragments are
//! embedded under a `##` heading in the bundle, so their own headings are
//! pushed below that level.

use std::sync::LazyLock;

use regex::Regex;

/// Run every cleanup pass over one fragment's converted Markdown.
pub(crate) fn run_pipeline(md: &str) -> String {
    let mut result = md.to_string();

    result = demote_headings(&result);
    result = strip_leftover_html(&result);
    result = clean_blank_lines(&result);
    result = normalize_whitespace(&result);
    result = ensure_trailing_newline(&result);

    result
}

/// Shift every heading so the shallowest one lands on `###`.
fn demote_headings(md: &str) -> String {
    static H_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+)$").expect("valid regex"));

    let shallowest = md
        .lines()
        .filter_map(|line| H_RE.captures(line).map(|c| c[1].len()))
        .min();

    let Some(shallowest) = shallowest else {
        return md.to_string();
    };
    let shift = 3usize.saturating_sub(shallowest);
    if shift == 0 {
        return md.to_string();
    }

    md.lines()
        .map(|line| match H_RE.captures(line) {
            Some(caps) => {
                let level = (caps[1].len() + shift).min(6);
                format!("{} {}", "#".repeat(level), &caps[2])
            }
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove layout tags that `htmd` passes through, keeping their text.
fn strip_leftover_html(md: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?(?:div|span|section|article|font|center|ins|del)(?:\s[^>]*)?>")
            .expect("valid regex")
    });

    HTML_TAG_RE.replace_all(md, "").to_string()
}

/// Collapse runs of blank lines into a single blank line.
fn clean_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*){2,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}

fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

fn ensure_trailing_newline(md: &str) -> String {
    let trimmed = md.trim_matches('\n');
    format!("{trimmed}\n")
}
