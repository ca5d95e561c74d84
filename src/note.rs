//! Note composition helpers: frontmatter header, tag parsing and image shortcodes.
use chrono::{DateTime, FixedOffset};

use crate::model::IMAGE_NAME_TOKEN;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

pub fn frontmatter(
    title: &str,
    tags: &[String],
    date: Option<DateTime<FixedOffset>>,
    lastmod: Option<DateTime<FixedOffset>>,
) -> String {
    let tag_list = tags
        .iter()
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(", ");
    let fmt = |d: Option<DateTime<FixedOffset>>| {
        d.map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_default()
    };
    format!(
        "---\ntitle: \"{}\"\ntags: [{}]\ndate: \"{}\"\nlastmod: \"{}\"\n---\n",
        title.trim(),
        tag_list,
        fmt(date),
        fmt(lastmod)
    )
}

/// Strip a leading `---` header block, returning the body only.
pub fn strip_frontmatter(text: &str) -> &str {
    let Some(after) = text.strip_prefix("---") else {
        return text;
    };
    let after = after.trim_start_matches(['\r', '\n']);
    match after.find("\n---") {
        Some(end) => after[end + 4..].trim_start_matches(['\r', '\n']),
        None => text,
    }
}

pub fn expand_shortcode(template: &str, image_name: &str) -> String {
    template.replace(IMAGE_NAME_TOKEN, image_name)
}

/// Split comma-separated tags, trimming whitespace and dropping empties.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Append the image shortcode on its own line.
pub fn append_shortcode(body: &str, shortcode: &str) -> String {
    if body.is_empty() {
        shortcode.to_string()
    } else {
        format!("{}\n{}", body, shortcode)
    }
}
