//! Rendering remote items into mirrored documents.

use std::fmt::Write;

use minutesync_common::{MirrorPath, Result};
use minutesync_storage::{Item, SecondaryResource};

use crate::store::DEFAULT_FRONTMATTER_KEY;

/// Title used when an item has none.
pub const UNTITLED: &str = "Untitled";

const MAX_NAME_CHARS: usize = 120;

/// Turns an item and its secondary resources into document text.
///
/// The output must open with a frontmatter block carrying the item's remote id
/// under the store's frontmatter key.
pub trait ContentRenderer: Send + Sync {
    fn render(&self, item: &Item, secondaries: &[SecondaryResource]) -> String;
}

/// Chooses where a new item lands in the mirror.
pub trait PathGenerator: Send + Sync {
    fn generate(&self, item: &Item) -> Result<MirrorPath>;
}

/// Markdown with a YAML-style frontmatter block.
#[derive(Debug, Clone)]
pub struct MarkdownRenderer {
    frontmatter_key: String,
}

impl MarkdownRenderer {
    pub fn new(frontmatter_key: impl Into<String>) -> Self {
        Self {
            frontmatter_key: frontmatter_key.into(),
        }
    }
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_FRONTMATTER_KEY)
    }
}

fn display_title(item: &Item) -> &str {
    let title = item.title.trim();
    if title.is_empty() {
        UNTITLED
    } else {
        title
    }
}

fn quoted(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\n', '\r'], " ");
    format!("\"{}\"", escaped)
}

impl ContentRenderer for MarkdownRenderer {
    fn render(&self, item: &Item, secondaries: &[SecondaryResource]) -> String {
        let title = display_title(item);
        let mut out = String::new();

        let _ = writeln!(out, "---");
        let _ = writeln!(out, "{}: {}", self.frontmatter_key, item.id);
        let _ = writeln!(out, "title: {}", quoted(title));
        let _ = writeln!(out, "created: {}", item.created_at.to_rfc3339());
        let _ = writeln!(out, "updated: {}", item.updated_at.to_rfc3339());
        if item.attendees.is_empty() {
            let _ = writeln!(out, "attendees: []");
        } else {
            let _ = writeln!(out, "attendees:");
            for attendee in &item.attendees {
                let _ = writeln!(out, "  - {}", quoted(attendee));
            }
        }
        let _ = writeln!(out, "---");
        let _ = writeln!(out);
        let _ = writeln!(out, "# {}", title);

        if let Some(summary) = item.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let _ = write!(out, "\n## Summary\n\n{}\n", summary);
        }
        if let Some(notes) = item.notes.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let _ = write!(out, "\n## Notes\n\n{}\n", notes);
        }

        for resource in secondaries {
            match resource {
                SecondaryResource::Panels(panels) => {
                    for panel in panels {
                        let content = panel.content.trim();
                        if content.is_empty() {
                            continue;
                        }
                        let heading = if panel.title.trim().is_empty() {
                            "Panel"
                        } else {
                            panel.title.trim()
                        };
                        let _ = write!(out, "\n## {}\n\n{}\n", heading, content);
                    }
                }
                SecondaryResource::Transcript(entries) if !entries.is_empty() => {
                    let _ = write!(out, "\n## Transcript\n\n");
                    for entry in entries {
                        match entry.speaker.as_deref().filter(|s| !s.is_empty()) {
                            Some(speaker) => {
                                let _ = writeln!(out, "**{}:** {}", speaker, entry.text.trim());
                            }
                            None => {
                                let _ = writeln!(out, "{}", entry.text.trim());
                            }
                        }
                    }
                }
                SecondaryResource::Transcript(_) => {}
            }
        }

        out
    }
}

/// `{folder}/{YYYY-MM-DD} {title}.md`, dated by creation time.
#[derive(Debug, Clone)]
pub struct DatePathGenerator {
    folder: String,
}

impl DatePathGenerator {
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
        }
    }
}

impl Default for DatePathGenerator {
    fn default() -> Self {
        Self::new("Meetings")
    }
}

/// Strip characters that are unsafe in file names and collapse whitespace.
pub fn sanitize_file_name(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_start_matches('.').trim();
    let truncated: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
    let truncated = truncated.trim_end_matches(['.', ' ']).to_string();

    if truncated.is_empty() {
        UNTITLED.to_string()
    } else {
        truncated
    }
}

impl PathGenerator for DatePathGenerator {
    fn generate(&self, item: &Item) -> Result<MirrorPath> {
        let name = format!(
            "{} {}.md",
            item.created_at.format("%Y-%m-%d"),
            sanitize_file_name(&item.title)
        );
        MirrorPath::parse(&self.folder)?.join(&name)
    }
}
