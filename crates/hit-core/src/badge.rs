//! Badge renderer interface.

use crate::error::CollaboratorError;
use crate::icon::Icon;
use crate::key::Count;

/// Turns a count (and optional icon) into image bytes.
///
/// Rendering must be a pure function of its inputs.
pub trait BadgeWriter: Send + Sync {
    fn render(&self, icon: Option<&Icon>, count: Count) -> Result<Vec<u8>, CollaboratorError>;
}

/// Approximate glyph width in pixels for the 11px badge font.
const CHAR_WIDTH: usize = 7;
const PADDING: usize = 6;
const ICON_WIDTH: usize = 16;
const HEIGHT: usize = 20;

/// Flat two-segment SVG badge: `[icon] label | count`.
#[derive(Debug, Clone)]
pub struct FlatBadge {
    label: String,
    label_color: String,
    count_color: String,
}

impl FlatBadge {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

impl Default for FlatBadge {
    fn default() -> Self {
        Self {
            label: "hits".to_string(),
            label_color: "#555".to_string(),
            count_color: "#79C83D".to_string(),
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl BadgeWriter for FlatBadge {
    fn render(&self, icon: Option<&Icon>, count: Count) -> Result<Vec<u8>, CollaboratorError> {
        let count_text = count.format();
        let icon_width = if icon.is_some() { ICON_WIDTH } else { 0 };
        let label_width = icon_width + self.label.chars().count() * CHAR_WIDTH + PADDING * 2;
        let count_width = count_text.chars().count() * CHAR_WIDTH + PADDING * 2;
        let total = label_width + count_width;

        let icon_svg = match icon {
            Some(icon) => format!(
                r##"<circle cx="{cx}" cy="10" r="6" fill="{color}"/><text x="{cx}" y="13" font-size="7" fill="#fff" text-anchor="middle">{glyph}</text>"##,
                cx = PADDING + 6,
                color = escape(&icon.color),
                glyph = escape(&icon.glyph),
            ),
            None => String::new(),
        };

        let svg = format!(
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{total}" height="{HEIGHT}" role="img" aria-label="{label}: {count_text}"><rect width="{label_width}" height="{HEIGHT}" fill="{label_color}"/><rect x="{label_width}" width="{count_width}" height="{HEIGHT}" fill="{count_color}"/>{icon_svg}<g fill="#fff" font-family="Verdana,sans-serif" font-size="11" text-anchor="middle"><text x="{label_x}" y="14">{label}</text><text x="{count_x}" y="14">{count_text}</text></g></svg>"##,
            label = escape(&self.label),
            label_color = escape(&self.label_color),
            count_color = escape(&self.count_color),
            label_x = icon_width + (label_width - icon_width) / 2,
            count_x = label_width + count_width / 2,
        );

        Ok(svg.into_bytes())
    }
}
