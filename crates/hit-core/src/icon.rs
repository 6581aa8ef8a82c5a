//! Icon catalog.
//!
//! The catalog is built once at startup with [`build_icon_catalog`] and shared
//! read-only (behind an `Arc`) by everything that renders badges. It never
//! changes after construction, so no synchronization is needed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};


/// URL prefix under which icons are exposed in the discovery listing.
pub const ICON_URL_PREFIX: &str = "/icon/";

/// Badge metadata for one icon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Icon {
    /// Catalog name (lowercase, e.g. "github")
    pub name: String,

    /// Brand color as a hex string (e.g. "#181717")
    pub color: String,

    /// Short glyph drawn inside the icon circle
    pub glyph: String,
}

impl Icon {
    pub fn new(name: impl Into<String>, color: impl Into<String>, glyph: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            glyph: glyph.into(),
        }
    }
}

/// Discovery entry: `{name, url}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IconEntry {
    pub name: String,
    pub url: String,
}

/// Immutable mapping from icon name to metadata, plus its derived listing.
#[derive(Debug, Clone, Default)]
pub struct IconCatalog {
    icons: BTreeMap<String, Icon>,
    listing: Vec<IconEntry>,
}

impl IconCatalog {
    /// Builds a catalog from a set of icons.
    ///
    /// Later duplicates replace earlier ones. The listing is sorted by name.
    pub fn from_icons(icons: impl IntoIterator<Item = Icon>) -> Self {
        let icons: BTreeMap<String, Icon> = icons
            .into_iter()
            .map(|icon| (icon.name.clone(), icon))
            .collect();

        let listing = icons
            .keys()
            .map(|name| IconEntry {
                name: name.clone(),
                url: format!("{ICON_URL_PREFIX}{name}"),
            })
            .collect();

        Self { icons, listing }
    }

    pub fn get(&self, name: &str) -> Option<&Icon> {
        self.icons.get(name)
    }

    /// Returns the `{name, url}` listing used for discovery.
    pub fn list(&self) -> &[IconEntry] {
        &self.listing
    }

    pub fn len(&self) -> usize {
        self.icons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.icons.is_empty()
    }
}

/// Builds the built-in icon catalog.
///
/// Call once during startup and pass the result by reference (or `Arc`) to
/// whatever needs it.
pub fn build_icon_catalog() -> IconCatalog {
    IconCatalog::from_icons([
        Icon::new("github", "#181717", "G"),
        Icon::new("gitlab", "#FC6D26", "GL"),
        Icon::new("bitbucket", "#0052CC", "B"),
        Icon::new("rust", "#000000", "R"),
        Icon::new("go", "#00ADD8", "Go"),
        Icon::new("python", "#3776AB", "Py"),
        Icon::new("javascript", "#F7DF1E", "JS"),
        Icon::new("docker", "#2496ED", "D"),
        Icon::new("npm", "#CB3837", "n"),
        Icon::new("twitter", "#1DA1F2", "T"),
        Icon::new("youtube", "#FF0000", "Y"),
        Icon::new("medium", "#12100E", "M"),
    ])
}
