//! Alarm sound catalog and resolution.
//!
//! Sounds are `<name>.wav` files in the sounds directory, restricted to a
//! small fixed catalog. A requested name resolves case-insensitively; when
//! it is unknown or its file is missing, the configured preference order is
//! tried, and finally the built-in default alert tone.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Every sound name the catalog recognizes.
pub const CATALOG: &[&str] = &[
    "radar", "classic", "beacon", "chimes", "circuit", "signal", "sunrise", "birdsong",
];

/// Fallback order used when the chosen sound cannot be played.
pub const DEFAULT_PREFERENCE: &[&str] = &["radar", "classic", "beacon", "chimes"];

/// What a player should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoundSource {
    /// A catalog sound file
    Asset { name: String, path: PathBuf },
    /// Built-in alert tone, always available
    DefaultAlert,
}

impl SoundSource {
    pub fn name(&self) -> &str {
        match self {
            SoundSource::Asset { name, .. } => name,
            SoundSource::DefaultAlert => "default-alert",
        }
    }
}

/// Catalog entries with the asset files found on disk.
#[derive(Debug, Clone)]
pub struct SoundCatalog {
    dir: PathBuf,
    /// Lowercase catalog name -> file path, only for files that exist
    available: HashMap<String, PathBuf>,
    preference: Vec<String>,
}

/// Find the catalog entry matching `name`, ignoring case and surrounding space.
pub fn catalog_name(name: &str) -> Option<&'static str> {
    let name = name.trim();
    CATALOG.iter().copied().find(|c| c.eq_ignore_ascii_case(name))
}

impl SoundCatalog {
    /// Scan `dir` for catalog sounds. A missing directory yields an empty catalog.
    pub fn scan(dir: impl Into<PathBuf>, preference: &[String]) -> Self {
        let dir = dir.into();
        let available = scan_dir(&dir);
        debug!(
            "Sound catalog: {} asset(s) available in {}",
            available.len(),
            dir.display()
        );
        Self {
            dir,
            available,
            preference: preference.to_vec(),
        }
    }

    /// Build a catalog from already known asset files.
    pub fn from_assets(assets: Vec<(String, PathBuf)>, preference: &[String]) -> Self {
        let available = assets
            .into_iter()
            .filter_map(|(name, path)| catalog_name(&name).map(|c| (c.to_string(), path)))
            .collect();
        Self {
            dir: PathBuf::new(),
            available,
            preference: preference.to_vec(),
        }
    }

    /// Re-read the sounds directory.
    pub fn rescan(&mut self) {
        if !self.dir.as_os_str().is_empty() {
            self.available = scan_dir(&self.dir);
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Catalog names paired with whether their file is present.
    pub fn entries(&self) -> Vec<(&'static str, bool)> {
        CATALOG
            .iter()
            .map(|name| (*name, self.available.contains_key(*name)))
            .collect()
    }

    fn asset(&self, name: &str) -> Option<SoundSource> {
        let name = catalog_name(name)?;
        self.available.get(name).map(|path| SoundSource::Asset {
            name: name.to_string(),
            path: path.clone(),
        })
    }

    /// Best single source for `requested`.
    pub fn resolve(&self, requested: &str) -> SoundSource {
        self.fallback_chain(requested)
            .into_iter()
            .next()
            .unwrap_or(SoundSource::DefaultAlert)
    }

    /// Ordered sources to try: the requested sound, the preference order,
    /// then the default alert tone. No duplicates, always non-empty.
    pub fn fallback_chain(&self, requested: &str) -> Vec<SoundSource> {
        let mut chain = Vec::new();

        match self.asset(requested) {
            Some(source) => chain.push(source),
            None => warn!(
                "Sound '{}' not available, falling back to preference order",
                requested
            ),
        }

        for name in &self.preference {
            if let Some(source) = self.asset(name) {
                if !chain.contains(&source) {
                    chain.push(source);
                }
            }
        }

        chain.push(SoundSource::DefaultAlert);
        chain
    }
}

fn scan_dir(dir: &Path) -> HashMap<String, PathBuf> {
    let mut available = HashMap::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return available;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_wav = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
        if !is_wav || !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(name) = catalog_name(stem) {
            available.insert(name.to_string(), path);
        }
    }

    available
}
