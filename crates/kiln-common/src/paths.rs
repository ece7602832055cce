//! Standard filesystem paths for Kiln.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Kiln data.
///
/// `KILN_ROOT` overrides it; otherwise the user cache directory is used so
/// builds work without elevated privileges.
pub static KILN_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KILN_ROOT").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("kiln")
    })
});

/// Standard paths used by the builder.
#[derive(Debug, Clone)]
pub struct KilnPaths {
    /// Root data directory.
    pub root: PathBuf,
}

impl KilnPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layer cache directory.
    #[must_use]
    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Scratch space for stage root filesystems.
    #[must_use]
    pub fn work(&self) -> PathBuf {
        self.root.join("work")
    }
}

impl Default for KilnPaths {
    fn default() -> Self {
        Self {
            root: KILN_ROOT.clone(),
        }
    }
}
