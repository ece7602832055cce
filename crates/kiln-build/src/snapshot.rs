//! Filesystem snapshots and layer archives.
//!
//! A layer is the difference between a stage root filesystem before and
//! after a RUN or COPY. Snapshots fingerprint every entry, [`Snapshot::diff`]
//! finds what changed, and [`pack_changes`] writes those changes as a
//! reproducible tar: sorted paths, zeroed timestamps and owners, and OCI
//! whiteout markers (`.wh.<name>`) for removed paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kiln_common::Digest;
use sha2::{Digest as _, Sha256};
use walkdir::WalkDir;

const WHITEOUT_PREFIX: &str = ".wh.";

/// Fingerprint of a single filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    /// Regular file: content hash and permission bits.
    File {
        /// Hex SHA-256 of the contents.
        hash: String,
        /// Permission bits.
        mode: u32,
    },
    /// Directory and its permission bits.
    Dir {
        /// Permission bits.
        mode: u32,
    },
    /// Symbolic link.
    Symlink {
        /// Link target, uninterpreted.
        target: PathBuf,
    },
}

impl Fingerprint {
    fn of(path: &Path, file_type: std::fs::FileType) -> io::Result<Option<Self>> {
        if file_type.is_symlink() {
            return Ok(Some(Self::Symlink {
                target: std::fs::read_link(path)?,
            }));
        }
        let mode = std::fs::metadata(path)?.permissions().mode() & 0o7777;
        if file_type.is_dir() {
            return Ok(Some(Self::Dir { mode }));
        }
        if file_type.is_file() {
            let mut hasher = Sha256::new();
            io::copy(&mut File::open(path)?, &mut hasher)?;
            return Ok(Some(Self::File {
                hash: hex::encode(hasher.finalize()),
                mode,
            }));
        }
        // Sockets, fifos and devices are not part of layers.
        Ok(None)
    }

    fn canonical(&self) -> String {
        match self {
            Self::File { hash, mode } => format!("file {mode:o} {hash}"),
            Self::Dir { mode } => format!("dir {mode:o}"),
            Self::Symlink { target } => format!("symlink {}", target.display()),
        }
    }
}

/// Fingerprints of every entry under a root, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, Fingerprint>,
}

/// Paths that differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Added or modified paths, sorted.
    pub upserts: Vec<PathBuf>,
    /// Removed paths, sorted. Children of a removed directory are omitted.
    pub removals: Vec<PathBuf>,
}

impl Changes {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

impl Snapshot {
    /// Fingerprint everything below `root` (the root itself excluded).
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read.
    pub fn capture(root: &Path) -> io::Result<Self> {
        let mut entries = BTreeMap::new();
        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(io::Error::other)?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .to_path_buf();
            if let Some(fingerprint) = Fingerprint::of(entry.path(), entry.file_type())? {
                entries.insert(relative, fingerprint);
            }
        }
        Ok(Self { entries })
    }

    /// Number of entries.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// What changed going from `before` to `after`.
    #[must_use]
    pub fn diff(before: &Self, after: &Self) -> Changes {
        let upserts = after
            .entries
            .iter()
            .filter(|(path, fingerprint)| before.entries.get(*path) != Some(*fingerprint))
            .map(|(path, _)| path.clone())
            .collect();

        let removed: BTreeSet<&Path> = before
            .entries
            .keys()
            .filter(|path| !after.entries.contains_key(*path))
            .map(PathBuf::as_path)
            .collect();
        let removals = removed
            .iter()
            .filter(|path| !path.ancestors().skip(1).any(|a| removed.contains(a)))
            .map(|path| path.to_path_buf())
            .collect();

        Changes { upserts, removals }
    }
}

/// Digest of the files at `paths` (each walked recursively), keyed relative
/// to `base`. Used as cache material for COPY.
///
/// # Errors
///
/// Returns an error if any path cannot be read.
pub fn content_digest(base: &Path, paths: &[PathBuf]) -> io::Result<Digest> {
    let mut parts = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
            if let Some(fingerprint) = Fingerprint::of(entry.path(), entry.file_type())? {
                parts.push(format!("{} {}", relative.display(), fingerprint.canonical()));
            }
        }
    }
    Ok(Digest::of_parts(&parts))
}

/// A packed layer: tar bytes and their digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerArtifact {
    /// Uncompressed tar archive.
    pub bytes: Vec<u8>,
    /// SHA-256 of `bytes`.
    pub digest: Digest,
}

impl LayerArtifact {
    /// Wrap tar bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        let digest = Digest::of(&bytes);
        Self { bytes, digest }
    }

    /// Archive size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

fn base_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn whiteout_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let marker = format!("{WHITEOUT_PREFIX}{name}");
    path.parent()
        .map_or_else(|| PathBuf::from(&marker), |parent| parent.join(&marker))
}

/// Pack `changes` under `root` into a reproducible tar archive.
///
/// # Errors
///
/// Returns an error if a changed path cannot be read.
pub fn pack_changes(root: &Path, changes: &Changes) -> io::Result<LayerArtifact> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for removed in &changes.removals {
        let mut header = base_header(tar::EntryType::Regular, 0o644, 0);
        builder.append_data(&mut header, whiteout_path(removed), io::empty())?;
    }

    for relative in &changes.upserts {
        let full = root.join(relative);
        let metadata = std::fs::symlink_metadata(&full)?;
        let file_type = metadata.file_type();
        let mode = metadata.permissions().mode() & 0o7777;

        if file_type.is_symlink() {
            let target = std::fs::read_link(&full)?;
            let mut header = base_header(tar::EntryType::Symlink, 0o777, 0);
            builder.append_link(&mut header, relative, target)?;
        } else if file_type.is_dir() {
            let mut header = base_header(tar::EntryType::Directory, mode, 0);
            builder.append_data(&mut header, relative, io::empty())?;
        } else if file_type.is_file() {
            let mut header = base_header(tar::EntryType::Regular, mode, metadata.len());
            builder.append_data(&mut header, relative, File::open(&full)?)?;
        }
    }

    Ok(LayerArtifact::new(builder.into_inner()?))
}

/// Unpack a layer archive onto `root`, applying whiteouts.
///
/// # Errors
///
/// Returns an error if the archive is malformed or cannot be written.
pub fn apply_artifact(root: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut archive = tar::Archive::new(bytes);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let whiteout = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(WHITEOUT_PREFIX))
            .map(str::to_string);
        if let Some(name) = whiteout {
            let target = root.join(path.parent().unwrap_or(Path::new(""))).join(name);
            remove_path(&target)?;
            continue;
        }

        // A path can change type between layers.
        let target = root.join(&path);
        if let Ok(existing) = std::fs::symlink_metadata(&target) {
            let incoming_dir = entry.header().entry_type().is_dir();
            if existing.is_dir() != incoming_dir {
                remove_path(&target)?;
            }
        }

        entry.unpack_in(root)?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Saved state of a root filesystem that a failed command can be rolled
/// back to.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    snapshot: Snapshot,
    archive: LayerArtifact,
}

impl Checkpoint {
    /// Save `root`, whose current state is `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read.
    pub fn save(root: &Path, snapshot: Snapshot) -> io::Result<Self> {
        let archive = pack_changes(root, &Snapshot::diff(&Snapshot::default(), &snapshot))?;
        tracing::debug!(entries = snapshot.len(), size = archive.size(), "Saved checkpoint");
        Ok(Self { snapshot, archive })
    }

    /// Return `root` to the saved state: paths created since are removed,
    /// modified and removed paths are rewritten from the saved archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read or written.
    pub fn restore(&self, root: &Path) -> io::Result<()> {
        let changes = Snapshot::diff(&self.snapshot, &Snapshot::capture(root)?);
        if changes.is_empty() {
            return Ok(());
        }
        for path in &changes.upserts {
            if !self.snapshot.contains(path) {
                remove_path(&root.join(path))?;
            }
        }
        apply_artifact(root, &self.archive.bytes)
    }
}

/// Recursively copy `src` into `dst`, preserving symlinks and modes.
///
/// # Errors
///
/// Returns an error if any entry cannot be copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        // A file source has an empty relative path; joining it would add a trailing slash.
        let target = if relative.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(relative)
        };
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            let mode = entry.metadata().map_err(io::Error::other)?.permissions().mode();
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        } else if file_type.is_symlink() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            remove_path(&target)?;
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
