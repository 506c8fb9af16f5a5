//! Symlink Publisher
//!
//! Creates the per-storage-class symlinks that persistent volumes point
//! at. Publishing is idempotent: a link that already resolves to the
//! same device counts as success.

use crate::error::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Mode of every symlink directory
pub const DIR_MODE: u32 = 0o755;

/// A symlink that now exists under a storage-class directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedLink {
    pub link: PathBuf,
    /// False when an equivalent link was already in place
    pub created: bool,
}

/// A symlink found while scanning a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub link: PathBuf,
    /// Canonical target, `None` when the link dangles
    pub target: Option<PathBuf>,
}

/// Create a directory (and parents) with mode 0755
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| Error::Symlink {
            link: dir.display().to_string(),
            reason: format!("creating directory: {}", e),
        })
}

/// Whether two paths resolve to the same file
pub fn resolves_to_same(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Publish `target_dir/link_name -> source`
pub fn publish(source: &Path, target_dir: &Path, link_name: &str) -> Result<PublishedLink> {
    ensure_dir(target_dir)?;
    let link = target_dir.join(link_name);

    if fs::symlink_metadata(&link).is_ok() {
        return revalidate(source, link);
    }

    match std::os::unix::fs::symlink(source, &link) {
        Ok(()) => {
            info!("Created symlink {} -> {}", link.display(), source.display());
            Ok(PublishedLink { link, created: true })
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => revalidate(source, link),
        Err(e) => Err(Error::Symlink {
            link: link.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

fn revalidate(source: &Path, link: PathBuf) -> Result<PublishedLink> {
    let is_link = fs::symlink_metadata(&link)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);

    if is_link && resolves_to_same(&link, source) {
        debug!("Symlink {} already points at {}", link.display(), source.display());
        return Ok(PublishedLink { link, created: false });
    }

    let existing = fs::read_link(&link)
        .map(|t| t.display().to_string())
        .unwrap_or_else(|_| "not a symlink".to_string());
    Err(Error::SymlinkConflict {
        link: link.display().to_string(),
        existing,
    })
}

/// List the symlinks directly inside `dir`; a missing directory is empty
pub fn list_links(dir: &Path) -> Result<Vec<LinkEntry>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut links = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_symlink() {
            continue;
        }
        let link = entry.path();
        let target = fs::canonicalize(&link).ok();
        links.push(LinkEntry { link, target });
    }
    links.sort_by(|a, b| a.link.cmp(&b.link));
    Ok(links)
}

/// Remove a symlink; an absent link is not an error
pub fn remove_link(link: &Path) -> Result<()> {
    match fs::remove_file(link) {
        Ok(()) => {
            info!("Removed symlink {}", link.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_publish_creates_dir_and_link() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("sdb");
        fs::write(&dev, b"").unwrap();
        let sc_dir = tmp.path().join("root").join("fast");

        let published = publish(&dev, &sc_dir, "wwn-0x1").unwrap();
        assert!(published.created);
        assert_eq!(published.link, sc_dir.join("wwn-0x1"));
        assert!(resolves_to_same(&published.link, &dev));

        assert!(sc_dir.is_dir());
    }

    #[test]
    fn test_publish_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("sdb");
        fs::write(&dev, b"").unwrap();
        let sc_dir = tmp.path().join("fast");

        publish(&dev, &sc_dir, "sdb").unwrap();
        let again = publish(&dev, &sc_dir, "sdb").unwrap();
        assert!(!again.created);
    }

    #[test]
    fn test_publish_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let sdb = tmp.path().join("sdb");
        let sdc = tmp.path().join("sdc");
        fs::write(&sdb, b"").unwrap();
        fs::write(&sdc, b"").unwrap();
        let sc_dir = tmp.path().join("fast");

        publish(&sdb, &sc_dir, "disk").unwrap();
        assert_matches!(publish(&sdc, &sc_dir, "disk"), Err(Error::SymlinkConflict { .. }));
    }

    #[test]
    fn test_list_and_remove_links() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("sdb");
        fs::write(&dev, b"").unwrap();
        let sc_dir = tmp.path().join("fast");

        publish(&dev, &sc_dir, "a").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone"), sc_dir.join("b")).unwrap();
        fs::write(sc_dir.join("plain"), b"").unwrap();

        let links = list_links(&sc_dir).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links[0].target.is_some());
        assert!(links[1].target.is_none());

        remove_link(&sc_dir.join("a")).unwrap();
        remove_link(&sc_dir.join("a")).unwrap();
        assert_eq!(list_links(&sc_dir).unwrap().len(), 1);
        assert!(list_links(&tmp.path().join("missing")).unwrap().is_empty());
    }
}
