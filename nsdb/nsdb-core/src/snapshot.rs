//! Durable snapshots of tree subtrees.
//!
//! A snapshot file records where in the tree the subtree was taken from, so
//! [`build`] can mount it back without further context.

use crate::tree::{Node, Tree, TreeError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

const FORMAT: &str = "nsdb-snapshot/1";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported snapshot format [{0}]")]
    Format(String),
    #[error("snapshot checksum mismatch for {0}")]
    Checksum(String),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    format: String,
    root: String,
    exported_at: String,
    checksum: u32,
    tree: Node,
}

fn checksum(node: &Node) -> u32 {
    // Node maps are ordered, so the encoding is stable across runs.
    let bytes = serde_json::to_vec(node).unwrap_or_default();
    crc32fast::hash(&bytes)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Staged exports are created next to their destination with this prefix.
/// Durable file names never start with a dot.
pub const STAGING_PREFIX: &str = ".staging-";

/// Write the subtree rooted at `root` to `dest`.
///
/// The file is staged under a unique hidden name next to its destination and
/// renamed into place, so a crash mid-export never leaves a truncated
/// snapshot behind and concurrent exports never share a staging file.
pub fn export(tree: &Tree, root: &str, dest: &Path) -> Result<()> {
    let node = tree.subtree(root)?;
    let file = SnapshotFile {
        format: FORMAT.to_string(),
        root: root.to_string(),
        exported_at: Utc::now().to_rfc3339(),
        checksum: checksum(node),
        tree: node.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&file).map_err(|source| SnapshotError::Decode {
        path: dest.display().to_string(),
        source,
    })?;
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(io_err(parent))?;

    let mut staged = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(parent)
        .map_err(io_err(parent))?;
    let staged_path = staged.path().to_path_buf();
    staged.write_all(&bytes).map_err(io_err(&staged_path))?;
    staged
        .as_file()
        .sync_all()
        .map_err(io_err(&staged_path))?;
    staged.persist(dest).map_err(|err| SnapshotError::Io {
        path: dest.display().to_string(),
        source: err.error,
    })?;
    Ok(())
}

/// Load a snapshot file and mount its subtree into `tree`.
///
/// Returns the path the subtree was mounted at.
pub fn build(tree: &mut Tree, src: &Path) -> Result<String> {
    let bytes = std::fs::read(src).map_err(io_err(src))?;
    let file: SnapshotFile =
        serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Decode {
            path: src.display().to_string(),
            source,
        })?;
    if file.format != FORMAT {
        return Err(SnapshotError::Format(file.format));
    }
    if checksum(&file.tree) != file.checksum {
        return Err(SnapshotError::Checksum(src.display().to_string()));
    }
    tree.mount(&file.root, file.tree)?;
    Ok(file.root)
}
