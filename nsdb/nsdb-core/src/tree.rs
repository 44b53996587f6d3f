//! In-memory hierarchical namespace backing the document store.
//!
//! Every entry is addressed by an absolute `/`-separated path. Directories
//! hold named children, files hold string content. The tree is the single
//! source of truth between saves; durable copies are produced by
//! [`crate::snapshot`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("no such entry [{0}]")]
    NotFound(String),
    #[error("entry already exists [{0}]")]
    AlreadyExists(String),
    #[error("not a directory [{0}]")]
    NotADirectory(String),
    #[error("is a directory [{0}]")]
    IsADirectory(String),
    #[error("directory not empty [{0}]")]
    NotEmpty(String),
    #[error("cannot modify the tree root")]
    Root,
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// A single entry of the tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Node {
    Dir(BTreeMap<String, Node>),
    File(String),
}

impl Node {
    pub fn empty_dir() -> Self {
        Node::Dir(BTreeMap::new())
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }
}

/// Split an absolute path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    root: Node,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            root: Node::empty_dir(),
        }
    }

    fn node(&self, path: &str) -> Option<&Node> {
        let mut current = &self.root;
        for seg in segments(path) {
            match current {
                Node::Dir(children) => current = children.get(seg)?,
                Node::File(_) => return None,
            }
        }
        Some(current)
    }

    /// Resolve the parent directory of `path` and return it with the final
    /// segment.
    fn parent_mut<'a>(
        &mut self,
        path: &'a str,
    ) -> Result<(&mut BTreeMap<String, Node>, &'a str)> {
        let segs = segments(path);
        let (&last, parents) = segs.split_last().ok_or(TreeError::Root)?;
        let mut current = &mut self.root;
        for seg in parents {
            current = match current {
                Node::Dir(children) => children
                    .get_mut(*seg)
                    .ok_or_else(|| TreeError::NotFound(path.to_string()))?,
                Node::File(_) => return Err(TreeError::NotADirectory(path.to_string())),
            };
        }
        match current {
            Node::Dir(children) => Ok((children, last)),
            Node::File(_) => Err(TreeError::NotADirectory(path.to_string())),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.node(path).is_some_and(Node::is_dir)
    }

    pub fn read(&self, path: &str) -> Result<&str> {
        match self.node(path) {
            Some(Node::File(content)) => Ok(content.as_str()),
            Some(Node::Dir(_)) => Err(TreeError::IsADirectory(path.to_string())),
            None => Err(TreeError::NotFound(path.to_string())),
        }
    }

    /// Create or replace a file. The parent directory must already exist.
    pub fn write(&mut self, path: &str, content: impl Into<String>) -> Result<()> {
        let (dir, name) = self.parent_mut(path)?;
        if dir.get(name).is_some_and(Node::is_dir) {
            return Err(TreeError::IsADirectory(path.to_string()));
        }
        dir.insert(name.to_string(), Node::File(content.into()));
        Ok(())
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let (dir, name) = self.parent_mut(path)?;
        if dir.contains_key(name) {
            return Err(TreeError::AlreadyExists(path.to_string()));
        }
        dir.insert(name.to_string(), Node::empty_dir());
        Ok(())
    }

    /// Remove a directory. Without `recursive` the directory must be empty.
    pub fn rmdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        let (dir, name) = self.parent_mut(path)?;
        match dir.get(name) {
            Some(Node::Dir(children)) if !recursive && !children.is_empty() => {
                Err(TreeError::NotEmpty(path.to_string()))
            }
            Some(Node::Dir(_)) => {
                dir.remove(name);
                Ok(())
            }
            Some(Node::File(_)) => Err(TreeError::NotADirectory(path.to_string())),
            None => Err(TreeError::NotFound(path.to_string())),
        }
    }

    /// Remove a file.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (dir, name) = self.parent_mut(path)?;
        match dir.get(name) {
            Some(Node::File(_)) => {
                dir.remove(name);
                Ok(())
            }
            Some(Node::Dir(_)) => Err(TreeError::IsADirectory(path.to_string())),
            None => Err(TreeError::NotFound(path.to_string())),
        }
    }

    /// Names of the direct children of a directory, sorted.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        match self.node(path) {
            Some(Node::Dir(children)) => Ok(children.keys().cloned().collect()),
            Some(Node::File(_)) => Err(TreeError::NotADirectory(path.to_string())),
            None => Err(TreeError::NotFound(path.to_string())),
        }
    }

    pub fn subtree(&self, path: &str) -> Result<&Node> {
        self.node(path)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))
    }

    /// Place `node` at `path`, creating missing parent directories and
    /// replacing whatever was there before.
    pub fn mount(&mut self, path: &str, node: Node) -> Result<()> {
        let segs = segments(path);
        let (&last, parents) = segs.split_last().ok_or(TreeError::Root)?;
        let mut current = &mut self.root;
        for seg in parents {
            current = match current {
                Node::Dir(children) => children
                    .entry(seg.to_string())
                    .or_insert_with(Node::empty_dir),
                Node::File(_) => return Err(TreeError::NotADirectory(path.to_string())),
            };
        }
        match current {
            Node::Dir(children) => {
                children.insert(last.to_string(), node);
                Ok(())
            }
            Node::File(_) => Err(TreeError::NotADirectory(path.to_string())),
        }
    }
}
