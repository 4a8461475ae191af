//! Shared file tree document.
//!
//! The tree is stored flat: every node is a record keyed by its id and
//! points at its parent. Children are derived on read, so a rename or
//! move only ever touches one record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::patch::Patch;
use crate::record::{Record, RecordId};
use crate::replica::{ApplyReport, ListenFilter, ListenerId, Origin, Replica};

pub const ROOT_ID: &str = "root";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileTreeError {
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("node {0} is not a directory")]
    NotADirectory(String),
    #[error("node {0} is not a file")]
    NotAFile(String),
    #[error("the root directory cannot be renamed or deleted")]
    RootImmutable,
    #[error("{parent} already contains {name}")]
    DuplicateName { parent: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub id: RecordId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub parent_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub is_open: bool,
}

impl Record for FileNode {
    fn id(&self) -> &RecordId {
        &self.id
    }
}

impl FileNode {
    pub fn file(name: impl Into<String>, parent: &RecordId, content: impl Into<String>) -> Self {
        Self {
            id: RecordId::generate(""),
            name: name.into(),
            kind: NodeKind::File,
            parent_id: Some(parent.clone()),
            content: Some(content.into()),
            is_open: false,
        }
    }

    pub fn directory(name: impl Into<String>, parent: &RecordId) -> Self {
        Self {
            id: RecordId::generate(""),
            name: name.into(),
            kind: NodeKind::Directory,
            parent_id: Some(parent.clone()),
            content: None,
            is_open: false,
        }
    }

    pub fn root(name: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(ROOT_ID),
            name: name.into(),
            kind: NodeKind::Directory,
            parent_id: None,
            content: None,
            is_open: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// File tree replica with hierarchical queries.
#[derive(Debug)]
pub struct FileTree {
    replica: Replica<FileNode>,
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new("workspace")
    }
}

impl FileTree {
    /// A tree holding only the root directory. The root is part of the
    /// baseline, so it is never reported as a pending local change.
    pub fn new(root_name: &str) -> Self {
        Self {
            replica: Replica::with_records([FileNode::root(root_name)]),
        }
    }

    pub fn replica(&self) -> &Replica<FileNode> {
        &self.replica
    }

    pub fn replica_mut(&mut self) -> &mut Replica<FileNode> {
        &mut self.replica
    }

    pub fn get(&self, id: &str) -> Option<&FileNode> {
        self.replica.get(id)
    }

    pub fn len(&self) -> usize {
        self.replica.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replica.is_empty()
    }

    pub fn apply(&mut self, patch: &Patch<FileNode>, origin: Origin) -> ApplyReport {
        self.replica.apply(patch, origin)
    }

    pub fn listen(
        &mut self,
        filter: ListenFilter,
        listener: impl FnMut(&Patch<FileNode>, Origin) + Send + 'static,
    ) -> ListenerId {
        self.replica.listen(filter, listener)
    }

    /// Drop every node and start over with a bare root.
    pub fn reset(&mut self, root_name: &str) {
        self.replica.reset();
        self.replica
            .apply(&Patch::new().with_added(FileNode::root(root_name)), Origin::Remote);
    }

    /// Children of `id`, directories first, then by name.
    pub fn children(&self, id: &str) -> Vec<&FileNode> {
        let mut children: Vec<&FileNode> = self
            .replica
            .iter()
            .filter(|n| n.parent_id.as_ref().is_some_and(|p| p.as_str() == id))
            .collect();
        children.sort_by(|a, b| {
            b.is_dir()
                .cmp(&a.is_dir())
                .then_with(|| a.name.cmp(&b.name))
        });
        children
    }

    /// Display path of a node: `./src/main.rs`. The root directory is not
    /// part of the path; asking for the root itself yields `./<root name>`.
    pub fn path_of(&self, id: &str) -> Option<String> {
        let node = self.replica.get(id)?;
        if node.id.as_str() == ROOT_ID {
            return Some(format!("./{}", node.name));
        }

        let mut segments = vec![node.name.as_str()];
        let mut cursor = node.parent_id.as_ref();
        let mut depth = 0;
        while let Some(parent_id) = cursor {
            if parent_id.as_str() == ROOT_ID {
                break;
            }
            let parent = self.replica.get(parent_id.as_str())?;
            segments.push(parent.name.as_str());
            cursor = parent.parent_id.as_ref();
            depth += 1;
            if depth > self.replica.len() {
                log::warn!("Parent cycle while resolving path of {id}");
                return None;
            }
        }

        segments.reverse();
        Some(format!("./{}", segments.join("/")))
    }

    /// `id` followed by all of its descendants.
    pub fn subtree_ids(&self, id: &str) -> Vec<RecordId> {
        let mut by_parent: BTreeMap<&str, Vec<&RecordId>> = BTreeMap::new();
        for node in self.replica.iter() {
            if let Some(parent) = &node.parent_id {
                by_parent.entry(parent.as_str()).or_default().push(&node.id);
            }
        }

        let mut out = Vec::new();
        if !self.replica.contains(id) {
            return out;
        }
        let mut stack = vec![RecordId::new(id)];
        while let Some(next) = stack.pop() {
            if let Some(kids) = by_parent.get(next.as_str()) {
                stack.extend(kids.iter().map(|k| (*k).clone()));
            }
            if out.contains(&next) {
                continue;
            }
            out.push(next);
        }
        out
    }

    fn existing(&self, id: &str) -> Result<&FileNode, FileTreeError> {
        self.replica
            .get(id)
            .ok_or_else(|| FileTreeError::UnknownNode(id.to_string()))
    }

    fn check_name_free(&self, parent: &str, name: &str, except: &str) -> Result<(), FileTreeError> {
        if self
            .children(parent)
            .iter()
            .any(|c| c.name == name && c.id.as_str() != except)
        {
            return Err(FileTreeError::DuplicateName {
                parent: parent.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Patch inserting `node` under its parent.
    pub fn create_patch(&self, node: FileNode) -> Result<Patch<FileNode>, FileTreeError> {
        let parent_id = node
            .parent_id
            .clone()
            .ok_or(FileTreeError::RootImmutable)?;
        let parent = self.existing(parent_id.as_str())?;
        if !parent.is_dir() {
            return Err(FileTreeError::NotADirectory(parent_id.to_string()));
        }
        self.check_name_free(parent_id.as_str(), &node.name, node.id.as_str())?;
        Ok(Patch::new().with_added(node))
    }

    /// Patch inserting `node`, or replacing the node with the same id.
    /// Used for nodes that arrive from peers, which are already validated.
    pub fn upsert_patch(&self, node: FileNode) -> Patch<FileNode> {
        match self.replica.get(node.id.as_str()) {
            Some(existing) => Patch::new().with_updated(existing.clone(), node),
            None => Patch::new().with_added(node),
        }
    }

    pub fn rename_patch(&self, id: &str, name: &str) -> Result<Patch<FileNode>, FileTreeError> {
        if id == ROOT_ID {
            return Err(FileTreeError::RootImmutable);
        }
        let node = self.existing(id)?;
        if let Some(parent) = &node.parent_id {
            self.check_name_free(parent.as_str(), name, id)?;
        }
        let mut renamed = node.clone();
        renamed.name = name.to_string();
        Ok(Patch::new().with_updated(node.clone(), renamed))
    }

    pub fn content_patch(&self, id: &str, content: &str) -> Result<Patch<FileNode>, FileTreeError> {
        let node = self.existing(id)?;
        if node.is_dir() {
            return Err(FileTreeError::NotAFile(id.to_string()));
        }
        let mut edited = node.clone();
        edited.content = Some(content.to_string());
        Ok(Patch::new().with_updated(node.clone(), edited))
    }

    /// Patch removing `id` and everything below it.
    pub fn delete_patch(&self, id: &str) -> Result<Patch<FileNode>, FileTreeError> {
        if id == ROOT_ID {
            return Err(FileTreeError::RootImmutable);
        }
        self.existing(id)?;
        let mut patch = Patch::new();
        for sub in self.subtree_ids(id) {
            if let Some(node) = self.replica.get(sub.as_str()) {
                patch = patch.with_removed(node.clone());
            }
        }
        Ok(patch)
    }

    pub fn open_patch(&self, id: &str, open: bool) -> Result<Patch<FileNode>, FileTreeError> {
        let node = self.existing(id)?;
        let mut toggled = node.clone();
        toggled.is_open = open;
        Ok(Patch::new().with_updated(node.clone(), toggled))
    }

    /// Insert `node` as a local edit.
    pub fn create(&mut self, node: FileNode) -> Result<RecordId, FileTreeError> {
        let id = node.id.clone();
        let patch = self.create_patch(node)?;
        self.replica.apply(&patch, Origin::Local);
        Ok(id)
    }

    pub fn rename(&mut self, id: &str, name: &str) -> Result<(), FileTreeError> {
        let patch = self.rename_patch(id, name)?;
        self.replica.apply(&patch, Origin::Local);
        Ok(())
    }

    pub fn update_content(&mut self, id: &str, content: &str) -> Result<(), FileTreeError> {
        let patch = self.content_patch(id, content)?;
        self.replica.apply(&patch, Origin::Local);
        Ok(())
    }

    /// Delete a node and its subtree. Returns the removed ids.
    pub fn delete(&mut self, id: &str) -> Result<Vec<RecordId>, FileTreeError> {
        let patch = self.delete_patch(id)?;
        let removed = patch.removed.keys().cloned().collect();
        self.replica.apply(&patch, Origin::Local);
        Ok(removed)
    }

    pub fn set_open(&mut self, id: &str, open: bool) -> Result<(), FileTreeError> {
        let patch = self.open_patch(id, open)?;
        self.replica.apply(&patch, Origin::Local);
        Ok(())
    }
}
