//! Document model and patch engine for tandem workspaces.
//!
//! A shared document is a flat map of addressable records. Peers exchange
//! keyed [`Patch`]es; each client holds a [`Replica`] that applies patches
//! tagged with their [`Origin`], so local observers never see remote edits.

pub mod drawing;
pub mod file_tree;
pub mod patch;
pub mod record;
pub mod replica;

use serde::{Deserialize, Serialize};

pub use drawing::{DrawingRecord, DrawingScene, RecordKind};
pub use file_tree::{FileNode, FileTree, FileTreeError, NodeKind, ROOT_ID};
pub use patch::{Patch, PatchAnomaly, PatchError, RawPatch, Section};
pub use record::{Record, RecordId};
pub use replica::{ApplyReport, ListenFilter, ListenerId, Origin, Replica};

/// The two kinds of shared document in a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentKind {
    DrawingScene,
    FileTree,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentKind::DrawingScene => f.write_str("drawing-scene"),
            DocumentKind::FileTree => f.write_str("file-tree"),
        }
    }
}
