//! Path-tree state machine: a rooted tree keyed by slash-delimited paths,
//! where each node holds a string value and version counters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use sha2::{Digest, Sha256};

use crate::statemach::{Command, CommandResult, ReplyValue, StateMachine};
use crate::utils::CanopyError;

/// Per-node stats: value version, children-set version, children count.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StatNode {
    /// Incremented on every value mutation; 1 upon creation.
    pub version: u64,

    /// Incremented whenever the node's child set changes.
    pub cversion: u64,

    /// Current number of children.
    pub num_children: u64,
}

/// Node value + stats, as returned to clients.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct DataNode {
    pub value: String,
    pub stats: StatNode,
}

/// A node of the tree. Children are kept in a `BTreeMap` so that iteration
/// order (hence child listings and digests) is deterministic.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
struct TreeNode {
    value: String,
    version: u64,
    cversion: u64,
    children: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    fn empty() -> Self {
        TreeNode {
            value: String::new(),
            version: 0,
            cversion: 0,
            children: BTreeMap::new(),
        }
    }

    fn stats(&self) -> StatNode {
        StatNode {
            version: self.version,
            cversion: self.cversion,
            num_children: self.children.len() as u64,
        }
    }

    fn data(&self) -> DataNode {
        DataNode {
            value: self.value.clone(),
            stats: self.stats(),
        }
    }
}

/// The path-tree database state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TreeDb {
    root: TreeNode,
}

impl TreeDb {
    /// Creates an empty tree.
    pub fn new() -> Self {
        TreeDb {
            root: TreeNode::empty(),
        }
    }

    /// Splits a slash-delimited path into its non-empty components.
    fn path_parts(path: &str) -> Vec<&str> {
        path.split('/').filter(|p| !p.is_empty()).collect()
    }

    /// Walks down to the node at path.
    fn node_at(&self, path: &str) -> Option<&TreeNode> {
        let mut node = &self.root;
        for part in Self::path_parts(path) {
            node = node.children.get(part)?;
        }
        Some(node)
    }

    /// Creates the node at path with given value, materializing missing
    /// intermediate nodes along the way. Fails if the path already exists
    /// or names the root.
    fn create(&mut self, path: &str, value: &str) -> CommandResult {
        let parts = Self::path_parts(path);
        if parts.is_empty() {
            return CommandResult::err("node already exists");
        }

        let mut node = &mut self.root;
        for part in &parts[..parts.len() - 1] {
            if !node.children.contains_key(*part) {
                node.cversion += 1;
                node.children.insert(part.to_string(), TreeNode::empty());
            }
            node = node.children.get_mut(*part).unwrap();
        }

        let leaf = parts[parts.len() - 1];
        if node.children.contains_key(leaf) {
            return CommandResult::err("node already exists");
        }
        node.cversion += 1;
        let mut new_node = TreeNode::empty();
        new_node.value = value.to_string();
        new_node.version = 1;
        node.children.insert(leaf.to_string(), new_node.clone());
        CommandResult::ok(ReplyValue::Node(new_node.data()))
    }

    /// Overwrites the value of the node at path. Fails if not present.
    fn set(&mut self, path: &str, value: &str) -> CommandResult {
        let parts = Self::path_parts(path);
        let mut node = &mut self.root;
        for part in &parts {
            match node.children.get_mut(*part) {
                Some(child) => node = child,
                None => return CommandResult::err("node does not exist"),
            }
        }
        node.value = value.to_string();
        node.version += 1;
        CommandResult::ok(ReplyValue::Node(node.data()))
    }

    /// Removes the node at path (and its whole subtree). Fails if not
    /// present or if path names the root.
    fn delete(&mut self, path: &str) -> CommandResult {
        let parts = Self::path_parts(path);
        if parts.is_empty() {
            return CommandResult::err("node does not exist");
        }

        let mut node = &mut self.root;
        for part in &parts[..parts.len() - 1] {
            match node.children.get_mut(*part) {
                Some(child) => node = child,
                None => return CommandResult::err("node does not exist"),
            }
        }

        let leaf = parts[parts.len() - 1];
        if node.children.remove(leaf).is_none() {
            return CommandResult::err("node does not exist");
        }
        node.cversion += 1;
        CommandResult::ok(ReplyValue::None)
    }

    /// Hex SHA-256 digest over the canonical encoding of the whole tree.
    fn digest(&self) -> Result<String, CanopyError> {
        let bytes = rmp_serde::encode::to_vec(&self.root)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

impl Default for TreeDb {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TreeDb {
    fn execute(&mut self, cmd: &Command) -> CommandResult {
        match cmd {
            Command::Create { path, value } => self.create(path, value),
            Command::Set { path, value } => self.set(path, value),
            Command::Get { path } => match self.node_at(path) {
                Some(node) => CommandResult::ok(ReplyValue::Node(node.data())),
                None => CommandResult::err("node does not exist"),
            },
            Command::Delete { path } => self.delete(path),
            Command::Children { path } => match self.node_at(path) {
                Some(node) => CommandResult::ok(ReplyValue::Children(
                    node.children.keys().cloned().collect(),
                )),
                None => CommandResult::err("node does not exist"),
            },
            Command::Stat { path } => match self.node_at(path) {
                Some(node) => CommandResult::ok(ReplyValue::Stat(node.stats())),
                None => CommandResult::err("node does not exist"),
            },
            Command::TreeDigest => match self.digest() {
                Ok(digest) => CommandResult::ok(ReplyValue::Digest(digest)),
                Err(e) => CommandResult::err(e),
            },
            _ => CommandResult::err("unknown command"),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, CanopyError> {
        Ok(rmp_serde::encode::to_vec(self)?)
    }
}
