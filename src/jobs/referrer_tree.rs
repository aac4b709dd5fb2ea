use crate::db::ForaStore;
use crate::error::{AppError, Result};
use crate::models::TreeNode;

/// Walks a complete binary referral tree of a fixed height in pre-order,
/// yielding the parent of each node still missing
///
/// Nodes are kept in insertion order, which for a tree grown by this walker
/// is its pre-order. Growth can therefore resume from whatever part of the
/// tree an earlier run managed to create.
#[derive(Debug, Clone)]
pub struct ReferrerTreeWalker {
    height: u32,
    nodes: Vec<TreeNode>,
    index: usize,
}

impl ReferrerTreeWalker {
    /// Loads the existing part of the tree rooted at `root_id`
    pub async fn load(store: &dyn ForaStore, root_id: &str, height: i32) -> Result<Self> {
        let height = checked_height(height)?;
        let nodes = store.referrer_tree(root_id, height as i32).await?;
        Self::new(height, nodes)
    }

    pub fn new(height: u32, nodes: Vec<TreeNode>) -> Result<Self> {
        checked_height(height as i32)?;
        if nodes.is_empty() {
            return Err(AppError::Integrity(
                "couldn't find the root account of the referral tree".to_string(),
            ));
        }

        let index = nodes.len() - 1;
        Ok(Self {
            height,
            nodes,
            index,
        })
    }

    /// Number of nodes of the complete tree
    pub fn capacity(&self) -> usize {
        (1 << (self.height + 1)) - 1
    }

    /// No node is missing
    pub fn is_empty(&self) -> bool {
        self.index >= self.capacity() - 1
    }

    /// Parent of the next node to create
    pub fn peek(&self) -> &TreeNode {
        &self.nodes[self.index - bubble_step(self.height, self.index)]
    }

    pub fn push(&mut self, node: TreeNode) {
        self.nodes.push(node);
        self.index += 1;
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }
}

fn checked_height(height: i32) -> Result<u32> {
    match u32::try_from(height) {
        // 2^(H+1) must fit a usize
        Ok(h) if (1..usize::BITS - 1).contains(&h) => Ok(h),
        _ => Err(AppError::Config(format!(
            "referral tree height must be at least 1, got {height}"
        ))),
    }
}

/// Distance from pre-order position `index + 1` back to its parent, for a
/// complete binary tree of height `depth`
fn bubble_step(depth: u32, index: usize) -> usize {
    if depth == 0 {
        return index;
    }
    let subtree = (1usize << depth) - 1;
    match index % subtree {
        0 => index,
        rest => bubble_step(depth - 1, rest - 1),
    }
}
