use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitDirection {
    Horizontal,
    Vertical,
}

/// Binary split tree describing how a session's panes tile the screen.
/// Every interior node has exactly two children; leaves reference panes by
/// id.
///
/// The externally tagged representation is the wire format: a leaf is
/// `{"leaf": "<pane id>"}` and an interior node is
/// `{"split": {"direction": ..., "children": [...]}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    Leaf(String),
    Split {
        direction: SplitDirection,
        children: Vec<Layout>,
    },
}

impl Layout {
    pub fn leaf(pane_id: impl Into<String>) -> Self {
        Layout::Leaf(pane_id.into())
    }

    /// The pane that session-level operations target by default: the
    /// leftmost leaf of the tree.
    pub fn main_pane(&self) -> &str {
        match self {
            Layout::Leaf(pane) => pane,
            Layout::Split { children, .. } => children
                .first()
                .map(Layout::main_pane)
                .unwrap_or_default(),
        }
    }

    pub fn contains(&self, pane_id: &str) -> bool {
        match self {
            Layout::Leaf(pane) => pane == pane_id,
            Layout::Split { children, .. } => children.iter().any(|c| c.contains(pane_id)),
        }
    }

    /// Replaces the leaf holding `existing` with a split node containing the
    /// old leaf and a new leaf for `new_pane`. Returns false when `existing`
    /// is not in the tree.
    pub fn split(&mut self, existing: &str, new_pane: &str, direction: SplitDirection) -> bool {
        match self {
            Layout::Leaf(pane) if pane == existing => {
                let old = Layout::Leaf(pane.clone());
                *self = Layout::Split {
                    direction,
                    children: vec![old, Layout::leaf(new_pane)],
                };
                true
            }
            Layout::Leaf(_) => false,
            Layout::Split { children, .. } => children
                .iter_mut()
                .any(|child| child.split(existing, new_pane, direction)),
        }
    }

    /// Ids of every pane referenced by the tree, left to right.
    pub fn pane_ids(&self) -> Vec<&str> {
        match self {
            Layout::Leaf(pane) => vec![pane.as_str()],
            Layout::Split { children, .. } => {
                children.iter().flat_map(|c| c.pane_ids()).collect()
            }
        }
    }

    /// Removes the leaf holding `pane_id`, collapsing any interior node left
    /// with a single child. Returns `None` when the whole tree is removed.
    pub fn remove(self, pane_id: &str) -> Option<Layout> {
        match self {
            Layout::Leaf(pane) => {
                if pane == pane_id {
                    None
                } else {
                    Some(Layout::Leaf(pane))
                }
            }
            Layout::Split {
                direction,
                children,
            } => {
                let mut remaining: Vec<Layout> = children
                    .into_iter()
                    .filter_map(|child| child.remove(pane_id))
                    .collect();
                match remaining.len() {
                    0 => None,
                    1 => Some(remaining.remove(0)),
                    _ => Some(Layout::Split {
                        direction,
                        children: remaining,
                    }),
                }
            }
        }
    }
}
