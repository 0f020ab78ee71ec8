//! Panel layout tree.
//!
//! A session's panels are arranged in a binary tree of splits. Leaves hold
//! panel ids. The tree is what gets persisted and handed back to a client
//! reconstructing its UI after a reload.

use serde::{Deserialize, Serialize};

/// Smallest share a split may give either side.
pub const MIN_RATIO: f32 = 0.05;

/// Largest share a split may give its first child.
pub const MAX_RATIO: f32 = 0.95;

/// Direction a split divides its area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Children side by side (divider is vertical).
    Horizontal,
    /// Children stacked (divider is horizontal).
    Vertical,
}

/// Child selector used to address a node by its path from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    First,
    Second,
}

/// A node in the layout tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutNode {
    Panel {
        panel_id: String,
    },
    Split {
        orientation: Orientation,
        /// Share of the area given to `first`, in `[MIN_RATIO, MAX_RATIO]`.
        ratio: f32,
        first: Box<LayoutNode>,
        second: Box<LayoutNode>,
    },
}

impl LayoutNode {
    fn leaf(panel_id: &str) -> Self {
        LayoutNode::Panel {
            panel_id: panel_id.to_string(),
        }
    }

    fn collect_panels(&self, out: &mut Vec<String>) {
        match self {
            LayoutNode::Panel { panel_id } => out.push(panel_id.clone()),
            LayoutNode::Split { first, second, .. } => {
                first.collect_panels(out);
                second.collect_panels(out);
            }
        }
    }

    fn path_of(&self, target: &str, path: &mut Vec<Branch>) -> bool {
        match self {
            LayoutNode::Panel { panel_id } => panel_id == target,
            LayoutNode::Split { first, second, .. } => {
                path.push(Branch::First);
                if first.path_of(target, path) {
                    return true;
                }
                path.pop();
                path.push(Branch::Second);
                if second.path_of(target, path) {
                    return true;
                }
                path.pop();
                false
            }
        }
    }

    fn node_at_mut(&mut self, path: &[Branch]) -> Option<&mut LayoutNode> {
        let Some((branch, rest)) = path.split_first() else {
            return Some(self);
        };
        match self {
            LayoutNode::Panel { .. } => None,
            LayoutNode::Split { first, second, .. } => match branch {
                Branch::First => first.node_at_mut(rest),
                Branch::Second => second.node_at_mut(rest),
            },
        }
    }

    /// Remove `target` from this subtree. Returns the replacement node, or
    /// `None` if the whole subtree disappears.
    fn without(self, target: &str, removed: &mut bool) -> Option<LayoutNode> {
        match self {
            LayoutNode::Panel { ref panel_id } if panel_id == target => {
                *removed = true;
                None
            }
            LayoutNode::Panel { .. } => Some(self),
            LayoutNode::Split {
                orientation,
                ratio,
                first,
                second,
            } => {
                let first = first.without(target, removed);
                let second = second.without(target, removed);
                match (first, second) {
                    (Some(first), Some(second)) => Some(LayoutNode::Split {
                        orientation,
                        ratio,
                        first: Box::new(first),
                        second: Box::new(second),
                    }),
                    // A split with one child left collapses into that child.
                    (Some(only), None) | (None, Some(only)) => Some(only),
                    (None, None) => None,
                }
            }
        }
    }
}

/// Where a new panel goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSpec {
    /// Existing panel whose area is divided.
    pub target_panel: String,
    pub orientation: Orientation,
    /// Share kept by the existing panel. Defaults to an even split.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f32>,
}

/// Errors from structural layout changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    PanelNotInLayout(String),
    DuplicatePanel(String),
    InvalidPath,
    InvalidRatio,
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutError::PanelNotInLayout(id) => write!(f, "panel '{}' is not in this layout", id),
            LayoutError::DuplicatePanel(id) => write!(f, "panel '{}' is already in this layout", id),
            LayoutError::InvalidPath => write!(f, "path does not address a split node"),
            LayoutError::InvalidRatio => write!(f, "ratio must be a finite number"),
        }
    }
}

impl std::error::Error for LayoutError {}

/// The whole arrangement for one session. Empty until the first panel opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutTree {
    #[serde(default)]
    pub root: Option<LayoutNode>,
}

fn clamp_ratio(ratio: f32) -> Result<f32, LayoutError> {
    if !ratio.is_finite() {
        return Err(LayoutError::InvalidRatio);
    }
    Ok(ratio.clamp(MIN_RATIO, MAX_RATIO))
}

impl LayoutTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// All panel ids, left to right.
    pub fn panel_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            root.collect_panels(&mut out);
        }
        out
    }

    pub fn contains(&self, panel_id: &str) -> bool {
        self.path_of(panel_id).is_some()
    }

    /// Path from the root to a panel leaf.
    pub fn path_of(&self, panel_id: &str) -> Option<Vec<Branch>> {
        let root = self.root.as_ref()?;
        let mut path = Vec::new();
        root.path_of(panel_id, &mut path).then_some(path)
    }

    /// Insert a new panel.
    ///
    /// Into an empty tree the panel becomes the root. Without a split spec,
    /// the last panel is split horizontally.
    pub fn insert_panel(
        &mut self,
        panel_id: &str,
        split: Option<&SplitSpec>,
    ) -> Result<(), LayoutError> {
        if self.contains(panel_id) {
            return Err(LayoutError::DuplicatePanel(panel_id.to_string()));
        }

        if self.root.is_none() {
            self.root = Some(LayoutNode::leaf(panel_id));
            return Ok(());
        }
        let root = self.root.as_mut().ok_or(LayoutError::InvalidPath)?;

        let (target, orientation, ratio) = match split {
            Some(spec) => (
                spec.target_panel.clone(),
                spec.orientation,
                spec.ratio.unwrap_or(0.5),
            ),
            None => {
                let mut ids = Vec::new();
                root.collect_panels(&mut ids);
                let last = ids.pop().ok_or(LayoutError::InvalidPath)?;
                (last, Orientation::Horizontal, 0.5)
            }
        };
        let ratio = clamp_ratio(ratio)?;

        let mut path = Vec::new();
        if !root.path_of(&target, &mut path) {
            return Err(LayoutError::PanelNotInLayout(target));
        }
        let node = root.node_at_mut(&path).ok_or(LayoutError::InvalidPath)?;
        let existing = std::mem::replace(node, LayoutNode::leaf(panel_id));
        *node = LayoutNode::Split {
            orientation,
            ratio,
            first: Box::new(existing),
            second: Box::new(LayoutNode::leaf(panel_id)),
        };
        Ok(())
    }

    /// Remove a panel, collapsing its parent split. Returns whether it was
    /// present.
    pub fn remove_panel(&mut self, panel_id: &str) -> bool {
        let Some(root) = self.root.take() else {
            return false;
        };
        let mut removed = false;
        self.root = root.without(panel_id, &mut removed);
        removed
    }

    /// Change the ratio of the split node at `path`.
    pub fn set_ratio(&mut self, path: &[Branch], ratio: f32) -> Result<(), LayoutError> {
        let ratio = clamp_ratio(ratio)?;
        let node = self
            .root
            .as_mut()
            .and_then(|root| root.node_at_mut(path))
            .ok_or(LayoutError::InvalidPath)?;
        match node {
            LayoutNode::Split { ratio: r, .. } => {
                *r = ratio;
                Ok(())
            }
            LayoutNode::Panel { .. } => Err(LayoutError::InvalidPath),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(target: &str, orientation: Orientation) -> SplitSpec {
        SplitSpec {
            target_panel: target.to_string(),
            orientation,
            ratio: None,
        }
    }

    #[test]
    fn test_first_panel_becomes_root() {
        let mut tree = LayoutTree::new();
        tree.insert_panel("p1", None).unwrap();
        assert_eq!(tree.panel_ids(), vec!["p1"]);
        assert_eq!(tree.path_of("p1"), Some(vec![]));
    }

    #[test]
    fn test_split_target_panel() {
        let mut tree = LayoutTree::new();
        tree.insert_panel("p1", None).unwrap();
        tree.insert_panel("p2", Some(&spec("p1", Orientation::Vertical)))
            .unwrap();
        tree.insert_panel("p3", Some(&spec("p1", Orientation::Horizontal)))
            .unwrap();

        assert_eq!(tree.panel_ids(), vec!["p1", "p3", "p2"]);
        assert_eq!(tree.path_of("p3"), Some(vec![Branch::First, Branch::Second]));
        assert_eq!(tree.path_of("p2"), Some(vec![Branch::Second]));
    }

    #[test]
    fn test_default_split_uses_last_panel() {
        let mut tree = LayoutTree::new();
        tree.insert_panel("a", None).unwrap();
        tree.insert_panel("b", None).unwrap();
        tree.insert_panel("c", None).unwrap();

        assert_eq!(tree.panel_ids(), vec!["a", "b", "c"]);
        assert_eq!(tree.path_of("c"), Some(vec![Branch::Second, Branch::Second]));
    }

    #[test]
    fn test_split_unknown_target_fails() {
        let mut tree = LayoutTree::new();
        tree.insert_panel("a", None).unwrap();
        let err = tree
            .insert_panel("b", Some(&spec("missing", Orientation::Vertical)))
            .unwrap_err();
        assert_eq!(err, LayoutError::PanelNotInLayout("missing".to_string()));
        assert_eq!(tree.panel_ids(), vec!["a"]);
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let mut tree = LayoutTree::new();
        tree.insert_panel("a", None).unwrap();
        assert_eq!(
            tree.insert_panel("a", None),
            Err(LayoutError::DuplicatePanel("a".to_string()))
        );
    }

    #[test]
    fn test_remove_collapses_parent() {
        let mut tree = LayoutTree::new();
        tree.insert_panel("a", None).unwrap();
        tree.insert_panel("b", Some(&spec("a", Orientation::Vertical)))
            .unwrap();
        tree.insert_panel("c", Some(&spec("b", Orientation::Horizontal)))
            .unwrap();

        assert!(tree.remove_panel("b"));
        assert_eq!(tree.panel_ids(), vec!["a", "c"]);
        assert_eq!(tree.path_of("c"), Some(vec![Branch::Second]));

        assert!(!tree.remove_panel("b"));
        assert!(tree.remove_panel("a"));
        assert!(tree.remove_panel("c"));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_set_ratio_clamps() {
        let mut tree = LayoutTree::new();
        tree.insert_panel("a", None).unwrap();
        tree.insert_panel("b", None).unwrap();

        tree.set_ratio(&[], 0.99).unwrap();
        match &tree.root {
            Some(LayoutNode::Split { ratio, .. }) => assert_eq!(*ratio, MAX_RATIO),
            other => panic!("expected split, got {:?}", other),
        }

        assert_eq!(tree.set_ratio(&[Branch::First], 0.3), Err(LayoutError::InvalidPath));
        assert_eq!(tree.set_ratio(&[], f32::NAN), Err(LayoutError::InvalidRatio));
    }

    #[test]
    fn test_json_shape() {
        let mut tree = LayoutTree::new();
        tree.insert_panel("a", None).unwrap();
        tree.insert_panel("b", Some(&spec("a", Orientation::Vertical)))
            .unwrap();

        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["root"]["kind"], "split");
        assert_eq!(json["root"]["orientation"], "vertical");
        assert_eq!(json["root"]["first"]["panel_id"], "a");
        assert_eq!(json["root"]["second"]["kind"], "panel");

        let back: LayoutTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_empty_tree_deserializes_without_root() {
        let tree: LayoutTree = serde_json::from_str("{}").unwrap();
        assert!(tree.is_empty());
    }
}
