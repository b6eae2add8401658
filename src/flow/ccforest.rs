//! Collision forest over labels.
//!
//! The scan passes hand out provisional labels and record collisions as
//! edges; resolving a label walks to the smallest label of its connected
//! component. Smallest-wins keeps the reserved labels (boundary before
//! everything) stable as roots and rules out parent cycles.

use super::types::Label;

/// Union-find keyed by label, growing on demand. The representative of a
/// set is always its smallest member.
#[derive(Debug, Default)]
pub struct CollisionForest {
    /// `parent[l] == l` for a root; labels never seen are implicit roots.
    parent: Vec<Label>,
}

impl CollisionForest {
    /// An empty forest; every label is its own component until inserted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure(&mut self, label: Label) {
        let need = label as usize + 1;
        if self.parent.len() < need {
            let from = self.parent.len() as Label;
            self.parent.extend(from..need as Label);
        }
    }

    /// Records that two provisional labels name the same component.
    pub fn insert(&mut self, a: Label, b: Label) {
        debug_assert!(a >= 0 && b >= 0);
        let (ra, rb) = (self.find_root(a), self.find_root(b));
        if ra == rb {
            return;
        }
        // Smaller label wins as root.
        let (small, large) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[large as usize] = small;
    }

    /// Representative (smallest label) of the component, with path
    /// compression.
    pub fn find_root(&mut self, label: Label) -> Label {
        debug_assert!(label >= 0);
        self.ensure(label);
        let mut root = label;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cursor = label;
        while self.parent[cursor as usize] != root {
            let next = self.parent[cursor as usize];
            self.parent[cursor as usize] = root;
            cursor = next;
        }
        root
    }

    /// Whether the label currently roots its own component.
    pub fn is_root(&mut self, label: Label) -> bool {
        self.find_root(label) == label
    }
}
