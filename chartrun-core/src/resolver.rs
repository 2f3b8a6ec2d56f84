//! Default entry resolution.
//!
//! Works on sets of [`NodeId`]s. Because the arena is in document pre-order,
//! iterating a `BTreeSet<NodeId>` visits ancestors before descendants.

use crate::document::{Document, NodeId, NodeKind};
use std::collections::BTreeSet;

impl Document {
    /// Leaves entered when `token` is targeted with no history recorded.
    ///
    /// A history token resolves to its own default transition, or to its
    /// parent's default leaves.
    pub fn initial_leaves_for(&self, token: &str) -> Vec<NodeId> {
        let Some(node) = self.lookup(token) else {
            return Vec::new();
        };

        let (scope, mut entry) = match self.kind(node) {
            NodeKind::History(_) => {
                let Some(parent) = self.parent(node) else {
                    return Vec::new();
                };
                let mut entry = BTreeSet::from([parent]);
                for target in self.history_default(node) {
                    entry.extend(self.path_down(Some(parent), target));
                }
                (parent, entry)
            }
            _ => (node, BTreeSet::from([node])),
        };

        self.complete_entry(&mut entry, &BTreeSet::new());
        entry
            .into_iter()
            .filter(|&n| self.is_leaf(n) && (n == scope || self.is_descendant(n, scope)))
            .collect()
    }

    /// States entered at start-up: root `initial` tokens, else the first
    /// top-level state, expanded to leaves.
    pub fn initial_entry(&self) -> BTreeSet<NodeId> {
        let mut targets: Vec<NodeId> = Vec::new();
        for token in self.initial() {
            match self.lookup(token) {
                Some(node) => match self.kind(node) {
                    NodeKind::History(_) => {
                        let defaults = self.history_default(node);
                        if defaults.is_empty() {
                            targets.extend(self.parent(node));
                        } else {
                            targets.extend(defaults);
                        }
                    }
                    _ => targets.push(node),
                },
                None => tracing::warn!("initial state '{}' does not exist", token),
            }
        }
        if targets.is_empty() {
            targets.extend(self.top_level().first().copied());
        }

        let mut entry = BTreeSet::new();
        for target in targets {
            entry.extend(self.path_down(None, target));
        }
        self.complete_entry(&mut entry, &BTreeSet::new());
        entry
    }

    /// Adds default descendants until every entered compound state has an
    /// active child and every entered parallel state has all its regions.
    ///
    /// `active` holds states that stay active and need no entry.
    pub fn complete_entry(&self, entry: &mut BTreeSet<NodeId>, active: &BTreeSet<NodeId>) {
        let mut pending: Vec<NodeId> = entry.iter().copied().collect();
        while let Some(node) = pending.pop() {
            let seen: &BTreeSet<NodeId> = entry;
            let covered = |n: NodeId| seen.contains(&n) || active.contains(&n);

            let additions: Vec<NodeId> = match self.kind(node) {
                NodeKind::Parallel => self.state_children(node).filter(|&c| !covered(c)).collect(),
                NodeKind::State if !self.is_leaf(node) => {
                    if self.state_children(node).any(covered) {
                        Vec::new()
                    } else {
                        self.default_targets(node)
                            .into_iter()
                            .flat_map(|t| self.path_down(Some(node), t))
                            .collect()
                    }
                }
                _ => Vec::new(),
            };

            for added in additions {
                if entry.insert(added) {
                    pending.push(added);
                }
            }
        }
    }

    /// Default targets of a compound state, all proper descendants of it.
    pub fn default_targets(&self, node: NodeId) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for token in &self.node(node).initial {
            let Some(target) = self.lookup(token) else {
                tracing::warn!(
                    "initial '{}' of state '{}' does not exist",
                    token,
                    self.id_of(node)
                );
                continue;
            };
            if !self.is_descendant(target, node) {
                continue;
            }
            match self.kind(target) {
                NodeKind::History(_) => targets.extend(
                    self.history_default(target)
                        .into_iter()
                        .filter(|&t| self.is_descendant(t, node)),
                ),
                _ => targets.push(target),
            }
        }

        if targets.is_empty() {
            targets.extend(self.state_children(node).next());
        }
        targets
    }

    /// Targets of a history pseudostate's default transition.
    pub fn history_default(&self, history: NodeId) -> Vec<NodeId> {
        let Some(parent) = self.parent(history) else {
            return Vec::new();
        };
        self.node(history)
            .transitions
            .first()
            .map(|t| {
                t.targets
                    .iter()
                    .filter_map(|id| self.lookup(id))
                    .filter(|&n| {
                        self.is_descendant(n, parent) && !matches!(self.kind(n), NodeKind::History(_))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(doc: &Document, nodes: impl IntoIterator<Item = NodeId>) -> Vec<String> {
        nodes.into_iter().map(|n| doc.id_of(n).to_string()).collect()
    }

    fn chart() -> Document {
        Document::from_value(&json!({
            "state": [
                {
                    "id": "outer",
                    "initial_attribute": "second",
                    "state": [
                        {"id": "first"},
                        {"id": "second", "state": [{"id": "s1"}, {"id": "s2"}]}
                    ],
                    "history": [{"id": "hist", "transition": [{"target": "first"}]}]
                },
                {
                    "id": "par",
                    "parallel": [{
                        "id": "p",
                        "state": [
                            {"id": "left", "initial": [{"transition": {"target": ["l2"]}}],
                             "state": [{"id": "l1"}, {"id": "l2"}]},
                            {"id": "right", "state": [{"id": "r1"}]}
                        ]
                    }]
                },
                {"id": "loop", "initial_attribute": "outer", "state": [{"id": "inner"}]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_root_defaults_to_first_state() {
        let doc = chart();
        assert_eq!(ids(&doc, doc.initial_entry()), vec!["outer", "second", "s1"]);
    }

    #[test]
    fn test_explicit_root_initial() {
        let mut value = json!({"initial": "r1"});
        value["state"] = json!([
            {"id": "a"},
            {"id": "p", "parallel": [{"id": "both", "state": [
                {"id": "x", "state": [{"id": "x1"}]},
                {"id": "y", "state": [{"id": "r1"}]}
            ]}]}
        ]);
        let doc = Document::from_value(&value).unwrap();
        // Sibling regions of the targeted parallel are entered too
        assert_eq!(
            ids(&doc, doc.initial_entry()),
            vec!["p", "both", "x", "x1", "y", "r1"]
        );
    }

    #[test]
    fn test_initial_leaves_for_parallel() {
        let doc = chart();
        assert_eq!(ids(&doc, doc.initial_leaves_for("p")), vec!["l2", "r1"]);
        assert_eq!(ids(&doc, doc.initial_leaves_for("par")), vec!["l2", "r1"]);
        assert_eq!(ids(&doc, doc.initial_leaves_for("s2")), vec!["s2"]);
        assert!(doc.initial_leaves_for("missing").is_empty());
    }

    #[test]
    fn test_history_token_uses_default_transition() {
        let doc = chart();
        assert_eq!(ids(&doc, doc.initial_leaves_for("hist")), vec!["first"]);
    }

    #[test]
    fn test_initial_outside_subtree_is_ignored() {
        let doc = chart();
        // "loop" names an unrelated state as its initial; first child is used
        assert_eq!(ids(&doc, doc.initial_leaves_for("loop")), vec!["inner"]);
    }

    #[test]
    fn test_complete_entry_respects_active_states() {
        let doc = chart();
        let p = doc.lookup("p").unwrap();
        let left = doc.lookup("left").unwrap();
        let l1 = doc.lookup("l1").unwrap();
        let right = doc.lookup("right").unwrap();
        let r1 = doc.lookup("r1").unwrap();

        // Re-entering l1 while the right region stays active
        let mut entry = BTreeSet::from([l1]);
        doc.complete_entry(&mut entry, &BTreeSet::from([p, left, right, r1]));
        assert_eq!(ids(&doc, entry), vec!["l1"]);
    }
}
