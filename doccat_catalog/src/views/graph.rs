//! Dependency graph between views and the namespaces they read from.
use super::{Collation, ViewDefinition, ViewLimits};
use crate::{CatalogError, Result};
use doccat_id::NamespaceString;
use hashbrown::HashMap;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
struct Node {
    /// Nodes can exist only because a view references them, in which case they are not views
    is_view: bool,
    pipeline_size: usize,
    collation: Option<Collation>,
    /// Namespaces this view reads from
    children: BTreeSet<NamespaceString>,
    /// Views reading from this namespace
    parents: BTreeSet<NamespaceString>,
}

#[derive(Debug, Clone, Default)]
pub struct ViewGraph {
    nodes: HashMap<NamespaceString, Node>,
}

impl ViewGraph {
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains_view(&self, name: &NamespaceString) -> bool {
        self.nodes.get(name).is_some_and(|n| n.is_view)
    }

    pub fn insert_without_validating(
        &mut self,
        view: &ViewDefinition,
        refs: &BTreeSet<NamespaceString>,
        pipeline_size: usize,
    ) {
        let name = view.name();
        let node = self.nodes.entry(name.clone()).or_default();
        node.is_view = true;
        node.pipeline_size = pipeline_size;
        node.collation = view.collation().cloned();
        node.children = refs.clone();
        for r in refs {
            self.nodes
                .entry(r.clone())
                .or_default()
                .parents
                .insert(name.clone());
        }
    }

    /// Insert `view` and check that the graph stays acyclic and within `limits`. On error the
    /// view is removed again and the graph is left as it was before the call.
    pub fn insert_and_validate(
        &mut self,
        view: &ViewDefinition,
        refs: &BTreeSet<NamespaceString>,
        pipeline_size: usize,
        limits: ViewLimits,
    ) -> Result<()> {
        self.insert_without_validating(view, refs, pipeline_size);
        let res = self.validate(view.name(), limits);
        if res.is_err() {
            self.remove(view.name());
        }
        res
    }

    pub fn remove(&mut self, name: &NamespaceString) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        let children = std::mem::take(&mut node.children);
        node.is_view = false;
        node.pipeline_size = 0;
        node.collation = None;
        if node.parents.is_empty() {
            self.nodes.remove(name);
        }

        for child in children {
            let Some(child_node) = self.nodes.get_mut(&child) else {
                continue;
            };
            child_node.parents.remove(name);
            if !child_node.is_view && child_node.parents.is_empty() {
                self.nodes.remove(&child);
            }
        }
    }

    fn validate(&self, name: &NamespaceString, limits: ViewLimits) -> Result<()> {
        let Some(node) = self.nodes.get(name) else {
            return Ok(());
        };

        for parent in &node.parents {
            let parent_collation = self.nodes.get(parent).and_then(|p| p.collation.as_ref());
            if parent_collation != node.collation.as_ref() {
                return Err(CatalogError::OptionNotSupportedOnView(format!(
                    "View {parent} has conflicting collation with view {name}"
                )));
            }
        }

        let mut path = vec![];
        let (down_depth, down_size) = self.descend(name, name, &mut path, limits)?;
        path.clear();
        let (up_depth, up_size) = self.ascend(name, name, &mut path, limits)?;

        let depth = down_depth + up_depth - 1;
        if depth > limits.max_depth {
            return Err(CatalogError::ViewDepthLimitExceeded {
                view: name.clone(),
                max_depth: limits.max_depth,
            });
        }
        let size = down_size + up_size - node.pipeline_size;
        if size > limits.max_pipeline_bytes {
            return Err(CatalogError::ViewPipelineMaxSizeExceeded {
                view: name.clone(),
                size,
                max_bytes: limits.max_pipeline_bytes,
            });
        }
        Ok(())
    }

    /// Longest chain of views (and its pipeline size) reachable from `current` through the
    /// namespaces it reads from, counting `current` itself.
    fn descend(
        &self,
        root: &NamespaceString,
        current: &NamespaceString,
        path: &mut Vec<NamespaceString>,
        limits: ViewLimits,
    ) -> Result<(usize, usize)> {
        let node = match self.nodes.get(current) {
            Some(node) if node.is_view => node,
            _ => return Ok((0, 0)),
        };
        path.push(current.clone());
        if path.len() > limits.max_depth {
            return Err(CatalogError::ViewDepthLimitExceeded {
                view: root.clone(),
                max_depth: limits.max_depth,
            });
        }

        let mut depth = 0;
        let mut size = 0;
        for child in &node.children {
            if path.contains(child) {
                let mut cycle: Vec<String> = path.iter().map(ToString::to_string).collect();
                cycle.push(child.to_string());
                return Err(CatalogError::GraphContainsCycle(cycle.join(" => ")));
            }
            let (d, s) = self.descend(root, child, path, limits)?;
            depth = depth.max(d);
            size = size.max(s);
        }
        path.pop();
        Ok((depth + 1, size + node.pipeline_size))
    }

    /// Same as [`Self::descend`] but walking towards the views that read from `current`
    fn ascend(
        &self,
        root: &NamespaceString,
        current: &NamespaceString,
        path: &mut Vec<NamespaceString>,
        limits: ViewLimits,
    ) -> Result<(usize, usize)> {
        let Some(node) = self.nodes.get(current) else {
            return Ok((0, 0));
        };
        path.push(current.clone());
        if path.len() > limits.max_depth {
            return Err(CatalogError::ViewDepthLimitExceeded {
                view: root.clone(),
                max_depth: limits.max_depth,
            });
        }

        let mut depth = 0;
        let mut size = 0;
        for parent in &node.parents {
            if path.contains(parent) {
                let mut cycle: Vec<String> = path.iter().rev().map(ToString::to_string).collect();
                cycle.insert(0, parent.to_string());
                return Err(CatalogError::GraphContainsCycle(cycle.join(" => ")));
            }
            let (d, s) = self.ascend(root, parent, path, limits)?;
            depth = depth.max(d);
            size = size.max(s);
        }
        path.pop();
        Ok((depth + 1, size + node.pipeline_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doccat_id::DatabaseName;

    fn ns(coll: &str) -> NamespaceString {
        NamespaceString::new(DatabaseName::new("db"), coll)
    }

    fn view(name: &str, on: &str) -> ViewDefinition {
        ViewDefinition::new(ns(name), ns(on), vec![], None)
    }

    fn refs(on: &[&str]) -> BTreeSet<NamespaceString> {
        on.iter().map(|c| ns(c)).collect()
    }

    const LIMITS: ViewLimits = ViewLimits {
        max_depth: 3,
        max_pipeline_bytes: 100,
    };

    #[test]
    fn cycle_is_rejected_and_rolled_back() {
        let mut graph = ViewGraph::default();
        graph
            .insert_and_validate(&view("a", "b"), &refs(&["b"]), 1, LIMITS)
            .unwrap();
        graph
            .insert_and_validate(&view("b", "c"), &refs(&["c"]), 1, LIMITS)
            .unwrap();
        let err = graph
            .insert_and_validate(&view("c", "a"), &refs(&["a"]), 1, LIMITS)
            .unwrap_err();
        assert!(matches!(err, CatalogError::GraphContainsCycle(_)), "{err}");
        assert!(!graph.contains_view(&ns("c")));
        assert!(graph.contains_view(&ns("b")));
    }

    #[test]
    fn depth_counts_views_on_both_sides() {
        let mut graph = ViewGraph::default();
        graph
            .insert_and_validate(&view("a", "b"), &refs(&["b"]), 1, LIMITS)
            .unwrap();
        graph
            .insert_and_validate(&view("c", "coll"), &refs(&["coll"]), 1, LIMITS)
            .unwrap();
        // a -> b -> c -> coll is three views deep
        graph
            .insert_and_validate(&view("b", "c"), &refs(&["c"]), 1, LIMITS)
            .unwrap();
        let err = graph
            .insert_and_validate(&view("d", "a"), &refs(&["a"]), 1, LIMITS)
            .unwrap_err();
        assert!(
            matches!(err, CatalogError::ViewDepthLimitExceeded { .. }),
            "{err}"
        );
    }

    #[test]
    fn pipeline_size_is_summed_along_the_chain() {
        let mut graph = ViewGraph::default();
        graph
            .insert_and_validate(&view("a", "coll"), &refs(&["coll"]), 60, LIMITS)
            .unwrap();
        let err = graph
            .insert_and_validate(&view("b", "a"), &refs(&["a"]), 50, LIMITS)
            .unwrap_err();
        assert!(
            matches!(
                err,
                CatalogError::ViewPipelineMaxSizeExceeded { size: 110, .. }
            ),
            "{err}"
        );
    }

    #[test]
    fn remove_drops_orphaned_collections() {
        let mut graph = ViewGraph::default();
        graph
            .insert_and_validate(&view("a", "coll"), &refs(&["coll"]), 1, LIMITS)
            .unwrap();
        assert_eq!(graph.len(), 2);
        graph.remove(&ns("a"));
        assert!(graph.is_empty());
    }
}
