use std::collections::HashMap;

use crate::error::{PipelineError, Result};

pub type NodeId = usize;

/// The operation a node performs. Matched exhaustively everywhere a node is
/// interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// External input bound by the scheduler (micro-batch slice or label feed).
    Placeholder,
    /// Dotted-path parameter access against the owning registry.
    GetAttr,
    /// Free-function invocation; transparent for gradient attribution.
    CallFunction,
    /// Tensor method invocation; caches state for the stage backward.
    CallMethod,
    /// Submodule invocation; the unit of partition granularity.
    CallModule,
    /// Marks the graph's final producible value; pass-through.
    Output,
}

/// An argument slot of a node: either a reference to a producing node by
/// name, or an inline literal.
#[derive(Debug, Clone)]
pub enum Arg {
    Node(String),
    Int(i64),
    Ints(Vec<i64>),
}

/// One step of computation in the IR.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op: OpKind,
    /// Function name, method name, or dotted submodule/parameter path,
    /// depending on `op`.
    pub target: String,
    pub args: Vec<Arg>,
    pub kwargs: Vec<(String, Arg)>,
}

impl Node {
    /// Names of the nodes this node reads from, in argument order, first
    /// occurrence only (positional args before keyword args).
    pub fn input_nodes(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        let refs = self
            .args
            .iter()
            .chain(self.kwargs.iter().map(|(_, a)| a));
        for arg in refs {
            if let Arg::Node(name) = arg {
                if !seen.contains(&name.as_str()) {
                    seen.push(name.as_str());
                }
            }
        }
        seen
    }
}

/// The full node sequence of a compiled model, stored as an arena with
/// explicit next/prev indices. Immutable once built; all components read it,
/// none mutate it.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<NodeId> {
        self.lookup(name)
            .ok_or_else(|| PipelineError::Reference(format!("no node named '{name}' in the graph")))
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        if id + 1 < self.nodes.len() {
            Some(id + 1)
        } else {
            None
        }
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        if id > 0 {
            Some(id - 1)
        } else {
            None
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// First placeholder node, if any. The first stage starts here.
    pub fn first_placeholder(&self) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.op == OpKind::Placeholder)
    }

    pub fn last(&self) -> Option<NodeId> {
        self.nodes.len().checked_sub(1)
    }
}

/// Builds a [`Graph`], enforcing single static assignment: names are unique
/// and argument references never point forward in the sequence.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> Result<()> {
        if self.index.contains_key(&node.name) {
            return Err(PipelineError::Reference(format!(
                "duplicate node name '{}'",
                node.name
            )));
        }
        for input in node.input_nodes() {
            if !self.index.contains_key(input) {
                return Err(PipelineError::Reference(format!(
                    "node '{}' references '{input}', which is not defined earlier in the sequence",
                    node.name
                )));
            }
        }
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn placeholder(&mut self, name: &str) -> Result<&mut Self> {
        self.push(Node {
            name: name.to_string(),
            op: OpKind::Placeholder,
            target: name.to_string(),
            args: vec![],
            kwargs: vec![],
        })?;
        Ok(self)
    }

    pub fn get_attr(&mut self, name: &str, path: &str) -> Result<&mut Self> {
        self.push(Node {
            name: name.to_string(),
            op: OpKind::GetAttr,
            target: path.to_string(),
            args: vec![],
            kwargs: vec![],
        })?;
        Ok(self)
    }

    pub fn call_function(&mut self, name: &str, target: &str, args: Vec<Arg>) -> Result<&mut Self> {
        self.push(Node {
            name: name.to_string(),
            op: OpKind::CallFunction,
            target: target.to_string(),
            args,
            kwargs: vec![],
        })?;
        Ok(self)
    }

    pub fn call_method(&mut self, name: &str, target: &str, args: Vec<Arg>) -> Result<&mut Self> {
        self.push(Node {
            name: name.to_string(),
            op: OpKind::CallMethod,
            target: target.to_string(),
            args,
            kwargs: vec![],
        })?;
        Ok(self)
    }

    pub fn call_module(&mut self, name: &str, target: &str, args: Vec<Arg>) -> Result<&mut Self> {
        self.push(Node {
            name: name.to_string(),
            op: OpKind::CallModule,
            target: target.to_string(),
            args,
            kwargs: vec![],
        })?;
        Ok(self)
    }

    pub fn output(&mut self, name: &str, of: &str) -> Result<&mut Self> {
        self.push(Node {
            name: name.to_string(),
            op: OpKind::Output,
            target: "output".to_string(),
            args: vec![Arg::Node(of.to_string())],
            kwargs: vec![],
        })?;
        Ok(self)
    }

    pub fn finish(self) -> Result<Graph> {
        if self.nodes.is_empty() {
            return Err(PipelineError::Configuration("graph has no nodes".into()));
        }
        Ok(Graph {
            nodes: self.nodes,
            index: self.index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_enforces_unique_names() {
        let mut b = GraphBuilder::new();
        b.placeholder("x").unwrap();
        assert!(b.placeholder("x").is_err());
    }

    #[test]
    fn builder_rejects_forward_references() {
        let mut b = GraphBuilder::new();
        b.placeholder("x").unwrap();
        let err = b.call_module("l0", "layers.0", vec![Arg::Node("later".into())]);
        assert!(matches!(err, Err(PipelineError::Reference(_))));
    }

    #[test]
    fn traversal_links_are_consistent() {
        let mut b = GraphBuilder::new();
        b.placeholder("x").unwrap();
        b.call_module("l0", "layers.0", vec![Arg::Node("x".into())])
            .unwrap();
        b.output("out", "l0").unwrap();
        let g = b.finish().unwrap();

        assert_eq!(g.len(), 3);
        assert_eq!(g.next(0), Some(1));
        assert_eq!(g.prev(2), Some(1));
        assert_eq!(g.next(2), None);
        assert_eq!(g.prev(0), None);
        assert_eq!(g.lookup("l0"), Some(1));
        assert_eq!(g.first_placeholder(), Some(0));
    }

    #[test]
    fn input_nodes_follow_argument_order() {
        let mut b = GraphBuilder::new();
        b.placeholder("a").unwrap();
        b.placeholder("b").unwrap();
        b.call_function(
            "f",
            "add",
            vec![Arg::Node("b".into()), Arg::Node("a".into()), Arg::Node("b".into())],
        )
        .unwrap();
        let g = b.finish().unwrap();
        let f = g.node(g.lookup("f").unwrap());
        assert_eq!(f.input_nodes(), vec!["b", "a"]);
    }
}
