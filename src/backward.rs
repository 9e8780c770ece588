//! Per-node backward primitives for the stage backward engine.
//!
//! Each method- or submodule-call node cached its outputs and the detached,
//! re-tracked inputs it consumed during the forward pass. Differentiation
//! within one stage is therefore self-contained: the surrogate
//! Σ outputᵢ · gradᵢ is built from the cached outputs and backpropagated to
//! the tracked input leaves, which is exactly the vector-Jacobian product
//! the downstream gradient asks for.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::error::Result;
use crate::graph::{Graph, NodeId, OpKind};
use crate::value::Value;

/// One forward-pass argument as the backward engine saved it: a tracked
/// gradient leaf for floating tensors, or the value as-is.
pub enum SavedInput {
    Tracked(Var),
    Plain(Value),
}

/// The per-node record the forward pass writes and the backward pass
/// consumes exactly once.
pub struct CacheEntry {
    /// The call result, normalized to a sequence (tuple outputs flatten,
    /// single outputs become one-element sequences).
    pub outputs: Vec<Value>,
    /// The exact inputs the call consumed, in call order.
    pub inputs: Vec<SavedInput>,
}

/// Gradients flowing into a node's output, aligned positionally with its
/// cached outputs. `None` means "unit seed": valid only for a scalar
/// output, i.e. the loss head.
pub type OutputGrads = Vec<Option<Tensor>>;

pub struct BackwardOutcome {
    /// Per cached input, the gradient of the surrogate with respect to it.
    /// `None` for untracked inputs and for branches the loss never reached.
    pub input_grads: Vec<Option<Tensor>>,
    /// The full gradient store of this node's backward, from which the
    /// runner also harvests parameter gradients.
    pub grads: Option<GradStore>,
}

/// Differentiates one node's cached outputs with respect to its cached
/// inputs, given the incoming output gradients.
pub fn stage_backward(
    outputs: &[Value],
    output_grads: &OutputGrads,
    inputs: &[SavedInput],
) -> Result<BackwardOutcome> {
    let mut surrogate: Option<Tensor> = None;
    for (idx, out) in outputs.iter().enumerate() {
        let Value::Tensor(out) = out else { continue };
        let grad = output_grads.get(idx).and_then(|g| g.as_ref());
        let term = match grad {
            Some(grad) => out.mul(grad)?.sum_all()?,
            // A unit seed is only meaningful for a scalar output (the loss
            // head); a non-scalar output with no incoming gradient is a
            // branch the loss never reached and contributes nothing.
            None if out.elem_count() == 1 => out.sum_all()?,
            None => continue,
        };
        surrogate = Some(match surrogate {
            Some(acc) => acc.add(&term)?,
            None => term,
        });
    }

    let Some(surrogate) = surrogate else {
        // Nothing differentiable flowed out of this node.
        return Ok(BackwardOutcome {
            input_grads: vec![None; inputs.len()],
            grads: None,
        });
    };

    let grads = surrogate.backward()?;
    let input_grads = inputs
        .iter()
        .map(|input| match input {
            SavedInput::Tracked(var) => grads.get(var.as_tensor()).cloned(),
            SavedInput::Plain(_) => None,
        })
        .collect();

    Ok(BackwardOutcome {
        input_grads,
        grads: Some(grads),
    })
}

/// Resolves which predecessor each per-input gradient belongs to.
///
/// Function-call nodes are transparent: attribution walks through their own
/// argument lists until it reaches a method-call, submodule-call, or
/// placeholder node. Implemented as an explicit worklist so deep chains of
/// function nodes cannot overflow the stack.
pub fn resolve_destinations(graph: &Graph, node: NodeId) -> Result<Vec<NodeId>> {
    let mut targets = Vec::new();
    let mut work: Vec<String> = graph
        .node(node)
        .input_nodes()
        .iter()
        .rev()
        .map(|s| s.to_string())
        .collect();

    while let Some(name) = work.pop() {
        let id = graph.require(&name)?;
        match graph.node(id).op {
            OpKind::CallModule | OpKind::CallMethod | OpKind::Placeholder => targets.push(id),
            OpKind::CallFunction => {
                for input in graph.node(id).input_nodes().iter().rev() {
                    work.push(input.to_string());
                }
            }
            // Attribute reads and output markers carry no gradient of
            // their own.
            OpKind::GetAttr | OpKind::Output => {}
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Arg, GraphBuilder};

    #[test]
    fn attribution_recurses_through_function_calls() {
        let mut b = GraphBuilder::new();
        b.placeholder("x").unwrap();
        b.call_module("l0", "layers.0", vec![Arg::Node("x".into())])
            .unwrap();
        b.call_module("l1", "layers.1", vec![Arg::Node("x".into())])
            .unwrap();
        b.call_function(
            "sum01",
            "add",
            vec![Arg::Node("l0".into()), Arg::Node("l1".into())],
        )
        .unwrap();
        b.call_function(
            "scaled",
            "mul",
            vec![Arg::Node("sum01".into()), Arg::Node("l0".into())],
        )
        .unwrap();
        b.call_module("l2", "layers.2", vec![Arg::Node("scaled".into())])
            .unwrap();
        let g = b.finish().unwrap();

        let dests = resolve_destinations(&g, g.lookup("l2").unwrap()).unwrap();
        let names: Vec<&str> = dests.iter().map(|&id| g.node(id).name.as_str()).collect();
        // scaled -> (sum01 -> (l0, l1), l0): in-order flattening.
        assert_eq!(names, vec!["l0", "l1", "l0"]);
    }
}
