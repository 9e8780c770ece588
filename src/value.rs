use std::collections::BTreeSet;

use candle_core::{DType, Tensor};

use crate::error::{PipelineError, Result};

/// A runtime value flowing through the graph and across stage boundaries.
///
/// This is the closed set of shapes the typed transport can frame: a tensor,
/// the recursive composites, a shape descriptor, a plain integer, and an
/// index set. Anything else a node produces is a graph authoring error.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Shape(Vec<usize>),
    Int(i64),
    Set(BTreeSet<i64>),
}

impl Value {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn expect_tensor(&self, context: &str) -> Result<&Tensor> {
        self.as_tensor()
            .ok_or_else(|| PipelineError::Execution(format!("{context}: expected a tensor, got {self:?}")))
    }

    /// The values cached by a call node, normalized to a tuple: a bare value
    /// becomes a one-element sequence so single- and tuple-valued outputs
    /// are handled uniformly downstream.
    pub fn into_output_list(self) -> Vec<Value> {
        match self {
            Value::Tuple(vs) => vs,
            v => vec![v],
        }
    }
}

/// Whether a tensor participates in gradient tracking. Candle has no
/// per-tensor requires-grad flag, so floating dtype is the criterion.
pub fn is_floating(t: &Tensor) -> bool {
    matches!(t.dtype(), DType::F16 | DType::BF16 | DType::F32 | DType::F64)
}
