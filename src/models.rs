//! Reference model zoo: deterministic dense layers, an MSE loss head, and
//! graph builders producing the sequential topology the partitioner expects.
//!
//! Initialization is deterministic by construction (no RNG crate in the
//! dependency set) so that every rank building the same registry holds
//! bit-identical parameters and tests can assert exact equivalence between
//! pipelined and single-process runs.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::graph::{Arg, Graph, GraphBuilder};
use crate::registry::{CallableModule, ModuleRegistry};
use crate::value::Value;

/// Registry path of the loss head in graphs built by [`sequential_graph`].
pub const LOSS_TARGET: &str = "loss_fn";

/// A fully connected layer with an optional ReLU, parameters held as
/// tracked `Var`s so the stage backward can harvest their gradients.
pub struct DenseLayer {
    weight: Var,
    bias: Var,
    relu: bool,
}

impl DenseLayer {
    /// Deterministic initialization: a scaled sine lattice for the weight,
    /// zeros for the bias. `salt` decorrelates layers of the same shape.
    pub fn deterministic(in_dim: usize, out_dim: usize, relu: bool, salt: usize) -> Result<Self> {
        let scale = 0.5 / (in_dim as f64).sqrt();
        let weight = Var::from_tensor(&deterministic_tensor(in_dim, out_dim, salt, scale)?)?;
        let bias = Var::from_tensor(&Tensor::zeros((1, out_dim), DType::F32, &Device::Cpu)?)?;
        debug!(in_dim, out_dim, relu, salt, "dense layer initialized");
        Ok(Self { weight, bias, relu })
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> &Var {
        &self.bias
    }
}

impl CallableModule for DenseLayer {
    fn call(&self, args: &[Value]) -> Result<Value> {
        let x = args
            .first()
            .ok_or_else(|| PipelineError::Execution("dense layer called with no input".into()))?
            .expect_tensor("dense layer input")?;
        let y = x.matmul(self.weight.as_tensor())?;
        let y = y.broadcast_add(self.bias.as_tensor())?;
        let y = if self.relu { y.relu()? } else { y };
        Ok(Value::Tensor(y))
    }
}

/// Mean-squared-error loss head: `(prediction, target) -> scalar`.
pub struct MseLoss;

impl CallableModule for MseLoss {
    fn call(&self, args: &[Value]) -> Result<Value> {
        let [pred, target] = args else {
            return Err(PipelineError::Execution(format!(
                "loss head takes (prediction, target), got {} arguments",
                args.len()
            )));
        };
        let pred = pred.expect_tensor("loss prediction")?;
        let target = target.expect_tensor("loss target")?;
        Ok(Value::Tensor(candle_nn::loss::mse(pred, target)?))
    }
}

/// Builds a registry hosting an MLP: `dims.len() - 1` dense layers at
/// `layers.<i>` (ReLU on all but the last), their parameters at
/// `layers.<i>.weight` / `layers.<i>.bias`, and the loss head at
/// [`LOSS_TARGET`].
pub fn build_mlp_registry(dims: &[usize], salt: usize) -> Result<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    let layer_count = dims.len().saturating_sub(1);
    for i in 0..layer_count {
        let relu = i + 1 < layer_count;
        let layer = DenseLayer::deterministic(dims[i], dims[i + 1], relu, salt + i)?;
        registry.register_param(&format!("layers.{i}.weight"), layer.weight.clone());
        registry.register_param(&format!("layers.{i}.bias"), layer.bias.clone());
        registry.register_module(&format!("layers.{i}"), Arc::new(layer));
    }
    registry.register_module(LOSS_TARGET, Arc::new(MseLoss));
    Ok(registry)
}

/// Builds the node sequence of a sequential MLP: one input placeholder, one
/// submodule-call per layer, and (optionally) a targets placeholder feeding
/// the loss head before the output marker.
pub fn sequential_graph(layer_count: usize, with_loss: bool) -> Result<Graph> {
    let mut b = GraphBuilder::new();
    b.placeholder("x")?;
    let targets = if with_loss {
        b.placeholder("targets")?;
        Some("targets".to_string())
    } else {
        None
    };
    let mut prev = "x".to_string();
    for i in 0..layer_count {
        let name = format!("layer_{i}");
        b.call_module(&name, &format!("layers.{i}"), vec![Arg::Node(prev)])?;
        prev = name;
    }
    let last = if let Some(targets) = targets {
        b.call_module(
            "loss",
            LOSS_TARGET,
            vec![Arg::Node(prev), Arg::Node(targets)],
        )?;
        "loss".to_string()
    } else {
        prev
    };
    b.output("out", &last)?;
    b.finish()
}

/// A reproducible pseudo-random matrix: element `i` of the row-major layout
/// is `sin(0.7311·i + 1.913·salt) · scale`, f32 on the CPU.
pub fn deterministic_tensor(rows: usize, cols: usize, salt: usize, scale: f64) -> Result<Tensor> {
    let mut data = Vec::with_capacity(rows * cols);
    for i in 0..rows * cols {
        let v = ((i as f64) * 0.7311 + (salt as f64) * 1.913).sin() * scale;
        data.push(v as f32);
    }
    Ok(Tensor::from_vec(data, (rows, cols), &Device::Cpu)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpKind;

    #[test]
    fn dense_layer_forward_shape() {
        let layer = DenseLayer::deterministic(4, 3, true, 0).unwrap();
        let x = deterministic_tensor(2, 4, 7, 1.0).unwrap();
        let y = layer.call(&[Value::Tensor(x)]).unwrap();
        assert_eq!(y.expect_tensor("test").unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn deterministic_init_is_reproducible() {
        let a = DenseLayer::deterministic(4, 3, false, 5).unwrap();
        let b = DenseLayer::deterministic(4, 3, false, 5).unwrap();
        let diff = a
            .weight()
            .as_tensor()
            .sub(b.weight().as_tensor())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn mse_loss_is_scalar_and_zero_on_match() {
        let x = deterministic_tensor(3, 2, 1, 1.0).unwrap();
        let loss = MseLoss
            .call(&[Value::Tensor(x.clone()), Value::Tensor(x)])
            .unwrap();
        let loss = loss.expect_tensor("test").unwrap().clone();
        assert_eq!(loss.elem_count(), 1);
        assert!(loss.to_scalar::<f32>().unwrap().abs() < 1e-9);
    }

    #[test]
    fn sequential_graph_with_loss_ends_in_loss_node() {
        let g = sequential_graph(3, true).unwrap();
        // x, targets, layer_0..2, loss, out
        assert_eq!(g.len(), 7);
        let loss = g.node(g.lookup("loss").unwrap());
        assert_eq!(loss.op, OpKind::CallModule);
        assert_eq!(loss.target, LOSS_TARGET);
    }
}
