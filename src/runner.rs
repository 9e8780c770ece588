//! The per-rank execution engine: forward graph interpretation, the stage
//! backward walk, and the micro-batch schedule that drives both.
//!
//! One [`StageRunner`] is owned by one worker process (or thread) hosting
//! one pipeline stage. All interpreter state — per-micro-batch environments,
//! the forward cache, the gradient maps — lives on the struct and is
//! private to the rank; nothing is shared across processes except the
//! typed frames on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tracing::{debug, warn};

use crate::backward::{resolve_destinations, stage_backward, CacheEntry, OutputGrads, SavedInput};
use crate::error::{PipelineError, Result};
use crate::graph::{Arg, Graph, NodeId, OpKind};
use crate::registry::{invoke_method, ModuleRegistry};
use crate::split::{broadcast_metadata, partition, stage_range, RangeMetadata};
use crate::transport::{recv_value, send_value, Messaging};
use crate::value::{is_floating, Value};

pub struct StageRunner {
    graph: Graph,
    registry: ModuleRegistry,
    mesh: Arc<dyn Messaging>,
    metadata: RangeMetadata,
    rank: usize,
    world: usize,
    micro_batches: usize,
    /// Submodule target treated as the loss head: its forward result is
    /// recorded as the per-micro-batch loss and its backward takes a unit
    /// seed.
    loss_target: Option<String>,
    range: (NodeId, NodeId),
    env: Vec<HashMap<String, Value>>,
    fwd_cache: Vec<HashMap<String, CacheEntry>>,
    grads: Vec<HashMap<String, OutputGrads>>,
    losses: Vec<Option<Tensor>>,
    param_grads: HashMap<String, Tensor>,
}

impl StageRunner {
    /// Builds the runner for this rank. Rank 0 computes the partition and
    /// publishes it; every other rank receives the boundaries verbatim.
    pub fn new(
        graph: Graph,
        registry: ModuleRegistry,
        mesh: Arc<dyn Messaging>,
        micro_batches: usize,
        loss_target: Option<String>,
    ) -> Result<Self> {
        if micro_batches == 0 {
            return Err(PipelineError::Configuration(
                "micro-batch count must be at least 1".into(),
            ));
        }
        let rank = mesh.rank();
        let world = mesh.world_size();
        let local = if rank == 0 {
            Some(partition(&graph, world)?)
        } else {
            None
        };
        let metadata = broadcast_metadata(mesh.as_ref(), local)?;
        let range = stage_range(&graph, &metadata, rank)?;

        Ok(Self {
            graph,
            registry,
            mesh,
            metadata,
            rank,
            world,
            micro_batches,
            loss_target,
            range,
            env: (0..micro_batches).map(|_| HashMap::new()).collect(),
            fwd_cache: (0..micro_batches).map(|_| HashMap::new()).collect(),
            grads: (0..micro_batches).map(|_| HashMap::new()).collect(),
            losses: vec![None; micro_batches],
            param_grads: HashMap::new(),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world
    }

    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    pub fn is_first_stage(&self) -> bool {
        self.rank == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.rank == self.world - 1
    }

    pub fn metadata(&self) -> &RangeMetadata {
        &self.metadata
    }

    pub fn range(&self) -> (NodeId, NodeId) {
        self.range
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn mesh(&self) -> &Arc<dyn Messaging> {
        &self.mesh
    }

    /// Parameter gradients accumulated over the last backward sweep, keyed
    /// by registry path. The optimizer's input.
    pub fn param_grads(&self) -> &HashMap<String, Tensor> {
        &self.param_grads
    }

    /// Per-micro-batch losses recorded at the loss head, if one executed
    /// on this rank.
    pub fn losses(&self) -> &[Option<Tensor>] {
        &self.losses
    }

    pub fn mean_loss(&self) -> Result<Option<f32>> {
        let mut sum = 0f32;
        for loss in &self.losses {
            match loss {
                Some(t) => sum += t.to_scalar::<f32>()?,
                None => return Ok(None),
            }
        }
        Ok(Some(sum / self.micro_batches as f32))
    }

    /// Number of undrained forward-cache entries for one micro-batch.
    pub fn cache_entries(&self, mb: usize) -> usize {
        self.fwd_cache[mb].len()
    }

    /// Splits `batch` into one contiguous slice per micro-batch and binds
    /// each slice to `node` in that micro-batch's environment. The batch
    /// must divide evenly; there is no remainder handling.
    pub fn seed_batch(&mut self, node: &str, batch: &Tensor) -> Result<()> {
        let rows = batch.dims().first().copied().unwrap_or(0);
        if rows == 0 || rows % self.micro_batches != 0 {
            return Err(PipelineError::Configuration(format!(
                "batch of {rows} rows does not divide into {} micro-batches",
                self.micro_batches
            )));
        }
        let slices = batch.chunk(self.micro_batches, 0)?;
        for (mb, slice) in slices.into_iter().enumerate() {
            self.env[mb].insert(node.to_string(), Value::Tensor(slice));
        }
        Ok(())
    }

    /// Binds a single value for one micro-batch, e.g. a label chunk
    /// received over the transport.
    pub fn seed_value(&mut self, mb: usize, node: &str, value: Value) {
        self.env[mb].insert(node.to_string(), value);
    }

    /// Seeds the gradient flowing into this stage's boundary node for one
    /// micro-batch. The entry point for graphs without a loss head.
    pub fn seed_output_grad(&mut self, mb: usize, grad: Tensor) {
        let to_name = self.graph.node(self.range.1).name.clone();
        self.grads[mb].insert(to_name, vec![Some(grad)]);
    }

    fn reset_step(&mut self) {
        for mb in 0..self.micro_batches {
            self.env[mb].clear();
            self.fwd_cache[mb].clear();
            self.grads[mb].clear();
            self.losses[mb] = None;
        }
        self.param_grads.clear();
    }

    /// One forward sweep with explicit placeholder feeds: each named batch
    /// is split across micro-batches, then micro-batches 0..M−1 run in
    /// order, each received from upstream (unless first stage), interpreted,
    /// and sent downstream (unless last stage). Discards all state from the
    /// previous step.
    ///
    /// A rank feeds every placeholder its own node range executes, plus any
    /// placeholder a node in its range references by name (the last stage's
    /// loss head reads the target batch this way).
    pub fn run_forward_with(&mut self, feeds: &[(&str, &Tensor)]) -> Result<()> {
        self.reset_step();
        for (node, batch) in feeds {
            self.seed_batch(node, batch)?;
        }
        for mb in 0..self.micro_batches {
            self.micro_forward(mb)?;
        }
        Ok(())
    }

    /// One forward sweep feeding `input` to the graph's first placeholder.
    pub fn run_forward(&mut self, input: Option<&Tensor>) -> Result<()> {
        match input {
            Some(input) => {
                if !self.is_first_stage() {
                    return Err(PipelineError::Configuration(
                        "only the first stage takes the batch input".into(),
                    ));
                }
                let placeholder = self.graph.first_placeholder().ok_or_else(|| {
                    PipelineError::Reference("graph has no placeholder node".into())
                })?;
                let name = self.graph.node(placeholder).name.clone();
                self.run_forward_with(&[(&name, input)])
            }
            None => self.run_forward_with(&[]),
        }
    }

    /// One backward sweep: micro-batches 0..M−1 in order, mirroring the
    /// forward sweep. Parameter gradients accumulate across micro-batches.
    pub fn run_backward(&mut self) -> Result<()> {
        for mb in 0..self.micro_batches {
            self.micro_backward(mb)?;
        }
        Ok(())
    }

    /// Forward then backward; on the last stage, the concatenated
    /// full-batch output.
    pub fn train_step(&mut self, feeds: &[(&str, &Tensor)]) -> Result<Option<Tensor>> {
        self.run_forward_with(feeds)?;
        self.run_backward()?;
        self.collect_output()
    }

    fn micro_forward(&mut self, mb: usize) -> Result<()> {
        let (from, to) = self.range;

        if !self.is_first_stage() {
            // The hand-off is keyed to the node immediately preceding our
            // first node: the sender's boundary.
            let boundary = self.graph.prev(from).ok_or_else(|| {
                PipelineError::Reference("stage range starts at the graph head yet expects an upstream".into())
            })?;
            let name = self.graph.node(boundary).name.clone();
            let value = recv_value(self.mesh.as_ref(), self.rank - 1)?;
            debug!(rank = self.rank, mb, node = %name, "activation received");
            self.env[mb].insert(name, value);
        }

        for id in from..=to {
            self.run_node(id, mb)?;
        }

        if !self.is_last_stage() {
            let to_name = &self.graph.node(to).name;
            let value = self.env[mb]
                .get(to_name)
                .cloned()
                .ok_or_else(|| {
                    PipelineError::Reference(format!("boundary node '{to_name}' produced no value"))
                })?;
            send_value(self.mesh.as_ref(), &value, self.rank + 1)?;
            debug!(rank = self.rank, mb, node = %to_name, "activation sent");
        }
        Ok(())
    }

    fn resolve_arg(&self, mb: usize, arg: &Arg) -> Result<Value> {
        match arg {
            Arg::Node(name) => self.env[mb].get(name).cloned().ok_or_else(|| {
                PipelineError::Reference(format!("value of node '{name}' has not been produced"))
            }),
            Arg::Int(i) => Ok(Value::Int(*i)),
            Arg::Ints(is) => Ok(Value::List(is.iter().map(|&i| Value::Int(i)).collect())),
        }
    }

    fn resolve_args(&self, mb: usize, node: NodeId) -> Result<Vec<Value>> {
        let node = self.graph.node(node);
        node.args
            .iter()
            .chain(node.kwargs.iter().map(|(_, a)| a))
            .map(|a| self.resolve_arg(mb, a))
            .collect()
    }

    fn is_loss_node(&self, target: &str) -> bool {
        self.loss_target.as_deref() == Some(target)
    }

    fn run_node(&mut self, id: NodeId, mb: usize) -> Result<()> {
        let node = self.graph.node(id).clone();
        let value = match node.op {
            OpKind::Placeholder => self.env[mb].get(&node.name).cloned().ok_or_else(|| {
                PipelineError::Reference(format!(
                    "placeholder '{}' has no bound value; input not seeded or hand-off missing",
                    node.name
                ))
            })?,
            OpKind::GetAttr => {
                let var = self.registry.param(&node.target)?;
                Value::Tensor(var.as_tensor().clone())
            }
            OpKind::CallFunction => {
                let args = self.resolve_args(mb, id)?;
                let f = self.registry.function(&node.target)?;
                f(&args)?
            }
            OpKind::CallMethod | OpKind::CallModule => {
                let args = self.resolve_args(mb, id)?;
                // Detach every floating tensor argument from its upstream
                // history and re-track it locally; the call's autodiff
                // history then starts and ends inside this stage.
                let mut saved = Vec::with_capacity(args.len());
                let mut call_args = Vec::with_capacity(args.len());
                for arg in args {
                    match arg {
                        Value::Tensor(t) if is_floating(&t) => {
                            let var = Var::from_tensor(&t.detach())?;
                            call_args.push(Value::Tensor(var.as_tensor().clone()));
                            saved.push(SavedInput::Tracked(var));
                        }
                        other => {
                            saved.push(SavedInput::Plain(other.clone()));
                            call_args.push(other);
                        }
                    }
                }

                let result = if node.op == OpKind::CallMethod {
                    let (recv, rest) = call_args.split_first().ok_or_else(|| {
                        PipelineError::Execution(format!(
                            "method-call node '{}' has no receiver argument",
                            node.name
                        ))
                    })?;
                    invoke_method(&node.target, recv, rest)?
                } else {
                    let module = self.registry.submodule(&node.target)?.clone();
                    module.call(&call_args)?
                };

                if node.op == OpKind::CallModule && self.is_loss_node(&node.target) {
                    self.losses[mb] = Some(result.expect_tensor("loss head output")?.clone());
                }

                self.fwd_cache[mb].insert(
                    node.name.clone(),
                    CacheEntry {
                        outputs: result.clone().into_output_list(),
                        inputs: saved,
                    },
                );
                result
            }
            OpKind::Output => {
                let arg = node.args.first().ok_or_else(|| {
                    PipelineError::Reference(format!("output node '{}' has no argument", node.name))
                })?;
                self.resolve_arg(mb, arg)?
            }
        };
        self.env[mb].insert(node.name, value);
        Ok(())
    }

    fn micro_backward(&mut self, mb: usize) -> Result<()> {
        let (from, to) = self.range;

        if !self.is_last_stage() {
            let value = recv_value(self.mesh.as_ref(), self.rank + 1)?;
            let to_name = self.graph.node(to).name.clone();
            debug!(rank = self.rank, mb, node = %to_name, "gradient received");
            self.grads[mb].insert(to_name, value_to_grads(value)?);
        }

        let mut id = to;
        loop {
            self.backward_node(id, mb)?;
            if id == from {
                break;
            }
            id = self
                .graph
                .prev(id)
                .ok_or_else(|| PipelineError::Reference("reverse walk fell off the graph head".into()))?;
        }

        // Entries still cached belong to branches the gradient never
        // reached (e.g. unused auxiliary outputs). Legitimate, but worth a
        // trace.
        if !self.fwd_cache[mb].is_empty() {
            let leftover: Vec<String> = self.fwd_cache[mb].keys().cloned().collect();
            warn!(rank = self.rank, mb, ?leftover, "forward cache not fully drained");
        }

        if !self.is_first_stage() {
            let boundary = self.graph.prev(from).ok_or_else(|| {
                PipelineError::Reference("stage range starts at the graph head yet expects an upstream".into())
            })?;
            let name = self.graph.node(boundary).name.clone();
            let seeds = self.grads[mb].remove(&name).ok_or_else(|| {
                PipelineError::Reference(format!("no gradient reached the stage input '{name}'"))
            })?;
            send_value(self.mesh.as_ref(), &grads_to_value(&name, seeds)?, self.rank - 1)?;
            debug!(rank = self.rank, mb, node = %name, "gradient sent");
        }
        Ok(())
    }

    fn backward_node(&mut self, id: NodeId, mb: usize) -> Result<()> {
        let node = self.graph.node(id).clone();
        match node.op {
            // The output marker is transparent: a gradient seeded on it
            // belongs to the node it forwards.
            OpKind::Output => {
                if let Some(seeds) = self.grads[mb].remove(&node.name) {
                    if let Some(Arg::Node(src)) = node.args.first() {
                        self.grads[mb].insert(src.clone(), seeds);
                    }
                }
                return Ok(());
            }
            // Externally-fed inputs, attribute reads, and function calls
            // (handled transparently by attribution) have no local backward
            // of their own.
            OpKind::Placeholder | OpKind::GetAttr | OpKind::CallFunction => return Ok(()),
            OpKind::CallMethod | OpKind::CallModule => {}
        }

        let incoming = self.grads[mb].remove(&node.name);
        let is_loss = self.is_loss_node(&node.target);
        if incoming.is_none() && !is_loss {
            // This branch contributed no loss-reachable effect; its cache
            // entry stays and the drain check reports it.
            debug!(rank = self.rank, mb, node = %node.name, "no incoming gradient; skipped");
            return Ok(());
        }

        let cache = self.fwd_cache[mb].remove(&node.name).ok_or_else(|| {
            PipelineError::Reference(format!(
                "node '{}' received a gradient but cached no forward state",
                node.name
            ))
        })?;
        // The seed list covers every cached output; missing tail entries
        // mean no gradient for that output.
        let mut seeds = incoming.unwrap_or_default();
        seeds.resize(cache.outputs.len(), None);

        let outcome = stage_backward(&cache.outputs, &seeds, &cache.inputs)?;
        if let Some(store) = &outcome.grads {
            self.accumulate_param_grads(store)?;
        }

        let dests = resolve_destinations(&self.graph, id)?;
        for (i, dest) in dests.into_iter().enumerate() {
            let grad = outcome.input_grads.get(i).cloned().flatten();
            let dest_name = self.graph.node(dest).name.clone();
            self.grads[mb].insert(dest_name, vec![grad]);
        }
        Ok(())
    }

    fn accumulate_param_grads(&mut self, store: &GradStore) -> Result<()> {
        for (path, var) in self.registry.params() {
            if let Some(grad) = store.get(var.as_tensor()) {
                let updated = match self.param_grads.get(path) {
                    Some(acc) => acc.add(grad)?,
                    None => grad.clone(),
                };
                self.param_grads.insert(path.clone(), updated);
            }
        }
        Ok(())
    }

    /// Last submodule-call of this stage that is not the loss head; its
    /// per-micro-batch values are the model output.
    fn last_module_node(&self) -> Result<NodeId> {
        let (from, to) = self.range;
        let mut id = to;
        loop {
            let node = self.graph.node(id);
            if node.op == OpKind::CallModule && !self.is_loss_node(&node.target) {
                return Ok(id);
            }
            if id == from {
                return Err(PipelineError::Reference(
                    "stage has no submodule-call node to read an output from".into(),
                ));
            }
            id -= 1;
        }
    }

    /// On the last stage, concatenates the per-micro-batch outputs in
    /// micro-batch order into the full-batch output. Other stages produce
    /// nothing.
    pub fn collect_output(&self) -> Result<Option<Tensor>> {
        if !self.is_last_stage() {
            return Ok(None);
        }
        let name = &self.graph.node(self.last_module_node()?).name;
        let mut parts = Vec::with_capacity(self.micro_batches);
        for mb in 0..self.micro_batches {
            let value = self.env[mb].get(name).ok_or_else(|| {
                PipelineError::Reference(format!("no forward value for output node '{name}'"))
            })?;
            parts.push(value.expect_tensor("stage output")?.clone());
        }
        Ok(Some(Tensor::cat(&parts, 0)?))
    }
}

fn value_to_grads(value: Value) -> Result<OutputGrads> {
    match value {
        Value::Tensor(t) => Ok(vec![Some(t)]),
        Value::Tuple(vs) | Value::List(vs) => vs
            .into_iter()
            .map(|v| match v {
                Value::Tensor(t) => Ok(Some(t)),
                other => Err(PipelineError::Encoding(format!(
                    "gradient element is not a tensor: {other:?}"
                ))),
            })
            .collect(),
        other => Err(PipelineError::Encoding(format!(
            "gradient message is not tensor-shaped: {other:?}"
        ))),
    }
}

fn grads_to_value(node: &str, seeds: OutputGrads) -> Result<Value> {
    let tensors = seeds
        .into_iter()
        .map(|g| {
            g.map(Value::Tensor).ok_or_else(|| {
                PipelineError::Encoding(format!(
                    "gradient for '{node}' has an empty entry and cannot be framed"
                ))
            })
        })
        .collect::<Result<Vec<Value>>>()?;
    Ok(Value::Tuple(tensors))
}
