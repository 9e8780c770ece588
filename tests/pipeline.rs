//! End-to-end schedule tests: every stage runs as one thread over an
//! in-memory mesh, mirroring the per-process deployment without sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use candle_core::{DType, Tensor};

use pipegraph::models::{build_mlp_registry, deterministic_tensor, sequential_graph, LOSS_TARGET};
use pipegraph::{
    memory_mesh, Arg, GraphBuilder, MemoryMesh, Messaging, StageRunner, Value,
};

const DIMS: &[usize] = &[6, 8, 8, 2];

/// Wraps a mesh endpoint and counts the frames crossing it.
struct CountingMesh {
    inner: MemoryMesh,
    sent: AtomicUsize,
    received: AtomicUsize,
}

impl CountingMesh {
    fn new(inner: MemoryMesh) -> Self {
        Self {
            inner,
            sent: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
        }
    }
}

impl Messaging for CountingMesh {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn send(&self, dst: usize, frame: &[u8]) -> pipegraph::Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.inner.send(dst, frame)
    }

    fn recv(&self, src: usize) -> pipegraph::Result<Vec<u8>> {
        self.received.fetch_add(1, Ordering::SeqCst);
        self.inner.recv(src)
    }
}

fn mlp_runner(mesh: Arc<dyn Messaging>, micro_batches: usize) -> StageRunner {
    let registry = build_mlp_registry(DIMS, 3).unwrap();
    let graph = sequential_graph(DIMS.len() - 1, true).unwrap();
    StageRunner::new(graph, registry, mesh, micro_batches, Some(LOSS_TARGET.to_string())).unwrap()
}

fn fixture(batch: usize) -> (Tensor, Tensor) {
    let x = deterministic_tensor(batch, DIMS[0], 11, 1.0).unwrap();
    let targets = deterministic_tensor(batch, *DIMS.last().unwrap(), 22, 0.5).unwrap();
    (x, targets)
}

fn feeds_for<'a>(
    runner: &StageRunner,
    x: &'a Tensor,
    targets: &'a Tensor,
) -> Vec<(&'static str, &'a Tensor)> {
    let mut feeds = Vec::new();
    if runner.is_first_stage() {
        feeds.push(("x", x));
        feeds.push(("targets", targets));
    } else if runner.is_last_stage() {
        feeds.push(("targets", targets));
    }
    feeds
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    a.sub(b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

struct StageReport {
    rank: usize,
    sent: usize,
    received: usize,
    output: Option<Tensor>,
    mean_loss: Option<f32>,
    drained: bool,
    grad_paths: Vec<String>,
}

#[test]
fn two_stage_pipeline_exchanges_one_frame_per_microbatch_per_direction() {
    let micro_batches = 2;
    let mut handles = Vec::new();
    for endpoint in memory_mesh(2) {
        handles.push(thread::spawn(move || -> StageReport {
            let mesh = Arc::new(CountingMesh::new(endpoint));
            let counter = Arc::clone(&mesh);
            let mut runner = mlp_runner(mesh, micro_batches);
            let (x, targets) = fixture(4);

            let feeds = feeds_for(&runner, &x, &targets);
            runner.run_forward_with(&feeds).unwrap();
            runner.run_backward().unwrap();

            let mut grad_paths: Vec<String> = runner.param_grads().keys().cloned().collect();
            grad_paths.sort();
            StageReport {
                rank: runner.rank(),
                sent: counter.sent.load(Ordering::SeqCst),
                received: counter.received.load(Ordering::SeqCst),
                output: runner.collect_output().unwrap(),
                mean_loss: runner.mean_loss().unwrap(),
                drained: (0..micro_batches).all(|mb| runner.cache_entries(mb) == 0),
                grad_paths,
            }
        }));
    }

    let mut reports: Vec<StageReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    reports.sort_by_key(|r| r.rank);
    let [first, last] = reports.as_slice() else { panic!("expected 2 reports") };

    // Rank 0: one metadata frame plus one activation per micro-batch out,
    // one gradient per micro-batch back.
    assert_eq!(first.sent, 1 + micro_batches);
    assert_eq!(first.received, micro_batches);
    assert_eq!(last.sent, micro_batches);
    assert_eq!(last.received, 1 + micro_batches);

    assert!(first.output.is_none());
    assert!(first.mean_loss.is_none());
    let output = last.output.as_ref().expect("last stage output");
    assert_eq!(output.dims(), &[4, 2]);
    assert!(last.mean_loss.expect("last stage loss") > 0.0);

    assert!(first.drained);
    assert!(last.drained);

    // The four submodule calls split two-and-two: layers 0-1 upstream,
    // layer 2 and the loss head downstream. Parameter gradients land only
    // where the owning stage ran.
    assert_eq!(
        first.grad_paths,
        vec![
            "layers.0.bias".to_string(),
            "layers.0.weight".to_string(),
            "layers.1.bias".to_string(),
            "layers.1.weight".to_string(),
        ]
    );
    assert_eq!(
        last.grad_paths,
        vec!["layers.2.bias".to_string(), "layers.2.weight".to_string()]
    );
}

#[test]
fn single_stage_matches_direct_computation() {
    let mesh = memory_mesh(1).remove(0);
    let mut runner = mlp_runner(Arc::new(mesh), 1);
    let (x, targets) = fixture(4);

    runner
        .run_forward_with(&[("x", &x), ("targets", &targets)])
        .unwrap();
    runner.run_backward().unwrap();
    let output = runner.collect_output().unwrap().expect("output");
    let loss = runner.mean_loss().unwrap().expect("loss");

    // The same parameters, driven directly through candle's autodiff.
    let registry = build_mlp_registry(DIMS, 3).unwrap();
    let mut value = Value::Tensor(x.clone());
    for i in 0..DIMS.len() - 1 {
        value = registry
            .submodule(&format!("layers.{i}"))
            .unwrap()
            .call(&[value])
            .unwrap();
    }
    let prediction = value.expect_tensor("prediction").unwrap().clone();
    let direct_loss = candle_nn::loss::mse(&prediction, &targets).unwrap();
    let direct_grads = direct_loss.backward().unwrap();

    assert!(max_abs_diff(&output, &prediction) < 1e-5);
    assert!((loss - direct_loss.to_scalar::<f32>().unwrap()).abs() < 1e-6);

    for (path, var) in registry.params() {
        let direct = direct_grads
            .get(var.as_tensor())
            .unwrap_or_else(|| panic!("no direct gradient for {path}"));
        let staged = runner
            .param_grads()
            .get(path)
            .unwrap_or_else(|| panic!("no staged gradient for {path}"));
        assert!(
            max_abs_diff(staged, direct) < 1e-5,
            "gradient mismatch at {path}"
        );
    }
}

#[test]
fn micro_batching_preserves_the_full_batch_result() {
    let (x, targets) = fixture(4);

    let mut whole = mlp_runner(Arc::new(memory_mesh(1).remove(0)), 1);
    whole
        .run_forward_with(&[("x", &x), ("targets", &targets)])
        .unwrap();
    whole.run_backward().unwrap();

    let mut split = mlp_runner(Arc::new(memory_mesh(1).remove(0)), 2);
    split
        .run_forward_with(&[("x", &x), ("targets", &targets)])
        .unwrap();
    split.run_backward().unwrap();

    let whole_out = whole.collect_output().unwrap().unwrap();
    let split_out = split.collect_output().unwrap().unwrap();
    assert!(max_abs_diff(&whole_out, &split_out) < 1e-6);

    // Equal-sized micro-batches: the mean of per-micro-batch MSE losses is
    // the full-batch MSE.
    let whole_loss = whole.mean_loss().unwrap().unwrap();
    let split_loss = split.mean_loss().unwrap().unwrap();
    assert!((whole_loss - split_loss).abs() < 1e-6);
}

#[test]
fn unreached_branch_stays_cached_and_is_reported() {
    // x feeds both layer_0 and an auxiliary call; only layer_0's chain
    // reaches the output, so the auxiliary cache entry survives backward.
    let mut b = GraphBuilder::new();
    b.placeholder("x").unwrap();
    b.call_module("layer_0", "layers.0", vec![Arg::Node("x".into())])
        .unwrap();
    b.call_module("aux", "layers.0", vec![Arg::Node("x".into())])
        .unwrap();
    b.call_module("layer_1", "layers.1", vec![Arg::Node("layer_0".into())])
        .unwrap();
    b.output("out", "layer_1").unwrap();
    let graph = b.finish().unwrap();

    let registry = build_mlp_registry(&[6, 8, 2], 3).unwrap();
    let mesh = memory_mesh(1).remove(0);
    let mut runner = StageRunner::new(graph, registry, Arc::new(mesh), 1, None).unwrap();

    let x = deterministic_tensor(4, 6, 11, 1.0).unwrap();
    runner.run_forward_with(&[("x", &x)]).unwrap();

    let output = runner.collect_output().unwrap().expect("output");
    assert_eq!(output.dims(), &[4, 2]);
    let seed = Tensor::ones((4, 2), DType::F32, output.device()).unwrap();
    runner.seed_output_grad(0, seed);
    runner.run_backward().unwrap();

    assert_eq!(runner.cache_entries(0), 1);
    assert!(runner.param_grads().contains_key("layers.0.weight"));
    assert!(runner.param_grads().contains_key("layers.1.weight"));
}
