use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Var;

use crate::error::{PipelineError, Result};
use crate::value::Value;

/// A named submodule callable from a submodule-call node. Implementations
/// hold their parameters as candle `Var`s registered alongside them, so the
/// stage backward can read parameter gradients out of the grad store.
pub trait CallableModule: Send + Sync {
    fn call(&self, args: &[Value]) -> Result<Value>;
}

/// A free function callable from a function-call node. Pure: no backward
/// state beyond what its tensor inputs already track.
pub type GraphFunction = fn(&[Value]) -> Result<Value>;

/// Explicit registry standing in for attribute-path reflection: every dotted
/// path a graph can name is bound to a strongly-typed handle at
/// construction time. Built once, then read-only.
pub struct ModuleRegistry {
    submodules: HashMap<String, Arc<dyn CallableModule>>,
    params: HashMap<String, Var>,
    functions: HashMap<String, GraphFunction>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            submodules: HashMap::new(),
            params: HashMap::new(),
            functions: HashMap::new(),
        };
        reg.functions.insert("add".into(), builtin_add);
        reg.functions.insert("mul".into(), builtin_mul);
        reg.functions.insert("matmul".into(), builtin_matmul);
        reg.functions.insert("cat".into(), builtin_cat);
        reg.functions.insert("slice_rows".into(), builtin_slice_rows);
        reg
    }

    pub fn register_module(&mut self, path: &str, module: Arc<dyn CallableModule>) {
        self.submodules.insert(path.to_string(), module);
    }

    pub fn register_param(&mut self, path: &str, var: Var) {
        self.params.insert(path.to_string(), var);
    }

    pub fn register_function(&mut self, name: &str, f: GraphFunction) {
        self.functions.insert(name.to_string(), f);
    }

    pub fn submodule(&self, path: &str) -> Result<&Arc<dyn CallableModule>> {
        self.submodules
            .get(path)
            .ok_or_else(|| PipelineError::Reference(format!("no submodule registered at '{path}'")))
    }

    pub fn param(&self, path: &str) -> Result<&Var> {
        self.params
            .get(path)
            .ok_or_else(|| PipelineError::Reference(format!("no parameter registered at '{path}'")))
    }

    pub fn function(&self, name: &str) -> Result<GraphFunction> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::Reference(format!("no function registered as '{name}'")))
    }

    /// All registered parameters. Each rank only registers the parameters of
    /// the stages it hosts, so this is the optimizer's working set.
    pub fn params(&self) -> impl Iterator<Item = (&String, &Var)> {
        self.params.iter()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch for method-call nodes: the receiver is the first resolved
/// argument, the remainder are the method's own arguments.
pub fn invoke_method(target: &str, recv: &Value, rest: &[Value]) -> Result<Value> {
    let t = recv.expect_tensor(&format!("method '{target}' receiver"))?;
    let out = match target {
        "relu" => t.relu()?,
        "t" => t.t()?,
        "contiguous" => t.contiguous()?,
        "transpose" => {
            let d1 = int_arg(target, rest, 0)?;
            let d2 = int_arg(target, rest, 1)?;
            t.transpose(d1 as usize, d2 as usize)?
        }
        "reshape" => {
            let dims = dim_args(target, rest)?;
            t.reshape(resolve_reshape_dims(&dims, t.elem_count())?)?
        }
        "sum" => t.sum_all()?,
        "mean" => t.mean_all()?,
        other => {
            return Err(PipelineError::Reference(format!(
                "unsupported tensor method '{other}'"
            )))
        }
    };
    Ok(Value::Tensor(out))
}

fn int_arg(target: &str, rest: &[Value], idx: usize) -> Result<i64> {
    match rest.get(idx) {
        Some(Value::Int(i)) => Ok(*i),
        other => Err(PipelineError::Execution(format!(
            "method '{target}': argument {idx} must be an integer, got {other:?}"
        ))),
    }
}

/// Flattens integer and shape-like arguments into one dimension list, so
/// both `reshape(-1, n)` and `reshape(shape)` forms work.
fn dim_args(target: &str, rest: &[Value]) -> Result<Vec<i64>> {
    let mut dims = Vec::new();
    for v in rest {
        match v {
            Value::Int(i) => dims.push(*i),
            Value::Shape(s) => dims.extend(s.iter().map(|&d| d as i64)),
            Value::List(vs) | Value::Tuple(vs) => {
                for inner in vs {
                    match inner {
                        Value::Int(i) => dims.push(*i),
                        other => {
                            return Err(PipelineError::Execution(format!(
                                "method '{target}': non-integer dimension {other:?}"
                            )))
                        }
                    }
                }
            }
            other => {
                return Err(PipelineError::Execution(format!(
                    "method '{target}': non-integer dimension {other:?}"
                )))
            }
        }
    }
    Ok(dims)
}

/// Resolves at most one `-1` hole against the total element count.
fn resolve_reshape_dims(dims: &[i64], elem_count: usize) -> Result<Vec<usize>> {
    let holes = dims.iter().filter(|&&d| d == -1).count();
    if holes > 1 {
        return Err(PipelineError::Execution(
            "reshape: more than one -1 dimension".into(),
        ));
    }
    let known: usize = dims.iter().filter(|&&d| d != -1).map(|&d| d as usize).product();
    dims.iter()
        .map(|&d| {
            if d == -1 {
                if known == 0 || elem_count % known != 0 {
                    Err(PipelineError::Execution(format!(
                        "reshape: cannot infer -1 for {elem_count} elements over {dims:?}"
                    )))
                } else {
                    Ok(elem_count / known)
                }
            } else {
                Ok(d as usize)
            }
        })
        .collect()
}

fn binary_tensors<'a>(name: &str, args: &'a [Value]) -> Result<(&'a candle_core::Tensor, &'a candle_core::Tensor)> {
    match args {
        [a, b] => Ok((
            a.expect_tensor(&format!("function '{name}' lhs"))?,
            b.expect_tensor(&format!("function '{name}' rhs"))?,
        )),
        _ => Err(PipelineError::Execution(format!(
            "function '{name}' takes exactly two arguments, got {}",
            args.len()
        ))),
    }
}

fn builtin_add(args: &[Value]) -> Result<Value> {
    let (a, b) = binary_tensors("add", args)?;
    Ok(Value::Tensor(a.broadcast_add(b)?))
}

fn builtin_mul(args: &[Value]) -> Result<Value> {
    let (a, b) = binary_tensors("mul", args)?;
    Ok(Value::Tensor(a.broadcast_mul(b)?))
}

fn builtin_matmul(args: &[Value]) -> Result<Value> {
    let (a, b) = binary_tensors("matmul", args)?;
    Ok(Value::Tensor(a.matmul(b)?))
}

fn builtin_cat(args: &[Value]) -> Result<Value> {
    let tensors: Vec<&candle_core::Tensor> = args
        .iter()
        .map(|v| v.expect_tensor("function 'cat' argument"))
        .collect::<Result<_>>()?;
    if tensors.is_empty() {
        return Err(PipelineError::Execution("function 'cat': no arguments".into()));
    }
    Ok(Value::Tensor(candle_core::Tensor::cat(&tensors, 0)?))
}

/// `slice_rows(x, y)` — the leading rows of `y`, as many as `x` has. The
/// positional-encoding slice wrapper of sequence models.
fn builtin_slice_rows(args: &[Value]) -> Result<Value> {
    let (x, y) = binary_tensors("slice_rows", args)?;
    let rows = x.dims().first().copied().ok_or_else(|| {
        PipelineError::Execution("function 'slice_rows': scalar first argument".into())
    })?;
    Ok(Value::Tensor(y.narrow(0, 0, rows)?))
}
