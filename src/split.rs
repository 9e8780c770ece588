//! Stage partitioning and boundary distribution.
//!
//! Rank 0 walks the node sequence once, cutting a boundary every
//! `floor(module_count / stages)` submodule-call nodes — whole layers are
//! the unit of granularity, not every IR node. The metadata is broadcast
//! verbatim so followers never recompute it and all ranks agree on
//! identical boundaries.

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::graph::{Graph, NodeId, OpKind};
use crate::transport::Messaging;

/// Ordered (stage-index, boundary-node-name) pairs, one per stage; the last
/// entry names the final node of the graph. Immutable for the whole run.
pub type RangeMetadata = Vec<(usize, String)>;

/// Splits `graph` into `stages` contiguous ranges by submodule-call count.
pub fn partition(graph: &Graph, stages: usize) -> Result<RangeMetadata> {
    if stages == 0 {
        return Err(PipelineError::Configuration("stage count must be at least 1".into()));
    }
    let module_count = graph
        .nodes()
        .filter(|n| n.op == OpKind::CallModule)
        .count();
    if module_count < stages {
        return Err(PipelineError::Configuration(format!(
            "model has {module_count} submodule calls, too few for {stages} non-empty stages"
        )));
    }

    let target = module_count / stages;
    debug!(
        nodes = graph.len(),
        stages, module_count, target, "partitioning node sequence"
    );

    let mut metadata: RangeMetadata = Vec::with_capacity(stages);
    let mut stage = 0usize;
    let mut seen = 0usize;
    let mut last_name = "";
    for node in graph.nodes() {
        if node.op == OpKind::CallModule {
            seen += 1;
        }
        if seen == target && stage < stages - 1 {
            metadata.push((stage, node.name.clone()));
            stage += 1;
            seen = 0;
        }
        last_name = &node.name;
    }
    // The walk can end short of the requested boundaries for small or uneven
    // models; the remainder of the graph becomes the final stage either way.
    if metadata.len() < stages {
        metadata.push((stage, last_name.to_string()));
    }
    Ok(metadata)
}

/// Resolves the half-open node range `[from, to]` owned by `rank`.
///
/// The first stage starts at the first input placeholder; every later stage
/// starts at the node immediately following the previous stage's boundary.
pub fn stage_range(graph: &Graph, metadata: &RangeMetadata, rank: usize) -> Result<(NodeId, NodeId)> {
    if rank >= metadata.len() {
        return Err(PipelineError::Configuration(format!(
            "rank {rank} has no entry in {}-stage metadata",
            metadata.len()
        )));
    }
    let from = if rank == 0 {
        graph
            .first_placeholder()
            .ok_or_else(|| PipelineError::Reference("graph has no placeholder node".into()))?
    } else {
        let boundary = graph.require(&metadata[rank - 1].1)?;
        graph.next(boundary).ok_or_else(|| {
            PipelineError::Reference(format!(
                "boundary '{}' is the last node; nothing left for rank {rank}",
                metadata[rank - 1].1
            ))
        })?
    };
    let to = graph.require(&metadata[rank].1)?;
    if from > to {
        return Err(PipelineError::Configuration(format!(
            "empty node range for rank {rank}: {from} > {to}"
        )));
    }
    Ok((from, to))
}

/// Logs the node span a rank owns, one line per node.
pub fn describe_range(graph: &Graph, metadata: &RangeMetadata, rank: usize) -> Result<()> {
    let (from, to) = stage_range(graph, metadata, rank)?;
    info!(
        rank,
        from = %graph.node(from).name,
        to = %graph.node(to).name,
        "stage range"
    );
    for id in from..=to {
        debug!(rank, node = %graph.node(id).name, op = ?graph.node(id).op, "owned node");
    }
    Ok(())
}

/// Distributes the partition metadata: rank 0 supplies it and sends one
/// frame to every follower; followers receive it verbatim. This is the one
/// collective of the run.
pub fn broadcast_metadata(mesh: &dyn Messaging, metadata: Option<RangeMetadata>) -> Result<RangeMetadata> {
    if mesh.rank() == 0 {
        let metadata = metadata.ok_or_else(|| {
            PipelineError::Configuration("rank 0 must supply the partition metadata".into())
        })?;
        let frame = encode_metadata(&metadata);
        for dst in 1..mesh.world_size() {
            mesh.send(dst, &frame)?;
        }
        info!(stages = metadata.len(), "partition metadata published");
        Ok(metadata)
    } else {
        let frame = mesh.recv(0)?;
        let metadata = decode_metadata(&frame)?;
        info!(rank = mesh.rank(), stages = metadata.len(), "partition metadata received");
        Ok(metadata)
    }
}

fn encode_metadata(metadata: &RangeMetadata) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(metadata.len() as u64).to_le_bytes());
    for (stage, name) in metadata {
        buf.extend_from_slice(&(*stage as u64).to_le_bytes());
        buf.extend_from_slice(&(name.len() as u64).to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
    }
    buf
}

fn decode_metadata(frame: &[u8]) -> Result<RangeMetadata> {
    let mut pos = 0usize;
    let mut word = |pos: &mut usize| -> Result<u64> {
        let end = *pos + 8;
        let bytes = frame
            .get(*pos..end)
            .ok_or_else(|| PipelineError::Encoding("metadata frame truncated".into()))?;
        *pos = end;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    };
    let count = word(&mut pos)? as usize;
    let mut metadata = Vec::with_capacity(count);
    for _ in 0..count {
        let stage = word(&mut pos)? as usize;
        let len = word(&mut pos)? as usize;
        let end = pos + len;
        let bytes = frame
            .get(pos..end)
            .ok_or_else(|| PipelineError::Encoding("metadata frame truncated".into()))?;
        pos = end;
        let name = String::from_utf8(bytes.to_vec())
            .map_err(|_| PipelineError::Encoding("metadata node name is not utf-8".into()))?;
        metadata.push((stage, name));
    }
    Ok(metadata)
}
