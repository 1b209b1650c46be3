//! Kernel descriptors: static metadata for every registered kernel.
//!
//! These summaries are a separate data path from the callbacks; they only
//! read the parameter contract and the advertised targets.

use serde::Serialize;

use crate::error::Status;
use crate::node::{DriverGeneration, NodeContext, ParameterSpec};
use crate::registry::{KernelDescriptor, KernelId, KernelRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct KernelSummary {
    pub name: String,
    /// Hex id, e.g. "0x00101003"
    pub id: KernelId,
    pub parameters: Vec<ParameterSummary>,
    /// "cpu", "gpu"
    pub targets: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSummary {
    pub index: usize,
    /// "input" or "output"
    pub direction: String,
    /// "image", "tensor", "scalar"
    pub kind: String,
    pub required: bool,
}

fn parameter_summary(spec: &ParameterSpec) -> ParameterSummary {
    ParameterSummary {
        index: spec.index,
        direction: format!("{:?}", spec.direction).to_ascii_lowercase(),
        kind: format!("{:?}", spec.kind).to_ascii_lowercase(),
        required: spec.is_required(),
    }
}

pub fn describe_kernel(kernel: &KernelDescriptor) -> Result<KernelSummary, Status> {
    let node = NodeContext {
        graph_id: 0,
        node_index: 0,
        kernel_name: kernel.name().to_string(),
    };
    let affinity = kernel
        .callbacks()
        .query_target_support(&node, DriverGeneration::OpenCl20)?;

    Ok(KernelSummary {
        name: kernel.name().to_string(),
        id: kernel.id(),
        parameters: kernel.parameters().iter().map(parameter_summary).collect(),
        targets: affinity.names(),
    })
}

/// Summaries of every registered kernel, sorted by name.
pub fn describe_kernels(registry: &KernelRegistry) -> Result<Vec<KernelSummary>, Status> {
    registry
        .list_kernels()
        .into_iter()
        .filter_map(|name| registry.get(name))
        .map(|kernel| describe_kernel(&kernel))
        .collect()
}
