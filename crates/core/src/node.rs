use serde::{Deserialize, Serialize};

use crate::codegen::{CodegenOutput, KernelArgument};
use crate::error::Status;
use crate::types::{
    DataObject, ImageObject, ParameterKind, ScalarValue, TensorDescriptor, TensorObject,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterState {
    Required,
    Optional,
}

/// One positional slot of a kernel's parameter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub index: usize,
    pub direction: ParameterDirection,
    pub kind: ParameterKind,
    pub state: ParameterState,
}

impl ParameterSpec {
    pub fn is_required(&self) -> bool {
        self.state == ParameterState::Required
    }

    pub fn is_output(&self) -> bool {
        self.direction == ParameterDirection::Output
    }
}

/// Output meta slot; validation publishes the resolved output shape here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaFormat {
    pub tensor: Option<TensorDescriptor>,
}

impl MetaFormat {
    pub fn set_tensor(&mut self, descriptor: TensorDescriptor) {
        self.tensor = Some(descriptor);
    }
}

/// Bitmask over the execution backends a kernel can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TargetAffinity(u32);

impl TargetAffinity {
    pub const CPU: Self = Self(0x1);
    pub const GPU: Self = Self(0x2);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Self::CPU) {
            names.push("cpu");
        }
        if self.contains(Self::GPU) {
            names.push("gpu");
        }
        names
    }
}

/// Execution backend assigned to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Cpu,
    Gpu,
}

impl Target {
    pub fn affinity(&self) -> TargetAffinity {
        match self {
            Self::Cpu => TargetAffinity::CPU,
            Self::Gpu => TargetAffinity::GPU,
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Cpu => Self::Gpu,
            Self::Gpu => Self::Cpu,
        }
    }
}

/// OpenCL driver generation reported by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverGeneration {
    OpenCl12,
    OpenCl20,
}

/// Identity of the node a callback is invoked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContext {
    pub graph_id: u64,
    pub node_index: usize,
    pub kernel_name: String,
}

/// Callbacks every kernel binds at publish time.
pub trait Kernel: Send + Sync {
    /// Check the parameter array and write the output metas.
    fn validate(
        &self,
        node: &NodeContext,
        params: &[DataObject],
        metas: &mut [MetaFormat],
    ) -> Result<(), Status>;

    fn query_target_support(
        &self,
        node: &NodeContext,
        driver: DriverGeneration,
    ) -> Result<TargetAffinity, Status>;

    /// Synthesize the accelerator program for a validated node.
    fn opencl_codegen(
        &self,
        node: &NodeContext,
        params: &[DataObject],
        load_phase: bool,
    ) -> Result<CodegenOutput, Status>;

    /// Runtime argument values for the generated entry point, in signature
    /// order.
    fn invocation_arguments(&self, _params: &[DataObject]) -> Result<Vec<KernelArgument>, Status> {
        Err(Status::NotSupported(
            "kernel does not describe its invocation arguments".to_string(),
        ))
    }

    /// Host execution entry point.
    fn execute(&self, node: &NodeContext, params: &mut [DataObject]) -> Result<(), Status>;
}

pub fn expect_image(params: &[DataObject], index: usize) -> Result<&ImageObject, Status> {
    match params.get(index) {
        Some(DataObject::Image(image)) => Ok(image),
        Some(other) => Err(Status::InvalidParameters(format!(
            "parameter {index} must be an image, got {:?}",
            other.kind()
        ))),
        None => Err(Status::InvalidParameters(format!(
            "parameter {index} is missing"
        ))),
    }
}

pub fn expect_tensor(params: &[DataObject], index: usize) -> Result<&TensorObject, Status> {
    match params.get(index) {
        Some(DataObject::Tensor(tensor)) => Ok(tensor),
        Some(other) => Err(Status::InvalidParameters(format!(
            "parameter {index} must be a tensor, got {:?}",
            other.kind()
        ))),
        None => Err(Status::InvalidParameters(format!(
            "parameter {index} is missing"
        ))),
    }
}

pub fn expect_tensor_mut(
    params: &mut [DataObject],
    index: usize,
) -> Result<&mut TensorObject, Status> {
    match params.get_mut(index) {
        Some(DataObject::Tensor(tensor)) => Ok(tensor),
        Some(other) => Err(Status::InvalidParameters(format!(
            "parameter {index} must be a tensor, got {:?}",
            other.kind()
        ))),
        None => Err(Status::InvalidParameters(format!(
            "parameter {index} is missing"
        ))),
    }
}

pub fn expect_scalar(params: &[DataObject], index: usize) -> Result<ScalarValue, Status> {
    match params.get(index) {
        Some(DataObject::Scalar(value)) => Ok(*value),
        Some(other) => Err(Status::InvalidParameters(format!(
            "parameter {index} must be a scalar, got {:?}",
            other.kind()
        ))),
        None => Err(Status::InvalidParameters(format!(
            "parameter {index} is missing"
        ))),
    }
}
