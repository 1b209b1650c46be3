//! Host-side graph used to drive published kernels: it owns the data
//! objects, orders nodes by their data dependencies, runs each kernel's
//! validation, and assigns targets. It also caches the generated
//! accelerator programs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codegen::{CodegenOutput, KernelArgument};
use crate::config::PluginConfig;
use crate::error::Status;
use crate::node::{DriverGeneration, MetaFormat, NodeContext, ParameterSpec, Target, TargetAffinity};
use crate::registry::{publish_kernels, KernelDescriptor, KernelId, KernelRegistry};
use crate::types::{
    DataObject, ImageDescriptor, ImageObject, ScalarValue, TensorDescriptor, TensorObject,
};

/// Owner of the kernel registry. Graphs hold a weak handle to it.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    registry: KernelRegistry,
    config: PluginConfig,
    released: AtomicBool,
    next_graph_id: AtomicU64,
}

impl Context {
    pub fn new(registry: KernelRegistry, config: PluginConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                registry,
                config,
                released: AtomicBool::new(false),
                next_graph_id: AtomicU64::new(1),
            }),
        }
    }

    /// Context with every kernel of this crate published.
    pub fn with_published_kernels(config: PluginConfig) -> Result<Self, Status> {
        let mut registry = KernelRegistry::new();
        publish_kernels(&mut registry, &config)?;
        Ok(Self::new(registry, config))
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &PluginConfig {
        &self.inner.config
    }

    /// Invalidate the context; graphs created from it stop accepting nodes.
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn create_graph(&self) -> Graph {
        Graph::new(self)
    }
}

/// Handle to a data object owned by a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DataRef(usize);

/// Handle to a node owned by a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeHandle(usize);

impl NodeHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Verified accelerator program of a node plus its runtime arguments.
#[derive(Debug, Clone, Serialize)]
pub struct NodeProgram<'a> {
    #[serde(flatten)]
    pub output: &'a CodegenOutput,
    pub arguments: Vec<KernelArgument>,
}

/// Shape-relevant state of a parameter; a change forces regeneration.
#[derive(Debug, Clone, PartialEq)]
enum ObjectKey {
    Image {
        descriptor: ImageDescriptor,
        stride: usize,
        offset: usize,
    },
    Tensor(Option<TensorDescriptor>),
    Scalar(ScalarValue),
}

impl ObjectKey {
    fn of(object: &DataObject) -> Self {
        match object {
            DataObject::Image(image) => Self::Image {
                descriptor: image.descriptor,
                stride: image.stride,
                offset: image.offset,
            },
            DataObject::Tensor(tensor) => Self::Tensor(tensor.descriptor.clone()),
            DataObject::Scalar(value) => Self::Scalar(*value),
        }
    }
}

#[derive(Debug)]
struct CachedProgram {
    key: Vec<ObjectKey>,
    output: CodegenOutput,
}

#[derive(Debug)]
struct NodeRecord {
    kernel: Arc<KernelDescriptor>,
    bindings: Vec<Option<DataRef>>,
    target: Option<Target>,
    program: Option<CachedProgram>,
}

impl NodeRecord {
    fn slots(&self) -> impl Iterator<Item = (&ParameterSpec, Option<DataRef>)> {
        self.kernel
            .parameters()
            .iter()
            .zip(self.bindings.iter().copied())
    }
}

#[derive(Debug)]
pub struct Graph {
    id: u64,
    context: Weak<ContextInner>,
    objects: Vec<DataObject>,
    nodes: Vec<NodeRecord>,
    preferred_target: Target,
    driver: DriverGeneration,
    order: Vec<usize>,
    verified: bool,
}

impl Graph {
    pub fn new(context: &Context) -> Self {
        Self {
            id: context.inner.next_graph_id.fetch_add(1, Ordering::Relaxed),
            context: Arc::downgrade(&context.inner),
            objects: Vec::new(),
            nodes: Vec::new(),
            preferred_target: context.config().graph.preferred_target,
            driver: DriverGeneration::OpenCl20,
            order: Vec::new(),
            verified: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn live_context(&self) -> Result<Arc<ContextInner>, Status> {
        let inner = self
            .context
            .upgrade()
            .ok_or_else(|| Status::InvalidContext("context has been dropped".to_string()))?;
        if inner.released.load(Ordering::SeqCst) {
            return Err(Status::InvalidContext(
                "context has been released".to_string(),
            ));
        }
        Ok(inner)
    }

    pub fn set_preferred_target(&mut self, target: Target) {
        self.preferred_target = target;
        self.verified = false;
    }

    pub fn set_driver_generation(&mut self, driver: DriverGeneration) {
        self.driver = driver;
        self.verified = false;
    }

    pub fn add_object(&mut self, object: DataObject) -> DataRef {
        self.objects.push(object);
        self.verified = false;
        DataRef(self.objects.len() - 1)
    }

    pub fn create_image(&mut self, descriptor: ImageDescriptor) -> DataRef {
        self.add_object(DataObject::Image(ImageObject::new(descriptor)))
    }

    /// Image backed by a tightly packed host buffer.
    pub fn create_image_with_data(
        &mut self,
        descriptor: ImageDescriptor,
        data: Vec<u8>,
    ) -> Result<DataRef, Status> {
        let required = descriptor
            .packed_stride()
            .checked_mul(descriptor.height as usize);
        if !matches!(required, Some(required) if data.len() >= required) {
            return Err(Status::InvalidValue(format!(
                "{}x{} {:?} image needs {} bytes, got {}",
                descriptor.width,
                descriptor.height,
                descriptor.format,
                required.map_or_else(|| "more than usize::MAX".to_string(), |r| r.to_string()),
                data.len()
            )));
        }
        Ok(self.add_object(DataObject::Image(ImageObject::with_data(descriptor, data))))
    }

    pub fn create_tensor(&mut self, descriptor: TensorDescriptor) -> DataRef {
        self.add_object(DataObject::Tensor(TensorObject::new(descriptor)))
    }

    /// Tensor whose shape is resolved by the node that writes it.
    pub fn create_virtual_tensor(&mut self) -> DataRef {
        self.add_object(DataObject::Tensor(TensorObject::virtual_tensor()))
    }

    pub fn create_scalar(&mut self, value: ScalarValue) -> DataRef {
        self.add_object(DataObject::Scalar(value))
    }

    pub fn object(&self, data: DataRef) -> Option<&DataObject> {
        self.objects.get(data.0)
    }

    pub fn tensor(&self, data: DataRef) -> Option<&TensorObject> {
        match self.objects.get(data.0) {
            Some(DataObject::Tensor(tensor)) => Some(tensor),
            _ => None,
        }
    }

    pub fn set_tensor_descriptor(
        &mut self,
        data: DataRef,
        descriptor: TensorDescriptor,
    ) -> Result<(), Status> {
        match self.objects.get_mut(data.0) {
            Some(DataObject::Tensor(tensor)) => {
                tensor.descriptor = Some(descriptor);
                tensor.data = None;
                self.verified = false;
                Ok(())
            }
            Some(other) => Err(Status::InvalidParameters(format!(
                "data object {} is {:?}, not a tensor",
                data.0,
                other.kind()
            ))),
            None => Err(unknown_object(data)),
        }
    }

    pub fn set_scalar(&mut self, data: DataRef, value: ScalarValue) -> Result<(), Status> {
        match self.objects.get_mut(data.0) {
            Some(DataObject::Scalar(scalar)) => {
                *scalar = value;
                self.verified = false;
                Ok(())
            }
            Some(other) => Err(Status::InvalidParameters(format!(
                "data object {} is {:?}, not a scalar",
                data.0,
                other.kind()
            ))),
            None => Err(unknown_object(data)),
        }
    }

    /// Instantiate `kernel` and bind `params` to its leading parameter slots.
    pub fn create_node(&mut self, kernel: KernelId, params: &[DataRef]) -> Result<NodeHandle, Status> {
        let context = self.live_context()?;
        let descriptor = context.registry.get_by_id(kernel).ok_or_else(|| {
            Status::InvalidValue(format!("no kernel registered with id {kernel}"))
        })?;

        if params.len() > descriptor.parameters().len() {
            return Err(Status::InvalidParameters(format!(
                "kernel '{}' takes {} parameters, got {}",
                descriptor.name(),
                descriptor.parameters().len(),
                params.len()
            )));
        }

        let mut bindings = vec![None; descriptor.parameters().len()];
        for (spec, data) in descriptor.parameters().iter().zip(params) {
            self.check_binding(spec, *data)?;
            bindings[spec.index] = Some(*data);
        }

        debug!(graph = self.id, kernel = descriptor.name(), "created node");
        self.nodes.push(NodeRecord {
            kernel: descriptor,
            bindings,
            target: None,
            program: None,
        });
        self.verified = false;
        Ok(NodeHandle(self.nodes.len() - 1))
    }

    pub fn set_parameter(&mut self, node: NodeHandle, index: usize, data: DataRef) -> Result<(), Status> {
        let record = self.nodes.get(node.0).ok_or_else(|| unknown_node(node))?;
        let spec = *record.kernel.parameters().get(index).ok_or_else(|| {
            Status::InvalidParameters(format!(
                "kernel '{}' has no parameter {index}",
                record.kernel.name()
            ))
        })?;
        self.check_binding(&spec, data)?;

        if let Some(record) = self.nodes.get_mut(node.0) {
            record.bindings[index] = Some(data);
        }
        self.verified = false;
        Ok(())
    }

    fn check_binding(&self, spec: &ParameterSpec, data: DataRef) -> Result<(), Status> {
        let object = self.objects.get(data.0).ok_or_else(|| unknown_object(data))?;
        if object.kind() != spec.kind {
            return Err(Status::InvalidParameters(format!(
                "parameter {} expects {:?}, got {:?}",
                spec.index,
                spec.kind,
                object.kind()
            )));
        }
        Ok(())
    }

    fn node_context(&self, index: usize) -> NodeContext {
        NodeContext {
            graph_id: self.id,
            node_index: index,
            kernel_name: self.nodes[index].kernel.name().to_string(),
        }
    }

    /// Snapshot of a node's bound parameters. Unbound optional slots may
    /// only trail the bound ones.
    fn gather_params(&self, index: usize) -> Result<Vec<DataObject>, Status> {
        let record = &self.nodes[index];
        let mut params = Vec::with_capacity(record.bindings.len());
        let mut first_gap = None;

        for (spec, binding) in record.slots() {
            match binding {
                Some(data) => {
                    if let Some(gap) = first_gap {
                        return Err(Status::InvalidParameters(format!(
                            "node {index} leaves optional parameter {gap} unbound before parameter {}",
                            spec.index
                        )));
                    }
                    let object = self.objects.get(data.0).ok_or_else(|| unknown_object(data))?;
                    params.push(object.clone());
                }
                None if spec.is_required() => {
                    return Err(Status::InvalidParameters(format!(
                        "node {index} ({}) is missing required parameter {}",
                        record.kernel.name(),
                        spec.index
                    )));
                }
                None => {
                    first_gap.get_or_insert(spec.index);
                }
            }
        }

        Ok(params)
    }

    /// Node indices ordered so that every writer runs before its readers.
    pub fn execution_order(&self) -> Result<Vec<usize>, Status> {
        let mut dag: StableDiGraph<usize, DataRef> = StableDiGraph::new();
        let indices: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| dag.add_node(i)).collect();

        let mut writers: HashMap<DataRef, usize> = HashMap::new();
        for (node_index, record) in self.nodes.iter().enumerate() {
            for (_, data) in record.slots().filter(|(spec, _)| spec.is_output()) {
                let Some(data) = data else { continue };
                if let Some(previous) = writers.insert(data, node_index) {
                    return Err(Status::InvalidGraph(format!(
                        "data object {} is written by nodes {previous} and {node_index}",
                        data.0
                    )));
                }
            }
        }

        for (node_index, record) in self.nodes.iter().enumerate() {
            for (_, data) in record.slots().filter(|(spec, _)| !spec.is_output()) {
                let Some(data) = data else { continue };
                if let Some(&writer) = writers.get(&data) {
                    dag.add_edge(indices[writer], indices[node_index], data);
                }
            }
        }

        let order = toposort(&dag, None).map_err(|cycle| {
            Status::InvalidGraph(format!("cycle detected at node {}", dag[cycle.node_id()]))
        })?;
        Ok(order.into_iter().map(|idx| dag[idx]).collect())
    }

    /// Validate every node, resolve output shapes, assign targets and
    /// generate accelerator programs.
    pub fn verify(&mut self) -> Result<(), Status> {
        self.verified = false;
        match self.verify_nodes() {
            Ok(order) => {
                info!(graph = self.id, nodes = order.len(), "graph verified");
                self.order = order;
                self.verified = true;
                Ok(())
            }
            Err(err) => {
                warn!(graph = self.id, code = err.code(), "graph verification failed: {err}");
                Err(err)
            }
        }
    }

    fn verify_nodes(&mut self) -> Result<Vec<usize>, Status> {
        self.live_context()?;
        let order = self.execution_order()?;

        for &index in &order {
            let node = self.node_context(index);
            let kernel = Arc::clone(&self.nodes[index].kernel);

            let params = self.gather_params(index)?;
            let mut metas = vec![MetaFormat::default(); params.len()];
            kernel.callbacks().validate(&node, &params, &mut metas)?;
            self.apply_metas(index, &metas)?;

            let affinity = kernel.callbacks().query_target_support(&node, self.driver)?;
            let target = select_target(affinity, self.preferred_target).ok_or_else(|| {
                Status::NotSupported(format!(
                    "kernel '{}' advertises no supported target",
                    kernel.name()
                ))
            })?;
            debug!(
                graph = self.id,
                node = index,
                kernel = kernel.name(),
                ?target,
                "assigned target"
            );

            match target {
                Target::Gpu => self.ensure_program(index, &node)?,
                Target::Cpu => self.nodes[index].program = None,
            }
            self.nodes[index].target = Some(target);
        }

        Ok(order)
    }

    fn apply_metas(&mut self, index: usize, metas: &[MetaFormat]) -> Result<(), Status> {
        let updates: Vec<(DataRef, TensorDescriptor)> = self.nodes[index]
            .slots()
            .zip(metas)
            .filter_map(|((spec, binding), meta)| {
                if !spec.is_output() {
                    return None;
                }
                Some((binding?, meta.tensor.clone()?))
            })
            .collect();

        for (data, descriptor) in updates {
            match self.objects.get_mut(data.0) {
                Some(DataObject::Tensor(tensor)) => {
                    if tensor.descriptor.as_ref() != Some(&descriptor) {
                        debug!(object = data.0, dims = ?descriptor.dims, "resolved tensor shape");
                        tensor.descriptor = Some(descriptor);
                        tensor.data = None;
                    }
                }
                Some(other) => {
                    return Err(Status::InvalidParameters(format!(
                        "node {index} published a tensor meta for a {:?} object",
                        other.kind()
                    )))
                }
                None => return Err(unknown_object(data)),
            }
        }
        Ok(())
    }

    fn ensure_program(&mut self, index: usize, node: &NodeContext) -> Result<(), Status> {
        let params = self.gather_params(index)?;
        let key: Vec<ObjectKey> = params.iter().map(ObjectKey::of).collect();
        let record = &mut self.nodes[index];

        if record.program.as_ref().is_some_and(|cached| cached.key == key) {
            debug!(graph = node.graph_id, node = index, "reusing generated program");
            return Ok(());
        }

        let output = record.kernel.callbacks().opencl_codegen(node, &params, false)?;
        debug!(
            graph = node.graph_id,
            node = index,
            entry_point = %output.entry_point,
            work_items = output.work_items(),
            "generated program"
        );
        record.program = Some(CachedProgram { key, output });
        Ok(())
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn node_target(&self, node: NodeHandle) -> Option<Target> {
        self.nodes.get(node.0).and_then(|record| record.target)
    }

    /// Generated program of an accelerator node in a verified graph.
    pub fn program(&self, node: NodeHandle) -> Result<NodeProgram<'_>, Status> {
        if !self.verified {
            return Err(Status::InvalidGraph("graph has not been verified".to_string()));
        }
        let record = self.nodes.get(node.0).ok_or_else(|| unknown_node(node))?;
        let cached = record.program.as_ref().ok_or_else(|| {
            Status::NotSupported(format!(
                "node {} runs on the host and has no accelerator program",
                node.0
            ))
        })?;

        let params = self.gather_params(node.0)?;
        let arguments = record.kernel.callbacks().invocation_arguments(&params)?;
        Ok(NodeProgram {
            output: &cached.output,
            arguments,
        })
    }

    /// Run every node on the host. Verifies first when needed.
    ///
    /// Accelerator programs are only generated here, never dispatched, so a
    /// graph with any accelerator node fails before anything runs.
    pub fn process(&mut self) -> Result<(), Status> {
        if !self.verified {
            self.verify()?;
        }
        self.live_context()?;

        if let Some(&index) = self
            .order
            .iter()
            .find(|&&index| self.nodes[index].target == Some(Target::Gpu))
        {
            return Err(Status::NotSupported(format!(
                "node {index} ({}) is assigned to the accelerator; dispatch its program on a device runtime",
                self.nodes[index].kernel.name()
            )));
        }

        for index in self.order.clone() {
            let node = self.node_context(index);
            let kernel = Arc::clone(&self.nodes[index].kernel);
            let mut params = self.gather_params(index)?;
            kernel.callbacks().execute(&node, &mut params)?;
            self.write_back(index, params);
        }

        info!(graph = self.id, nodes = self.order.len(), "graph processed on host");
        Ok(())
    }

    fn write_back(&mut self, index: usize, params: Vec<DataObject>) {
        let written: Vec<(DataRef, DataObject)> = self.nodes[index]
            .slots()
            .zip(params)
            .filter_map(|((spec, binding), object)| {
                if !spec.is_output() {
                    return None;
                }
                Some((binding?, object))
            })
            .collect();

        for (data, object) in written {
            if let Some(slot) = self.objects.get_mut(data.0) {
                *slot = object;
            }
        }
    }
}

/// Preferred target when advertised, otherwise the other one.
fn select_target(affinity: TargetAffinity, preferred: Target) -> Option<Target> {
    [preferred, preferred.other()]
        .into_iter()
        .find(|target| affinity.contains(target.affinity()))
}

fn unknown_object(data: DataRef) -> Status {
    Status::InvalidParameters(format!("unknown data object {}", data.0))
}

fn unknown_node(node: NodeHandle) -> Status {
    Status::InvalidParameters(format!("unknown node {}", node.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    use crate::node::{expect_scalar, expect_tensor, expect_tensor_mut, Kernel, ParameterDirection, ParameterState};
    use crate::registry::KernelBuilder;
    use crate::types::{DataType, ParameterKind, PixelFormat};

    const FILL_ID: KernelId = KernelId(0x10);
    const COPY_ID: KernelId = KernelId(0x11);

    /// Writes a `[2, 2, 1, 1]` tensor filled with the optional scalar.
    struct FillKernel;

    impl Kernel for FillKernel {
        fn validate(
            &self,
            _node: &NodeContext,
            _params: &[DataObject],
            metas: &mut [MetaFormat],
        ) -> Result<(), Status> {
            metas[0].set_tensor(TensorDescriptor::new([2, 2, 1, 1], DataType::Float32));
            Ok(())
        }

        fn query_target_support(
            &self,
            _node: &NodeContext,
            _driver: DriverGeneration,
        ) -> Result<TargetAffinity, Status> {
            Ok(TargetAffinity::CPU)
        }

        fn opencl_codegen(
            &self,
            _node: &NodeContext,
            _params: &[DataObject],
            _load_phase: bool,
        ) -> Result<CodegenOutput, Status> {
            Err(Status::NotSupported("host only".to_string()))
        }

        fn execute(&self, _node: &NodeContext, params: &mut [DataObject]) -> Result<(), Status> {
            let value = match expect_scalar(params, 1) {
                Ok(ScalarValue::Float32(v)) => v,
                _ => 1.0,
            };
            expect_tensor_mut(params, 0)?.data = Some(Array4::from_elem((1, 1, 2, 2), value));
            Ok(())
        }
    }

    /// Copies its input tensor to its output tensor.
    struct CopyKernel;

    impl Kernel for CopyKernel {
        fn validate(
            &self,
            _node: &NodeContext,
            params: &[DataObject],
            metas: &mut [MetaFormat],
        ) -> Result<(), Status> {
            let input = expect_tensor(params, 0)?.descriptor.clone().ok_or_else(|| {
                Status::InvalidDimension("input is unresolved".to_string())
            })?;
            metas[1].set_tensor(input);
            Ok(())
        }

        fn query_target_support(
            &self,
            _node: &NodeContext,
            _driver: DriverGeneration,
        ) -> Result<TargetAffinity, Status> {
            Ok(TargetAffinity::CPU)
        }

        fn opencl_codegen(
            &self,
            _node: &NodeContext,
            _params: &[DataObject],
            _load_phase: bool,
        ) -> Result<CodegenOutput, Status> {
            Err(Status::NotSupported("host only".to_string()))
        }

        fn execute(&self, _node: &NodeContext, params: &mut [DataObject]) -> Result<(), Status> {
            let data = expect_tensor(params, 0)?.data.clone();
            expect_tensor_mut(params, 1)?.data = data;
            Ok(())
        }
    }

    fn test_context() -> Context {
        let mut registry = KernelRegistry::new();
        let fill = KernelBuilder::new("test.fill", FILL_ID, 2, Arc::new(FillKernel))
            .parameter(0, ParameterDirection::Output, ParameterKind::Tensor, ParameterState::Required)
            .and_then(|b| {
                b.parameter(1, ParameterDirection::Input, ParameterKind::Scalar, ParameterState::Optional)
            })
            .and_then(KernelBuilder::finalize)
            .expect("fill kernel should finalize");
        let copy = KernelBuilder::new("test.copy", COPY_ID, 2, Arc::new(CopyKernel))
            .parameter(0, ParameterDirection::Input, ParameterKind::Tensor, ParameterState::Required)
            .and_then(|b| {
                b.parameter(1, ParameterDirection::Output, ParameterKind::Tensor, ParameterState::Required)
            })
            .and_then(KernelBuilder::finalize)
            .expect("copy kernel should finalize");
        registry.register(fill).unwrap();
        registry.register(copy).unwrap();
        Context::new(registry, PluginConfig::default())
    }

    #[test]
    fn test_execution_order_follows_data_dependencies() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let a = graph.create_virtual_tensor();
        let b = graph.create_virtual_tensor();

        let copy = graph.create_node(COPY_ID, &[a, b]).unwrap();
        let fill = graph.create_node(FILL_ID, &[a]).unwrap();

        assert_eq!(graph.execution_order().unwrap(), vec![fill.index(), copy.index()]);

        graph.verify().expect("graph should verify");
        assert_eq!(
            graph.tensor(b).and_then(|t| t.descriptor.clone()),
            Some(TensorDescriptor::new([2, 2, 1, 1], DataType::Float32))
        );
        assert_eq!(graph.node_target(copy), Some(Target::Cpu));
    }

    #[test]
    fn test_process_runs_host_nodes_in_order() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let a = graph.create_virtual_tensor();
        let b = graph.create_virtual_tensor();
        let value = graph.create_scalar(ScalarValue::Float32(3.0));

        graph.create_node(COPY_ID, &[a, b]).unwrap();
        graph.create_node(FILL_ID, &[a, value]).unwrap();
        graph.process().expect("host graph should process");

        let out = graph.tensor(b).and_then(|t| t.data.clone()).expect("output filled");
        assert!(out.iter().all(|v| *v == 3.0));
        assert!(graph.is_verified());
    }

    #[test]
    fn test_image_buffer_size_overflow_rejected() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let descriptor = ImageDescriptor::new(u32::MAX, u32::MAX, PixelFormat::Rgb);
        let err = graph.create_image_with_data(descriptor, vec![0; 12]).unwrap_err();
        assert!(matches!(err, Status::InvalidValue(_)), "{err:?}");

        let err = graph
            .create_image_with_data(ImageDescriptor::new(2, 2, PixelFormat::Rgb), vec![0; 11])
            .unwrap_err();
        assert!(err.to_string().contains("needs 12 bytes, got 11"), "{err}");
    }

    #[test]
    fn test_multiple_writers_rejected() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let a = graph.create_virtual_tensor();
        graph.create_node(FILL_ID, &[a]).unwrap();
        graph.create_node(FILL_ID, &[a]).unwrap();

        let err = graph.verify().unwrap_err();
        assert!(matches!(err, Status::InvalidGraph(_)));
        assert!(!graph.is_verified());
    }

    #[test]
    fn test_cycle_rejected() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let a = graph.create_virtual_tensor();
        let b = graph.create_virtual_tensor();
        graph.create_node(COPY_ID, &[a, b]).unwrap();
        graph.create_node(COPY_ID, &[b, a]).unwrap();

        let err = graph.execution_order().unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn test_missing_required_parameter_rejected() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let a = graph.create_virtual_tensor();
        graph.create_node(COPY_ID, &[a]).unwrap();

        let err = graph.verify().unwrap_err();
        assert_eq!(
            err,
            Status::InvalidParameters("node 0 (test.copy) is missing required parameter 1".to_string())
        );
    }

    #[test]
    fn test_binding_kind_mismatch_rejected() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let scalar = graph.create_scalar(ScalarValue::Uint32(0));
        let err = graph.create_node(FILL_ID, &[scalar]).unwrap_err();
        assert_eq!(
            err,
            Status::InvalidParameters("parameter 0 expects Tensor, got Scalar".to_string())
        );

        let tensor = graph.create_virtual_tensor();
        let node = graph.create_node(FILL_ID, &[tensor]).unwrap();
        assert!(graph.set_parameter(node, 1, tensor).is_err());
        assert!(graph.set_parameter(node, 2, scalar).is_err());
        assert!(graph.set_parameter(node, 1, scalar).is_ok());
    }

    #[test]
    fn test_unknown_kernel_and_too_many_params() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let a = graph.create_virtual_tensor();
        assert!(matches!(
            graph.create_node(KernelId(0x99), &[a]),
            Err(Status::InvalidValue(_))
        ));
        assert!(matches!(
            graph.create_node(FILL_ID, &[a, a, a]),
            Err(Status::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_released_or_dropped_context_rejects_nodes() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let a = graph.create_virtual_tensor();
        ctx.release();
        let err = graph.create_node(FILL_ID, &[a]).unwrap_err();
        assert_eq!(err.code(), -12);

        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let a = graph.create_virtual_tensor();
        drop(ctx);
        assert!(matches!(
            graph.create_node(FILL_ID, &[a]),
            Err(Status::InvalidContext(_))
        ));
    }

    #[test]
    fn test_select_target_prefers_then_falls_back() {
        let both = TargetAffinity::CPU.union(TargetAffinity::GPU);
        assert_eq!(select_target(both, Target::Gpu), Some(Target::Gpu));
        assert_eq!(select_target(both, Target::Cpu), Some(Target::Cpu));
        assert_eq!(select_target(TargetAffinity::GPU, Target::Cpu), Some(Target::Gpu));
        assert_eq!(select_target(TargetAffinity::default(), Target::Gpu), None);
    }

    #[test]
    fn test_program_requires_verified_accelerator_node() {
        let ctx = test_context();
        let mut graph = ctx.create_graph();
        let a = graph.create_virtual_tensor();
        let fill = graph.create_node(FILL_ID, &[a]).unwrap();

        assert!(matches!(graph.program(fill), Err(Status::InvalidGraph(_))));
        graph.verify().unwrap();
        assert!(matches!(graph.program(fill), Err(Status::NotSupported(_))));
    }
}
