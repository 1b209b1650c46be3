use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::config::PluginConfig;
use crate::error::Status;
use crate::kernels::image_to_tensor;
use crate::node::{Kernel, ParameterDirection, ParameterSpec, ParameterState};
use crate::types::ParameterKind;

pub const VENDOR_ID_AMD: u32 = 0x001;
pub const NN_EXTENSION_LIBRARY: u32 = 1;

/// Numeric kernel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u32);

impl KernelId {
    pub const fn base(vendor: u32, library: u32) -> Self {
        Self((vendor << 20) | (library << 12))
    }

    pub const fn offset(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Serialize for KernelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Finalized kernel: name, id, parameter contract and bound callbacks.
pub struct KernelDescriptor {
    name: String,
    id: KernelId,
    parameters: Vec<ParameterSpec>,
    callbacks: Arc<dyn Kernel>,
}

impl KernelDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn callbacks(&self) -> &dyn Kernel {
        self.callbacks.as_ref()
    }
}

impl fmt::Debug for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDescriptor")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Collects a kernel's parameter contract before it is finalized.
pub struct KernelBuilder {
    name: String,
    id: KernelId,
    num_params: usize,
    slots: Vec<Option<ParameterSpec>>,
    callbacks: Arc<dyn Kernel>,
}

impl KernelBuilder {
    pub fn new(name: &str, id: KernelId, num_params: usize, callbacks: Arc<dyn Kernel>) -> Self {
        Self {
            name: name.to_string(),
            id,
            num_params,
            slots: vec![None; num_params],
            callbacks,
        }
    }

    pub fn parameter(
        mut self,
        index: usize,
        direction: ParameterDirection,
        kind: ParameterKind,
        state: ParameterState,
    ) -> Result<Self, Status> {
        let num_params = self.num_params;
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            Status::Registration(format!(
                "parameter index {index} out of range for {num_params} parameters"
            ))
        })?;
        if slot.is_some() {
            return Err(Status::Registration(format!(
                "parameter {index} declared twice"
            )));
        }

        *slot = Some(ParameterSpec {
            index,
            direction,
            kind,
            state,
        });
        Ok(self)
    }

    pub fn finalize(self) -> Result<KernelDescriptor, Status> {
        if self.name.trim().is_empty() {
            return Err(Status::Registration("kernel name must not be empty".to_string()));
        }

        let mut parameters = Vec::with_capacity(self.num_params);
        for (index, slot) in self.slots.into_iter().enumerate() {
            let spec = slot.ok_or_else(|| {
                Status::Registration(format!(
                    "kernel '{}' parameter {index} was never declared",
                    self.name
                ))
            })?;
            parameters.push(spec);
        }

        Ok(KernelDescriptor {
            name: self.name,
            id: self.id,
            parameters,
            callbacks: self.callbacks,
        })
    }
}

/// Explicit kernel registry owned by a context.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Arc<KernelDescriptor>>,
    names_by_id: HashMap<KernelId, String>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: KernelDescriptor) -> Result<(), Status> {
        if self.kernels.contains_key(descriptor.name()) {
            return Err(Status::Registration(format!(
                "kernel '{}' is already registered",
                descriptor.name()
            )));
        }
        if let Some(existing) = self.names_by_id.get(&descriptor.id()) {
            return Err(Status::Registration(format!(
                "kernel id {} is already used by '{existing}'",
                descriptor.id()
            )));
        }

        debug!(kernel = descriptor.name(), id = %descriptor.id(), "registered kernel");
        self.names_by_id
            .insert(descriptor.id(), descriptor.name().to_string());
        self.kernels
            .insert(descriptor.name().to_string(), Arc::new(descriptor));
        Ok(())
    }

    /// Returns whether a kernel was removed; unknown names are not an error.
    pub fn unregister(&mut self, name: &str) -> bool {
        let Some(descriptor) = self.kernels.remove(name) else {
            return false;
        };
        self.names_by_id.remove(&descriptor.id());
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<KernelDescriptor>> {
        self.kernels.get(name).cloned()
    }

    pub fn get_by_id(&self, id: KernelId) -> Option<Arc<KernelDescriptor>> {
        let name = self.names_by_id.get(&id)?;
        self.get(name)
    }

    pub fn list_kernels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Publish every kernel of this module into `registry`.
pub fn publish_kernels(registry: &mut KernelRegistry, config: &PluginConfig) -> Result<(), Status> {
    image_to_tensor::publish(registry, config)?;
    info!(kernels = registry.list_kernels().len(), "published kernels");
    Ok(())
}

pub fn unpublish_kernels(registry: &mut KernelRegistry) {
    registry.unregister(image_to_tensor::KERNEL_NAME);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::CodegenOutput;
    use crate::node::{DriverGeneration, MetaFormat, NodeContext, TargetAffinity};
    use crate::types::DataObject;

    struct DummyKernel;

    impl Kernel for DummyKernel {
        fn validate(
            &self,
            _node: &NodeContext,
            _params: &[DataObject],
            _metas: &mut [MetaFormat],
        ) -> Result<(), Status> {
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
            Err(Status::NotSupported("dummy".to_string()))
        }

        fn execute(&self, _node: &NodeContext, _params: &mut [DataObject]) -> Result<(), Status> {
            Ok(())
        }
    }

    fn dummy(name: &str, id: u32) -> KernelDescriptor {
        KernelBuilder::new(name, KernelId(id), 1, Arc::new(DummyKernel))
            .parameter(
                0,
                ParameterDirection::Input,
                ParameterKind::Scalar,
                ParameterState::Required,
            )
            .and_then(KernelBuilder::finalize)
            .expect("dummy kernel should finalize")
    }

    #[test]
    fn test_kernel_id_base() {
        let id = KernelId::base(VENDOR_ID_AMD, NN_EXTENSION_LIBRARY).offset(0x003);
        assert_eq!(id.0, 0x0010_1003);
        assert_eq!(id.to_string(), "0x00101003");
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = KernelRegistry::new();
        registry.register(dummy("b.dummy", 2)).unwrap();
        registry.register(dummy("a.dummy", 1)).unwrap();

        assert_eq!(registry.list_kernels(), vec!["a.dummy", "b.dummy"]);
        assert_eq!(registry.get("a.dummy").unwrap().id(), KernelId(1));
        assert_eq!(registry.get_by_id(KernelId(2)).unwrap().name(), "b.dummy");
        assert!(registry.get_by_id(KernelId(3)).is_none());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = KernelRegistry::new();
        registry.register(dummy("a.dummy", 1)).unwrap();

        let err = registry.register(dummy("a.dummy", 9)).unwrap_err();
        assert_eq!(
            err,
            Status::Registration("kernel 'a.dummy' is already registered".to_string())
        );

        let err = registry.register(dummy("c.dummy", 1)).unwrap_err();
        assert_eq!(
            err,
            Status::Registration("kernel id 0x00000001 is already used by 'a.dummy'".to_string())
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = KernelRegistry::new();
        registry.register(dummy("a.dummy", 1)).unwrap();

        assert!(registry.unregister("a.dummy"));
        assert!(!registry.unregister("a.dummy"));
        assert!(registry.get_by_id(KernelId(1)).is_none());

        registry.register(dummy("a.dummy", 1)).unwrap();
        assert!(registry.get("a.dummy").is_some());
    }

    #[test]
    fn test_builder_rejects_incomplete_contract() {
        let err = KernelBuilder::new("x", KernelId(1), 2, Arc::new(DummyKernel))
            .parameter(
                0,
                ParameterDirection::Input,
                ParameterKind::Image,
                ParameterState::Required,
            )
            .and_then(KernelBuilder::finalize)
            .unwrap_err();
        assert_eq!(
            err,
            Status::Registration("kernel 'x' parameter 1 was never declared".to_string())
        );
    }

    #[test]
    fn test_builder_rejects_bad_indices() {
        let builder = KernelBuilder::new("x", KernelId(1), 1, Arc::new(DummyKernel));
        let err = builder
            .parameter(
                1,
                ParameterDirection::Input,
                ParameterKind::Image,
                ParameterState::Required,
            )
            .err()
            .expect("out of range index should fail");
        assert!(matches!(err, Status::Registration(_)));

        let err = KernelBuilder::new("x", KernelId(1), 1, Arc::new(DummyKernel))
            .parameter(
                0,
                ParameterDirection::Input,
                ParameterKind::Image,
                ParameterState::Required,
            )
            .and_then(|b| {
                b.parameter(
                    0,
                    ParameterDirection::Input,
                    ParameterKind::Image,
                    ParameterState::Required,
                )
            })
            .err()
            .expect("duplicate index should fail");
        assert_eq!(
            err,
            Status::Registration("parameter 0 declared twice".to_string())
        );
    }

    #[test]
    fn test_publish_and_unpublish_kernels() {
        let mut registry = KernelRegistry::new();
        publish_kernels(&mut registry, &PluginConfig::default()).unwrap();
        assert_eq!(registry.list_kernels(), vec![image_to_tensor::KERNEL_NAME]);

        let err = publish_kernels(&mut registry, &PluginConfig::default()).unwrap_err();
        assert!(matches!(err, Status::Registration(_)));

        unpublish_kernels(&mut registry);
        unpublish_kernels(&mut registry);
        assert!(registry.list_kernels().is_empty());
    }
}
