//! Convert an interleaved 3-byte image into a planar float32 tensor
//! `[width, height, channels, 1]`.
//!
//! The kernel is accelerator-only by default: the OpenCL program is
//! synthesized at graph verification from the resolved output shape and the
//! flag scalar. The host path is only advertised when `host.fallback` is on.

use std::sync::Arc;

use ndarray::Array4;
use tracing::debug;

use crate::codegen::{CodegenOutput, EntryPointName, KernelArgument, KernelTemplate, TemplateParams};
use crate::config::PluginConfig;
use crate::error::Status;
use crate::graph::{DataRef, Graph, NodeHandle};
use crate::node::{
    expect_image, expect_scalar, expect_tensor, expect_tensor_mut, DriverGeneration, Kernel,
    MetaFormat, NodeContext, ParameterDirection, ParameterState, TargetAffinity,
};
use crate::registry::{KernelBuilder, KernelId, KernelRegistry, NN_EXTENSION_LIBRARY, VENDOR_ID_AMD};
use crate::types::{
    ChannelOrder, DataObject, DataType, ImageDescriptor, ImageObject, ParameterKind, ScalarType,
    TensorDescriptor,
};

pub const KERNEL_NAME: &str = "com.amd.nn_extension.convert_image_to_tensor";
pub const KERNEL_ID: KernelId = KernelId::base(VENDOR_ID_AMD, NN_EXTENSION_LIBRARY).offset(0x003);
pub const ENTRY_POINT: &str = "image_to_tensor";
pub const NUM_PARAMS: usize = 3;

pub const PARAM_INPUT: usize = 0;
pub const PARAM_OUTPUT: usize = 1;
pub const PARAM_FLAGS: usize = 2;

/// Bytes read per source pixel.
pub const SOURCE_PIXEL_BYTES: usize = 3;

const SOURCE_TEMPLATE: KernelTemplate = KernelTemplate::new(concat!(
    "__kernel void {{entry_point}}(uint i0_width, uint i0_height, __global uchar * in, uint i0_stride, uint i0_offset, __global uchar * out, uint out_offset, uint4 stride, uint flip) \n",
    "{ \n",
    "     size_t id = get_global_id(0);\n",
    "     size_t i = id / {{channels}};\n",
    "     size_t c = id - i * {{channels}};\n",
    "     size_t y = i / {{width}};\n",
    "     size_t x = i - y * {{width}};\n",
    "     *(__global float *)&out[out_offset + c * stride.s2 + y * stride.s1 + x * stride.s0] = in[i0_offset + y * i0_stride + x * 3 + {{channel_offset}}];\n",
    " }\n",
));

/// Resolved `[width, height, channels, batch]` of the output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputShape {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub batch: usize,
}

impl OutputShape {
    /// Read a resolved descriptor; the channel count must be at least 1 and
    /// the element count must fit in `usize`.
    pub fn from_descriptor(descriptor: &TensorDescriptor) -> Result<Self, Status> {
        let [width, height, channels, batch] = descriptor.dims[..] else {
            return Err(Status::InvalidDimension(format!(
                "output tensor must have 4 dimensions, got {}",
                descriptor.rank()
            )));
        };
        if channels == 0 {
            return Err(Status::InvalidDimension(
                "output tensor channel count must be at least 1".to_string(),
            ));
        }

        let shape = Self {
            width,
            height,
            channels,
            batch,
        };
        shape.element_count()?;
        Ok(shape)
    }

    pub fn element_count(&self) -> Result<usize, Status> {
        self.width
            .checked_mul(self.height)
            .and_then(|count| count.checked_mul(self.channels))
            .and_then(|count| count.checked_mul(self.batch))
            .ok_or_else(|| {
                Status::InvalidDimension(format!(
                    "output tensor {}x{}x{}x{} is too large",
                    self.width, self.height, self.channels, self.batch
                ))
            })
    }
}

/// Check an (image, flag type, proposed output) triple and return the
/// resolved output descriptor `[width, height, channels, 1]` in float32.
///
/// The channel count is passed through from the proposal.
pub fn validate_conversion(
    image: &ImageDescriptor,
    flag_type: ScalarType,
    proposed: Option<&TensorDescriptor>,
) -> Result<TensorDescriptor, Status> {
    if flag_type != ScalarType::Uint32 {
        return Err(Status::InvalidType(format!(
            "flag scalar must be Uint32, got {flag_type:?}"
        )));
    }

    let proposed = proposed.ok_or_else(|| {
        Status::InvalidDimension("output tensor shape is unresolved".to_string())
    })?;
    if proposed.rank() != 4 {
        return Err(Status::InvalidDimension(format!(
            "output tensor must have 4 dimensions, got {}",
            proposed.rank()
        )));
    }
    if proposed.data_type != DataType::Float32 {
        return Err(Status::InvalidType(format!(
            "output tensor must be Float32, got {:?}",
            proposed.data_type
        )));
    }

    let dims = &proposed.dims;
    if dims[0] != image.width as usize {
        return Err(Status::InvalidDimension(format!(
            "output width {} does not match image width {}",
            dims[0], image.width
        )));
    }
    if dims[1] != image.height as usize {
        return Err(Status::InvalidDimension(format!(
            "output height {} does not match image height {}",
            dims[1], image.height
        )));
    }
    if dims[3] != 1 {
        return Err(Status::InvalidDimension(format!(
            "output batch must be 1, got {}",
            dims[3]
        )));
    }
    if dims[2] == 0 {
        return Err(Status::InvalidDimension(
            "output tensor channel count must be at least 1".to_string(),
        ));
    }

    let resolved = TensorDescriptor::new([dims[0], dims[1], dims[2], 1], DataType::Float32);
    OutputShape::from_descriptor(&resolved)?;
    if resolved.strides().is_none() {
        return Err(Status::InvalidDimension(format!(
            "output tensor {}x{}x{}x1 is too large",
            dims[0], dims[1], dims[2]
        )));
    }
    Ok(resolved)
}

/// Flat work-item index to `(channel, row, column)`.
pub fn decompose_index(id: usize, channels: usize, width: usize) -> (usize, usize, usize) {
    let i = id / channels;
    let channel = id - i * channels;
    let row = i / width;
    let column = i - row * width;
    (channel, row, column)
}

/// Byte offset of `channel` inside a source pixel; `None` when a reversed
/// read would fall before the pixel.
pub fn source_channel(channel: usize, order: ChannelOrder) -> Option<usize> {
    match order {
        ChannelOrder::Forward => Some(channel),
        ChannelOrder::Reversed => 2usize.checked_sub(channel),
    }
}

fn channel_offset_expr(order: ChannelOrder) -> &'static str {
    match order {
        ChannelOrder::Forward => "c",
        ChannelOrder::Reversed => "2 - c",
    }
}

/// Emit the OpenCL program for a resolved output shape and flag value.
pub fn synthesize(
    output: &TensorDescriptor,
    flags: u32,
    build_options: &str,
) -> Result<CodegenOutput, Status> {
    let shape = OutputShape::from_descriptor(output)?;
    let entry_point = EntryPointName::new(ENTRY_POINT)?;
    let order = ChannelOrder::from_flags(flags);

    debug!(
        width = shape.width,
        height = shape.height,
        channels = shape.channels,
        batch = shape.batch,
        ?order,
        "synthesizing image_to_tensor program"
    );

    let params = TemplateParams::new()
        .set("entry_point", &entry_point)
        .set("width", shape.width)
        .set("channels", shape.channels)
        .set("channel_offset", channel_offset_expr(order));
    let source = SOURCE_TEMPLATE.render(&params)?;

    Ok(CodegenOutput {
        entry_point,
        source,
        build_options: build_options.to_string(),
        work_dim: 1,
        global_work: [shape.element_count()?, 0, 0],
        local_work: None,
        local_buffer_usage_mask: 0,
        local_buffer_size_in_bytes: 0,
    })
}

fn to_u32(value: usize, what: &str) -> Result<u32, Status> {
    u32::try_from(value)
        .map_err(|_| Status::InvalidValue(format!("{what} {value} does not fit in uint")))
}

/// Invocation arguments in the order of the generated signature.
pub fn invocation_arguments(
    image: &ImageObject,
    output: &TensorDescriptor,
    flags: u32,
) -> Result<Vec<KernelArgument>, Status> {
    let strides = output.strides().ok_or_else(|| {
        Status::InvalidDimension("output tensor byte size overflows".to_string())
    })?;
    let [s0, s1, s2, s3] = strides[..] else {
        return Err(Status::InvalidDimension(format!(
            "output tensor must have 4 dimensions, got {}",
            output.rank()
        )));
    };

    Ok(vec![
        KernelArgument::Uint(image.descriptor.width),
        KernelArgument::Uint(image.descriptor.height),
        KernelArgument::Buffer(PARAM_INPUT),
        KernelArgument::Uint(to_u32(image.stride, "image stride")?),
        KernelArgument::Uint(to_u32(image.offset, "image offset")?),
        KernelArgument::Buffer(PARAM_OUTPUT),
        KernelArgument::Uint(0),
        KernelArgument::Uint4([
            to_u32(s0, "output stride")?,
            to_u32(s1, "output stride")?,
            to_u32(s2, "output stride")?,
            to_u32(s3, "output stride")?,
        ]),
        KernelArgument::Uint(flags & ChannelOrder::FLIP_BIT),
    ])
}

/// Host rendition of the generated program.
pub fn convert_on_host(
    image: &ImageObject,
    output: &TensorDescriptor,
    flags: u32,
) -> Result<Array4<f32>, Status> {
    let shape = OutputShape::from_descriptor(output)?;
    if shape.channels > SOURCE_PIXEL_BYTES {
        return Err(Status::InvalidDimension(format!(
            "host conversion reads at most {SOURCE_PIXEL_BYTES} channels, got {}",
            shape.channels
        )));
    }
    let data = image
        .data
        .as_deref()
        .ok_or_else(|| Status::InvalidValue("input image has no host buffer".to_string()))?;

    let elements = shape.element_count()?;
    let last_row = shape.height.saturating_sub(1);
    let required = last_row
        .checked_mul(image.stride)
        .and_then(|bytes| shape.width.checked_mul(SOURCE_PIXEL_BYTES)?.checked_add(bytes))
        .and_then(|bytes| bytes.checked_add(image.offset));
    if elements > 0 && !matches!(required, Some(required) if required <= data.len()) {
        return Err(Status::InvalidDimension(format!(
            "{}x{} image does not fit in the {}-byte host buffer",
            shape.width,
            shape.height,
            data.len()
        )));
    }

    let order = ChannelOrder::from_flags(flags);
    let mut tensor = Array4::<f32>::zeros((shape.batch, shape.channels, shape.height, shape.width));

    for id in 0..elements {
        let (channel, row, column) = decompose_index(id, shape.channels, shape.width);
        let src_channel = source_channel(channel, order).ok_or_else(|| {
            Status::InvalidDimension(format!("channel {channel} cannot be reversed"))
        })?;
        let src = image.offset + row * image.stride + column * SOURCE_PIXEL_BYTES + src_channel;
        let value = data.get(src).ok_or_else(|| {
            Status::InvalidDimension(format!(
                "pixel ({column}, {row}) channel {src_channel} is outside the {}-byte image buffer",
                data.len()
            ))
        })?;
        tensor[[0, channel, row, column]] = *value as f32;
    }

    Ok(tensor)
}

pub struct ImageToTensorKernel {
    build_options: String,
    host_fallback: bool,
}

impl ImageToTensorKernel {
    pub fn new() -> Self {
        Self {
            build_options: String::new(),
            host_fallback: false,
        }
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        Self {
            build_options: config.codegen.build_options.clone(),
            host_fallback: config.host.fallback,
        }
    }

    pub fn host_fallback(&self) -> bool {
        self.host_fallback
    }

    fn resolved_output(params: &[DataObject]) -> Result<&TensorDescriptor, Status> {
        expect_tensor(params, PARAM_OUTPUT)?
            .descriptor
            .as_ref()
            .ok_or_else(|| Status::InvalidDimension("output tensor shape is unresolved".to_string()))
    }

    fn flags(params: &[DataObject]) -> Result<u32, Status> {
        let scalar = expect_scalar(params, PARAM_FLAGS)?;
        scalar.as_u32().ok_or_else(|| {
            Status::InvalidType(format!(
                "flag scalar must be Uint32, got {:?}",
                scalar.scalar_type()
            ))
        })
    }
}

impl Default for ImageToTensorKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for ImageToTensorKernel {
    fn validate(
        &self,
        node: &NodeContext,
        params: &[DataObject],
        metas: &mut [MetaFormat],
    ) -> Result<(), Status> {
        if params.len() != NUM_PARAMS {
            return Err(Status::InvalidParameters(format!(
                "expected {NUM_PARAMS} parameters, got {}",
                params.len()
            )));
        }

        let image = expect_image(params, PARAM_INPUT)?;
        let flag = expect_scalar(params, PARAM_FLAGS)?;
        let tensor = expect_tensor(params, PARAM_OUTPUT)?;

        let resolved = validate_conversion(
            &image.descriptor,
            flag.scalar_type(),
            tensor.descriptor.as_ref(),
        )?;
        debug!(
            node = node.node_index,
            dims = ?resolved.dims,
            "validated image_to_tensor node"
        );

        let meta = metas.get_mut(PARAM_OUTPUT).ok_or_else(|| {
            Status::InvalidParameters("missing output meta slot".to_string())
        })?;
        meta.set_tensor(resolved);
        Ok(())
    }

    fn query_target_support(
        &self,
        _node: &NodeContext,
        _driver: DriverGeneration,
    ) -> Result<TargetAffinity, Status> {
        if self.host_fallback {
            Ok(TargetAffinity::GPU.union(TargetAffinity::CPU))
        } else {
            Ok(TargetAffinity::GPU)
        }
    }

    fn opencl_codegen(
        &self,
        _node: &NodeContext,
        params: &[DataObject],
        _load_phase: bool,
    ) -> Result<CodegenOutput, Status> {
        let output = Self::resolved_output(params)?;
        let flags = Self::flags(params)?;
        synthesize(output, flags, &self.build_options)
    }

    fn invocation_arguments(&self, params: &[DataObject]) -> Result<Vec<KernelArgument>, Status> {
        let image = expect_image(params, PARAM_INPUT)?;
        let output = Self::resolved_output(params)?;
        let flags = Self::flags(params)?;
        invocation_arguments(image, output, flags)
    }

    fn execute(&self, node: &NodeContext, params: &mut [DataObject]) -> Result<(), Status> {
        if !self.host_fallback {
            return Err(Status::NotImplemented(format!(
                "{} has no host implementation",
                node.kernel_name
            )));
        }
        if params.len() != NUM_PARAMS {
            return Err(Status::InvalidParameters(format!(
                "expected {NUM_PARAMS} parameters, got {}",
                params.len()
            )));
        }

        let output = Self::resolved_output(params)?.clone();
        let flags = Self::flags(params)?;
        let (input, rest) = params.split_at_mut(PARAM_OUTPUT);
        let image = expect_image(input, PARAM_INPUT)?;
        let tensor = convert_on_host(image, &output, flags)?;

        expect_tensor_mut(rest, 0)?.data = Some(tensor);
        Ok(())
    }
}

/// Register the kernel, its parameter contract and callbacks.
pub fn publish(registry: &mut KernelRegistry, config: &PluginConfig) -> Result<(), Status> {
    let callbacks = Arc::new(ImageToTensorKernel::from_config(config));
    let descriptor = KernelBuilder::new(KERNEL_NAME, KERNEL_ID, NUM_PARAMS, callbacks)
        .parameter(
            PARAM_INPUT,
            ParameterDirection::Input,
            ParameterKind::Image,
            ParameterState::Required,
        )?
        .parameter(
            PARAM_OUTPUT,
            ParameterDirection::Output,
            ParameterKind::Tensor,
            ParameterState::Required,
        )?
        .parameter(
            PARAM_FLAGS,
            ParameterDirection::Input,
            ParameterKind::Scalar,
            ParameterState::Required,
        )?
        .finalize()?;

    registry.register(descriptor)
}

/// Create a conversion node bound to `input` and `output`. The flag scalar
/// is bound separately at [`PARAM_FLAGS`].
pub fn convert_image_to_tensor_node(
    graph: &mut Graph,
    input: DataRef,
    output: DataRef,
) -> Result<NodeHandle, Status> {
    graph.create_node(KERNEL_ID, &[input, output])
}
