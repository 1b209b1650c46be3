use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// Pixel layout of an image object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 3 bytes per pixel, interleaved R, G, B.
    Rgb,
    /// 4 bytes per pixel, interleaved R, G, B, padding.
    Rgbx,
    U8,
    Yuyv,
    Nv12,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Rgbx => 4,
            Self::U8 | Self::Nv12 => 1,
            Self::Yuyv => 2,
        }
    }

    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" | "rgb24" => Some(Self::Rgb),
            "rgbx" => Some(Self::Rgbx),
            "u8" | "gray" => Some(Self::U8),
            "yuyv" => Some(Self::Yuyv),
            "nv12" => Some(Self::Nv12),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl ImageDescriptor {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Row stride of a tightly packed image, in bytes.
    pub fn packed_stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }
}

/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Uint8,
    Int16,
    Int32,
    Float16,
    Float32,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Float16 => 2,
            Self::Int32 | Self::Float32 => 4,
        }
    }
}

/// Shape metadata of a tensor. Axis 0 is the fastest varying one, so a
/// rank-4 image tensor reads `[width, height, channels, batch]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub dims: Vec<usize>,
    pub data_type: DataType,
}

impl TensorDescriptor {
    pub fn new(dims: impl Into<Vec<usize>>, data_type: DataType) -> Self {
        Self {
            dims: dims.into(),
            data_type,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// `None` when the product overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |count, dim| count.checked_mul(*dim))
    }

    /// Planar byte strides, one per axis. `None` when the total byte size
    /// overflows `usize`.
    pub fn strides(&self) -> Option<Vec<usize>> {
        let mut strides = Vec::with_capacity(self.dims.len());
        let mut stride = self.data_type.size_in_bytes();
        for dim in &self.dims {
            strides.push(stride);
            stride = stride.checked_mul(*dim)?;
        }
        Some(strides)
    }
}

/// Declared type of a scalar object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Uint8,
    Int32,
    Uint32,
    Float32,
    Bool,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Uint8(u8),
    Int32(i32),
    Uint32(u32),
    Float32(f32),
    Bool(bool),
    Size(usize),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Uint8(_) => ScalarType::Uint8,
            Self::Int32(_) => ScalarType::Int32,
            Self::Uint32(_) => ScalarType::Uint32,
            Self::Float32(_) => ScalarType::Float32,
            Self::Bool(_) => ScalarType::Bool,
            Self::Size(_) => ScalarType::Size,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Uint32(v) => Some(*v),
            _ => None,
        }
    }
}

/// Channel order selected by bit 0 of the conversion flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelOrder {
    Forward,
    Reversed,
}

impl ChannelOrder {
    pub const FLIP_BIT: u32 = 1;

    /// Only bit 0 is meaningful; the remaining bits are ignored.
    pub fn from_flags(flags: u32) -> Self {
        if flags & Self::FLIP_BIT != 0 {
            Self::Reversed
        } else {
            Self::Forward
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageObject {
    pub descriptor: ImageDescriptor,
    /// Row stride in bytes.
    pub stride: usize,
    /// Byte offset of the first pixel inside `data`.
    pub offset: usize,
    pub data: Option<Vec<u8>>,
}

impl ImageObject {
    pub fn new(descriptor: ImageDescriptor) -> Self {
        Self {
            descriptor,
            stride: descriptor.packed_stride(),
            offset: 0,
            data: None,
        }
    }

    pub fn with_data(descriptor: ImageDescriptor, data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            ..Self::new(descriptor)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorObject {
    /// `None` for a virtual tensor whose shape has not been resolved yet.
    pub descriptor: Option<TensorDescriptor>,
    /// Host buffer laid out `[batch, channels, height, width]`.
    pub data: Option<Array4<f32>>,
}

impl TensorObject {
    pub fn new(descriptor: TensorDescriptor) -> Self {
        Self {
            descriptor: Some(descriptor),
            data: None,
        }
    }

    pub fn virtual_tensor() -> Self {
        Self {
            descriptor: None,
            data: None,
        }
    }
}

/// Entry of a node's parameter array.
#[derive(Debug, Clone, PartialEq)]
pub enum DataObject {
    Image(ImageObject),
    Tensor(TensorObject),
    Scalar(ScalarValue),
}

impl DataObject {
    pub fn kind(&self) -> ParameterKind {
        match self {
            Self::Image(_) => ParameterKind::Image,
            Self::Tensor(_) => ParameterKind::Tensor,
            Self::Scalar(_) => ParameterKind::Scalar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    Image,
    Tensor,
    Scalar,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_planar_strides() {
        let desc = TensorDescriptor::new([4, 3, 2, 1], DataType::Float32);
        assert_eq!(desc.rank(), 4);
        assert_eq!(desc.element_count(), Some(24));
        assert_eq!(desc.strides(), Some(vec![4, 16, 48, 96]));
    }

    #[test]
    fn test_tensor_size_overflow_is_reported() {
        let max = u32::MAX as usize;
        let desc = TensorDescriptor::new([max, max, 2, 1], DataType::Float32);
        assert_eq!(desc.element_count(), None);
        assert_eq!(desc.strides(), None);

        let huge = TensorDescriptor::new([usize::MAX, 1], DataType::Uint8);
        assert_eq!(huge.element_count(), Some(usize::MAX));
        assert_eq!(huge.strides(), Some(vec![1, usize::MAX]));
    }

    #[test]
    fn test_channel_order_ignores_upper_bits() {
        assert_eq!(ChannelOrder::from_flags(0), ChannelOrder::Forward);
        assert_eq!(ChannelOrder::from_flags(1), ChannelOrder::Reversed);
        assert_eq!(ChannelOrder::from_flags(0xFFFF_FFFE), ChannelOrder::Forward);
        assert_eq!(ChannelOrder::from_flags(0x8000_0001), ChannelOrder::Reversed);
    }

    #[test]
    fn test_scalar_type_reporting() {
        assert_eq!(ScalarValue::Uint32(7).scalar_type(), ScalarType::Uint32);
        assert_eq!(ScalarValue::Int32(7).scalar_type(), ScalarType::Int32);
        assert_eq!(ScalarValue::Uint32(7).as_u32(), Some(7));
        assert_eq!(ScalarValue::Float32(7.0).as_u32(), None);
    }

    #[test]
    fn test_image_packed_stride() {
        let desc = ImageDescriptor::new(5, 2, PixelFormat::Rgb);
        let image = ImageObject::new(desc);
        assert_eq!(image.stride, 15);
        assert_eq!(image.offset, 0);
        assert!(image.data.is_none());
    }

    #[test]
    fn test_pixel_format_serde() {
        let json = serde_json::to_string(&PixelFormat::Rgb).expect("format should serialize");
        let back: PixelFormat = serde_json::from_str(&json).expect("format should deserialize");
        assert_eq!(back, PixelFormat::Rgb);
        assert_eq!(PixelFormat::parse("RGB24"), Some(PixelFormat::Rgb));
        assert_eq!(PixelFormat::parse("bgr"), None);
    }
}
