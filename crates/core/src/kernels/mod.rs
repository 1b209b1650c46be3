pub mod image_to_tensor;
