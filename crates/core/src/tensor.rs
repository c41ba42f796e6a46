use std::sync::Arc;

use crate::{dim::Dimensions, fixed_dim::FixedDimensions};

/// A constant tensor payload, stored as raw bytes alongside its element
/// type. Typed views are produced on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    dims: FixedDimensions,
    stride: FixedDimensions,
    data: Arc<Vec<u8>>,
    elem_ty: TensorElemType,
}

/// Represents a type and shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedShape {
    pub dims: Dimensions,
    pub elem_ty: TensorElemType,
}

impl TypedShape {
    pub fn new(dims: Dimensions, elem_ty: TensorElemType) -> Self {
        Self { dims, elem_ty }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorElemType {
    Bool,
    F32,
    I32,
    I64,
}

pub trait TensorElemTypeExt: Copy {
    fn get_type() -> TensorElemType;
}

impl Tensor {
    pub fn new<T: TensorElemTypeExt>(dims: FixedDimensions, data: Vec<T>) -> Self {
        let data = std::mem::ManuallyDrop::new(data);
        Self {
            stride: dims.strides(),
            elem_ty: T::get_type(),
            data: Arc::new(unsafe {
                Vec::from_raw_parts(
                    data.as_ptr() as *mut u8,
                    data.len() * std::mem::size_of::<T>(),
                    data.capacity() * std::mem::size_of::<T>(),
                )
            }),
            dims,
        }
    }

    pub fn new_from_raw(dims: FixedDimensions, elem_ty: TensorElemType, data: Vec<u8>) -> Self {
        Self {
            stride: dims.strides(),
            elem_ty,
            data: Arc::new(data),
            dims,
        }
    }

    pub fn data<T: TensorElemTypeExt>(&self) -> &[T] {
        assert_eq!(self.elem_ty, T::get_type());
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr() as *const T,
                self.data.len() / std::mem::size_of::<T>(),
            )
        }
    }

    pub fn data_as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn dims(&self) -> &FixedDimensions {
        &self.dims
    }

    pub fn strides(&self) -> &FixedDimensions {
        &self.stride
    }

    pub fn elem_ty(&self) -> TensorElemType {
        self.elem_ty
    }
}

impl TensorElemType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::F32 => 4,
            Self::I32 => 4,
            Self::I64 => 8,
        }
    }

    pub fn is_f32(&self) -> bool {
        matches!(self, Self::F32)
    }

    pub fn is_i32(&self) -> bool {
        matches!(self, Self::I32)
    }

    pub fn is_i64(&self) -> bool {
        matches!(self, Self::I64)
    }
}

impl TensorElemTypeExt for bool {
    fn get_type() -> TensorElemType {
        TensorElemType::Bool
    }
}

impl TensorElemTypeExt for f32 {
    fn get_type() -> TensorElemType {
        TensorElemType::F32
    }
}

impl TensorElemTypeExt for i32 {
    fn get_type() -> TensorElemType {
        TensorElemType::I32
    }
}

impl TensorElemTypeExt for i64 {
    fn get_type() -> TensorElemType {
        TensorElemType::I64
    }
}

#[test]
fn typed_view() {
    let t = Tensor::new::<i64>(vec![2].into(), vec![2, 3]);
    assert!(t.elem_ty().is_i64());
    assert_eq!(t.data::<i64>(), &[2, 3]);
    assert_eq!(t.data_as_bytes().len(), 16);
}

#[test]
fn raw_roundtrip() {
    let t = Tensor::new::<i64>(vec![2].into(), vec![2, 3]);
    let u = Tensor::new_from_raw(
        t.dims().clone(),
        t.elem_ty(),
        t.data_as_bytes().to_vec(),
    );
    assert_eq!(t, u);
}
