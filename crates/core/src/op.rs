use crate::{fixed_dim::FixedDimensions, tensor::Tensor};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Conv2d(Conv2d),
    Add,
    Mul,
    ReLU,
    MaxPool(MaxPool),
    GlobalAveragePool,
    Reshape,
    Flatten(Flatten),
    Softmax(Softmax),
    MatMul,
    Gemm(Gemm),
    BatchNormalization(BatchNormalization),
    ReduceMean(ReduceMean),
    Identity,
    Constant(Constant),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Conv2d {
    pub auto_pad: String,
    pub dilations: FixedDimensions,
    pub group: i64,
    pub kernel_shape: FixedDimensions,
    pub strides: FixedDimensions,
    pub padding: FixedDimensions,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MaxPool {
    pub auto_pad: String,
    pub kernel_shape: FixedDimensions,
    pub strides: FixedDimensions,
    pub padding: FixedDimensions,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Flatten {
    pub axis: i64,
}

/// <https://github.com/onnx/onnx/blob/main/docs/Operators.md#Softmax>
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Softmax {
    pub axis: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Gemm {
    pub alpha: f32,
    pub beta: f32,
    pub trans_a: bool,
    pub trans_b: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchNormalization {
    pub epsilon: f32,
    pub momentum: f32,
    pub training_mode: bool,
}

/// <https://github.com/onnx/onnx/blob/main/docs/Operators.md#ReduceMean>
///
/// `axes` is empty when the model carries the axes as a second input
/// (opset 13 and later) or omits them entirely.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReduceMean {
    pub axes: Vec<i64>,
    pub keep_dims: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub value: Tensor,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Conv2d(_) => "Conv",
            Op::Add => "Add",
            Op::Mul => "Mul",
            Op::ReLU => "Relu",
            Op::MaxPool(_) => "MaxPool",
            Op::GlobalAveragePool => "GlobalAveragePool",
            Op::Reshape => "Reshape",
            Op::Flatten(_) => "Flatten",
            Op::Softmax(_) => "Softmax",
            Op::MatMul => "MatMul",
            Op::Gemm(_) => "Gemm",
            Op::BatchNormalization(_) => "BatchNormalization",
            Op::ReduceMean(_) => "ReduceMean",
            Op::Identity => "Identity",
            Op::Constant(_) => "Constant",
        }
    }
}
