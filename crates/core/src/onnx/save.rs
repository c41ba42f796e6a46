use std::{fs, io, path::Path};

use prost::Message;
use thiserror::Error;

use crate::{
    dim::Dimension as Dim,
    model::Model,
    op::Op,
    tensor::{Tensor, TensorElemType, TypedShape},
    value::ValueId,
};

include!(concat!(env!("OUT_DIR"), "/onnx.rs"));

use attribute_proto::AttributeType;
use tensor_proto::DataType;
use tensor_shape_proto::{dimension::Value as DimValue, Dimension};
use type_proto::Value::TensorType;

#[derive(Error, Debug)]
pub enum ModelSaveError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("Graph input shape is not provided")]
    NoGraphInputShape,

    #[error("Graph output shape is not provided")]
    NoGraphOutputShape,

    #[error("Unknown opset version: {0}")]
    UnknownOpsetVersion(i64),
}

pub fn save_onnx(model: &Model, path: impl AsRef<Path>) -> Result<(), ModelSaveError> {
    fn opset_to_ir_version(opset: i64) -> Result<i64, ModelSaveError> {
        match opset {
            1..=8 => Ok(3),
            9 => Ok(4),
            10 => Ok(5),
            11 => Ok(6),
            12..=14 => Ok(7),
            15..=18 => Ok(8),
            19..=20 => Ok(9),
            _ => Err(ModelSaveError::UnknownOpsetVersion(opset)),
        }
    }

    let mut model_proto = ModelProto::default();
    let mut buf = Vec::new();

    model_proto.graph = encode_graph(model)?.into();
    model_proto.opset_import.push(OperatorSetIdProto {
        domain: Some("ai.onnx".to_string()),
        version: Some(model.opset_version),
    });
    model_proto.ir_version = Some(opset_to_ir_version(model.opset_version)?);
    model_proto
        .encode(&mut buf)
        .expect("Vec<u8> writes cannot fail");

    fs::write(path, buf)?;

    Ok(())
}

fn encode_graph(model: &Model) -> Result<GraphProto, ModelSaveError> {
    let mut graph_proto = GraphProto::default();

    // Encode graph inputs and outputs. These must carry shapes.
    for (vals, proto, missing) in [
        (
            &model.graph.inputs,
            &mut graph_proto.input,
            (|| ModelSaveError::NoGraphInputShape) as fn() -> ModelSaveError,
        ),
        (&model.graph.outputs, &mut graph_proto.output, || {
            ModelSaveError::NoGraphOutputShape
        }),
    ] {
        for &id in vals {
            let val = &model.graph.values.inner()[id];
            let Some(shape) = &val.shape else {
                return Err(missing());
            };
            proto.push(ValueInfoProto {
                name: val.name.clone(),
                r#type: encode_type(shape).into(),
                doc_string: "".to_string().into(),
            });
        }
    }

    // Encode shape annotations for intermediate values.
    for (id, val) in model.graph.values.inner().iter() {
        if model.graph.inputs.contains(&id)
            || model.graph.outputs.contains(&id)
            || model.graph.inits.contains_key(&id)
        {
            continue;
        }
        let (Some(name), Some(shape)) = (&val.name, &val.shape) else {
            continue;
        };
        graph_proto.value_info.push(ValueInfoProto {
            name: Some(name.clone()),
            r#type: encode_type(shape).into(),
            doc_string: None,
        });
    }

    // Encode initializers. Always embedded, never external data.
    let mut inits = model.graph.inits.iter().collect::<Vec<_>>();
    inits.sort_by_key(|(id, _)| id.index());
    for (&id, tensor) in inits {
        graph_proto
            .initializer
            .push(encode_tensor(tensor, Some(value_name(model, id))));
    }

    // Encode nodes.
    for &node_id in &model.topo_sort_nodes() {
        let node = &model.graph.nodes[node_id];
        let mut node_proto = NodeProto {
            name: node.name.clone(),
            op_type: node.op.name().to_string().into(),
            attribute: encode_attrs(&node.op),
            ..Default::default()
        };

        for &input_id in &node.inputs {
            node_proto.input.push(value_name(model, input_id));
        }

        for &output_id in &node.outputs {
            node_proto.output.push(value_name(model, output_id));
        }

        graph_proto.node.push(node_proto);
    }

    Ok(graph_proto)
}

fn value_name(model: &Model, id: ValueId) -> String {
    model.graph.values.inner()[id]
        .name
        .clone()
        .unwrap_or_else(|| format!("value.{}", id.index()))
}

fn encode_type(shape: &TypedShape) -> TypeProto {
    let elem_ty: DataType = shape.elem_ty.into();
    TypeProto {
        denotation: Some("TENSOR".to_string()),
        value: Some(TensorType(type_proto::Tensor {
            elem_type: Some(elem_ty as i32),
            shape: Some(TensorShapeProto {
                dim: shape
                    .dims
                    .iter()
                    .map(|d| Dimension {
                        denotation: None,
                        value: match d {
                            Dim::Fixed(d) => Some(DimValue::DimValue(*d as i64)),
                            Dim::Dynamic(d) => Some(DimValue::DimParam(d.clone())),
                        },
                    })
                    .collect::<Vec<_>>(),
            }),
        })),
    }
}

fn encode_tensor(tensor: &Tensor, name: Option<String>) -> TensorProto {
    let elem_ty: DataType = tensor.elem_ty().into();
    TensorProto {
        dims: tensor.dims().to_i64_vec(),
        data_type: Some(elem_ty as i32),
        name,
        raw_data: Some(tensor.data_as_bytes().to_vec()),
        ..Default::default()
    }
}

fn encode_attrs(op: &Op) -> Vec<AttributeProto> {
    match op {
        Op::Conv2d(c) => vec![
            attr_string("auto_pad", &c.auto_pad),
            attr_ints("dilations", c.dilations.to_i64_vec()),
            attr_int("group", c.group),
            attr_ints("kernel_shape", c.kernel_shape.to_i64_vec()),
            attr_ints("pads", c.padding.to_i64_vec()),
            attr_ints("strides", c.strides.to_i64_vec()),
        ],
        Op::MaxPool(p) => vec![
            attr_string("auto_pad", &p.auto_pad),
            attr_ints("kernel_shape", p.kernel_shape.to_i64_vec()),
            attr_ints("pads", p.padding.to_i64_vec()),
            attr_ints("strides", p.strides.to_i64_vec()),
        ],
        Op::Flatten(f) => vec![attr_int("axis", f.axis)],
        Op::Softmax(s) => vec![attr_int("axis", s.axis)],
        Op::Gemm(g) => vec![
            attr_float("alpha", g.alpha),
            attr_float("beta", g.beta),
            attr_int("transA", g.trans_a as i64),
            attr_int("transB", g.trans_b as i64),
        ],
        Op::BatchNormalization(b) => vec![
            attr_float("epsilon", b.epsilon),
            attr_float("momentum", b.momentum),
            attr_int("training_mode", b.training_mode as i64),
        ],
        Op::ReduceMean(r) => {
            let mut attrs = vec![];
            if !r.axes.is_empty() {
                attrs.push(attr_ints("axes", r.axes.clone()));
            }
            attrs.push(attr_int("keepdims", r.keep_dims as i64));
            attrs
        }
        Op::Constant(c) => vec![attr_tensor("value", encode_tensor(&c.value, None))],
        Op::Add
        | Op::Mul
        | Op::ReLU
        | Op::GlobalAveragePool
        | Op::Reshape
        | Op::MatMul
        | Op::Identity => vec![],
    }
}

fn attr_int(name: &str, i: i64) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        i: Some(i),
        r#type: Some(AttributeType::Int as i32),
        ..Default::default()
    }
}

fn attr_ints(name: &str, ints: Vec<i64>) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        ints,
        r#type: Some(AttributeType::Ints as i32),
        ..Default::default()
    }
}

fn attr_float(name: &str, f: f32) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        f: Some(f),
        r#type: Some(AttributeType::Float as i32),
        ..Default::default()
    }
}

fn attr_string(name: &str, s: &str) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        s: Some(s.as_bytes().to_vec()),
        r#type: Some(AttributeType::String as i32),
        ..Default::default()
    }
}

fn attr_tensor(name: &str, t: TensorProto) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        t: Some(t),
        r#type: Some(AttributeType::Tensor as i32),
        ..Default::default()
    }
}

impl From<TensorElemType> for DataType {
    fn from(ty: TensorElemType) -> Self {
        match ty {
            TensorElemType::F32 => DataType::Float,
            TensorElemType::I32 => DataType::Int32,
            TensorElemType::I64 => DataType::Int64,
            TensorElemType::Bool => DataType::Bool,
        }
    }
}
