use prost::{DecodeError, Message};
use rustc_hash::FxHashMap;
use std::{borrow::Cow, collections::hash_map::Entry, fs, io, path::Path};
use thiserror::Error;

use crate::{
    dim::Dimension,
    fixed_dim::FixedDimensions,
    model::Model,
    node::Node,
    op::{BatchNormalization, Constant, Conv2d, Flatten, Gemm, MaxPool, Op, ReduceMean, Softmax},
    tensor::{Tensor, TensorElemType, TypedShape},
};

use tensor_proto::{DataLocation, DataType};
use tensor_shape_proto::dimension::Value::{DimParam, DimValue};
use type_proto::Value::TensorType;

include!(concat!(env!("OUT_DIR"), "/onnx.rs"));

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("Model does not contain any graph")]
    NoGraph,

    #[error("Model is invalid: {0}")]
    InvalidModel(DecodeError),

    #[error("Model contains duplicated opsets")]
    DuplicateOpset,

    #[error("Value type is not specified")]
    NoValueType,

    #[error("Value shape is not specified")]
    NoValueShape,

    #[error("Attribute '{0}' is not specified")]
    NoAttribute(&'static str),

    #[error("External tensor data entry lacks a location")]
    NoExternalDataLocation,

    #[error("External tensor data cannot be resolved without the model's directory")]
    NoExternalDataDir,

    #[error("Something went wrong: {0}")]
    Todo(Cow<'static, str>),
}

pub fn load_onnx(path: impl AsRef<Path>) -> Result<Model, ModelLoadError> {
    let path = path.as_ref();
    let model_proto = load_onnx_model_proto(path)?;
    load_onnx_from_model_proto(model_proto, path.parent())
}

pub fn load_onnx_from_buffer(buf: &[u8]) -> Result<Model, ModelLoadError> {
    let model = ModelProto::decode(buf).map_err(ModelLoadError::InvalidModel)?;
    load_onnx_from_model_proto(model, None)
}

/// `base_dir` is where external tensor data files are looked up; pass
/// `None` when the model did not come from a file.
pub fn load_onnx_from_model_proto(
    model_proto: ModelProto,
    base_dir: Option<&Path>,
) -> Result<Model, ModelLoadError> {
    let graph = model_proto.graph.ok_or(ModelLoadError::NoGraph)?;
    let mut model = Model::default();
    let mut name_to_val = FxHashMap::default();

    let mut opset_version = None;
    for opset_import in &model_proto.opset_import {
        match opset_import.domain() {
            "" | "ai.onnx" if opset_version.is_none() => {
                opset_version = Some(opset_import.version())
            }
            "" | "ai.onnx" => return Err(ModelLoadError::DuplicateOpset),
            domain => {
                return Err(ModelLoadError::Todo(
                    format!("Custom domain ('{domain}') not supported yet").into(),
                ))
            }
        }
    }
    model.opset_version = opset_version.ok_or(ModelLoadError::DuplicateOpset)?;

    // Load initializers. External data is embedded here so that the
    // rest of the crate never sees a sidecar file.
    for init in graph.initializer.iter() {
        let tensor = get_tensor(init, base_dir)?;
        let val = *name_to_val
            .entry(init.name())
            .or_insert_with(|| model.graph.values.new_val_named(init.name()));
        model.graph.inits.insert(val, tensor);
    }

    // Load inputs and outputs.
    for (vals, vec) in [
        (&graph.input, &mut model.graph.inputs),
        (&graph.output, &mut model.graph.outputs),
    ] {
        for x in vals {
            let shape = get_typed_shape(x)?;
            let input = match name_to_val.entry(x.name()) {
                Entry::Occupied(o) => *o.get(),
                Entry::Vacant(v) => {
                    *v.insert(model.graph.values.new_val_named_and_shaped(x.name(), shape))
                }
            };
            vec.push(input);
        }
    }

    // Remove initializers from inputs if needed.
    model
        .graph
        .inputs
        .retain(|&x| !model.graph.inits.contains_key(&x));

    // Load value_info shape annotations. These are optional and drive
    // the rank lookup in the rewrite passes.
    for x in graph.value_info.iter() {
        let Ok(shape) = get_typed_shape(x) else {
            continue;
        };
        let val = *name_to_val
            .entry(x.name())
            .or_insert_with(|| model.graph.values.new_val_named(x.name()));
        let value = &mut model.graph.values[val];
        if value.shape.is_none() {
            value.shape = Some(shape);
        }
    }

    // Load nodes.
    for node in graph.node.iter() {
        let inputs = node
            .input
            .iter()
            .map(|input| {
                *name_to_val
                    .entry(input)
                    .or_insert_with(|| model.graph.values.new_val_named(input))
            })
            .collect();
        let outputs = node
            .output
            .iter()
            .map(|output| {
                *name_to_val
                    .entry(output)
                    .or_insert_with(|| model.graph.values.new_val_named(output))
            })
            .collect();

        let op = match node.op_type() {
            "Add" => Op::Add,
            "Mul" => Op::Mul,
            "Relu" => Op::ReLU,
            "Reshape" => Op::Reshape,
            "MatMul" => Op::MatMul,
            "GlobalAveragePool" => Op::GlobalAveragePool,
            "Identity" => Op::Identity,
            "Softmax" => Op::Softmax(Softmax {
                axis: get_attribute(&node.attribute, "axis").map_or(-1, |a| a.i()),
            }),
            "Conv" => {
                let auto_pad = get_attribute(&node.attribute, "auto_pad")
                    .map_or("NOTSET".to_string(), |a| {
                        String::from_utf8_lossy(a.s()).to_string()
                    });
                let kernel_shape = FixedDimensions::from_i64(
                    &get_attribute(&node.attribute, "kernel_shape")?.ints,
                );
                let strides = get_attribute(&node.attribute, "strides")
                    .map_or(vec![1, 1].into(), |a| FixedDimensions::from_i64(&a.ints));
                let padding = get_attribute(&node.attribute, "pads")
                    .map_or(vec![0, 0].into(), |a| FixedDimensions::from_i64(&a.ints));
                let dilations = get_attribute(&node.attribute, "dilations")
                    .map_or(vec![1, 1].into(), |a| FixedDimensions::from_i64(&a.ints));
                let group = get_attribute(&node.attribute, "group").map_or(1, |a| a.i());
                Op::Conv2d(Conv2d {
                    auto_pad,
                    dilations,
                    kernel_shape,
                    strides,
                    group,
                    padding,
                })
            }
            "MaxPool" => {
                let auto_pad = get_attribute(&node.attribute, "auto_pad")
                    .map_or("NOTSET".to_string(), |a| {
                        String::from_utf8_lossy(a.s()).to_string()
                    });
                let padding = get_attribute(&node.attribute, "pads")
                    .map_or(vec![0, 0].into(), |a| FixedDimensions::from_i64(&a.ints));
                let kernel = FixedDimensions::from_i64(
                    &get_attribute(&node.attribute, "kernel_shape")?.ints,
                );
                let strides =
                    FixedDimensions::from_i64(&get_attribute(&node.attribute, "strides")?.ints);
                Op::MaxPool(MaxPool {
                    auto_pad,
                    padding,
                    kernel_shape: kernel,
                    strides,
                })
            }
            "Flatten" => Op::Flatten(Flatten {
                axis: get_attribute(&node.attribute, "axis").map_or(1, |a| a.i()),
            }),
            "Gemm" => Op::Gemm(Gemm {
                alpha: get_attribute(&node.attribute, "alpha").map_or(1.0, |a| a.f()),
                beta: get_attribute(&node.attribute, "beta").map_or(1.0, |a| a.f()),
                trans_a: get_attribute(&node.attribute, "transA").map_or(false, |a| a.i() == 1),
                trans_b: get_attribute(&node.attribute, "transB").map_or(false, |a| a.i() == 1),
            }),
            "BatchNormalization" => Op::BatchNormalization(BatchNormalization {
                epsilon: get_attribute(&node.attribute, "epsilon").map_or(1e-5, |a| a.f()),
                momentum: get_attribute(&node.attribute, "momentum").map_or(0.9, |a| a.f()),
                training_mode: get_attribute(&node.attribute, "training_mode")
                    .map_or(false, |a| a.i() != 0),
            }),
            // Opset 13 moved `axes` from attribute to input; in that
            // case the list stays empty here and is resolved from the
            // initializer by whoever needs it.
            "ReduceMean" => Op::ReduceMean(ReduceMean {
                axes: get_attribute(&node.attribute, "axes").map_or(vec![], |a| a.ints.clone()),
                keep_dims: get_attribute(&node.attribute, "keepdims").map_or(true, |a| a.i() != 0),
            }),
            "Constant" => Op::Constant(Constant {
                value: get_tensor(
                    get_attribute(&node.attribute, "value").map_or_else(
                        |_| {
                            Err(ModelLoadError::Todo(
                                "Constant.value must be specified for now".into(),
                            ))
                        },
                        |a| {
                            a.t.as_ref().ok_or(ModelLoadError::Todo(
                                "Constant.value must be a tensor".into(),
                            ))
                        },
                    )?,
                    base_dir,
                )?,
            }),
            op => return Err(ModelLoadError::Todo(format!("Unsupported op: {op}").into())),
        };

        model.graph.add_node(
            Node::new(op)
                .with_name(node.name.to_owned())
                .with_ins(inputs)
                .with_outs(outputs),
        );
    }

    Ok(model)
}

fn get_attribute<'a>(
    attrs: &'a [AttributeProto],
    name: &'static str,
) -> Result<&'a AttributeProto, ModelLoadError> {
    attrs
        .iter()
        .find(|x| x.name() == name)
        .ok_or(ModelLoadError::NoAttribute(name))
}

fn get_typed_shape(x: &ValueInfoProto) -> Result<TypedShape, ModelLoadError> {
    let TensorType(tensor) = x
        .r#type
        .as_ref()
        .ok_or(ModelLoadError::NoValueType)?
        .value
        .as_ref()
        .ok_or(ModelLoadError::NoValueType)?;

    let mut dims: Vec<Dimension> = vec![];
    for d in tensor
        .shape
        .as_ref()
        .ok_or(ModelLoadError::NoValueShape)?
        .dim
        .iter()
    {
        match d.value.as_ref() {
            Some(DimValue(i)) => dims.push(Dimension::Fixed(*i as usize)),
            Some(DimParam(s)) => dims.push(Dimension::Dynamic(s.clone())),
            None => return Err(ModelLoadError::NoValueShape),
        }
    }

    Ok(TypedShape::new(dims.into(), elem_type(tensor.elem_type())?))
}

fn elem_type(code: i32) -> Result<TensorElemType, ModelLoadError> {
    DataType::from_i32(code)
        .ok_or_else(|| ModelLoadError::Todo(format!("Unknown data type code: {code}").into()))?
        .try_into()
}

fn get_tensor(tensor: &TensorProto, base_dir: Option<&Path>) -> Result<Tensor, ModelLoadError> {
    if tensor.data_location() == DataLocation::External {
        let data = read_external_data(tensor, base_dir)?;
        return Ok(Tensor::new_from_raw(
            FixedDimensions::from_i64(&tensor.dims),
            elem_type(tensor.data_type())?,
            data,
        ));
    }

    Ok(match elem_type(tensor.data_type())? {
        TensorElemType::F32 if tensor.raw_data().is_empty() => Tensor::new(
            FixedDimensions::from_i64(&tensor.dims),
            tensor.float_data.clone(),
        ),
        TensorElemType::F32 => Tensor::new_from_raw(
            FixedDimensions::from_i64(&tensor.dims),
            TensorElemType::F32,
            tensor.raw_data().to_vec(),
        ),
        TensorElemType::I64 if tensor.raw_data().is_empty() => Tensor::new(
            FixedDimensions::from_i64(&tensor.dims),
            tensor.int64_data.clone(),
        ),
        TensorElemType::I64 => Tensor::new_from_raw(
            FixedDimensions::from_i64(&tensor.dims),
            TensorElemType::I64,
            tensor.raw_data().to_vec(),
        ),
        TensorElemType::I32 if tensor.raw_data().is_empty() => Tensor::new(
            FixedDimensions::from_i64(&tensor.dims),
            tensor.int32_data.clone(),
        ),
        TensorElemType::I32 => Tensor::new_from_raw(
            FixedDimensions::from_i64(&tensor.dims),
            TensorElemType::I32,
            tensor.raw_data().to_vec(),
        ),
        TensorElemType::Bool => Tensor::new_from_raw(
            FixedDimensions::from_i64(&tensor.dims),
            TensorElemType::Bool,
            tensor.raw_data().to_vec(),
        ),
    })
}

/// Reads the payload an initializer keeps in a sidecar file, per the
/// location/offset/length entries of `external_data`.
fn read_external_data(
    tensor: &TensorProto,
    base_dir: Option<&Path>,
) -> Result<Vec<u8>, ModelLoadError> {
    let mut location = None;
    let mut offset = 0usize;
    let mut length = None;
    for entry in tensor.external_data.iter() {
        match entry.key() {
            "location" => location = Some(entry.value().to_string()),
            "offset" => {
                offset = entry.value().parse().map_err(|_| {
                    ModelLoadError::Todo(
                        format!("Invalid external data offset: {}", entry.value()).into(),
                    )
                })?
            }
            "length" => {
                length = Some(entry.value().parse::<usize>().map_err(|_| {
                    ModelLoadError::Todo(
                        format!("Invalid external data length: {}", entry.value()).into(),
                    )
                })?)
            }
            _ => {}
        }
    }

    let location = location.ok_or(ModelLoadError::NoExternalDataLocation)?;
    let base_dir = base_dir.ok_or(ModelLoadError::NoExternalDataDir)?;
    let raw = fs::read(base_dir.join(&location))?;
    let end = length.map_or(raw.len(), |len| offset + len);
    raw.get(offset..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            ModelLoadError::Todo(
                format!("External data range {offset}..{end} out of bounds in '{location}'")
                    .into(),
            )
        })
}

impl TryFrom<DataType> for TensorElemType {
    type Error = ModelLoadError;

    fn try_from(ty: DataType) -> Result<Self, Self::Error> {
        match ty {
            DataType::Bool => Ok(TensorElemType::Bool),
            DataType::Int32 => Ok(TensorElemType::I32),
            DataType::Int64 => Ok(TensorElemType::I64),
            DataType::Float => Ok(TensorElemType::F32),
            ty => Err(ModelLoadError::Todo(
                format!("Unsupported tensor element type: {ty:?}").into(),
            )),
        }
    }
}

pub fn load_onnx_model_proto(path: impl AsRef<Path>) -> Result<ModelProto, io::Error> {
    let model = ModelProto::decode(&*fs::read(path)?)?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_value_info(name: &str, dims: &[i64]) -> ValueInfoProto {
        ValueInfoProto {
            name: Some(name.to_string()),
            r#type: Some(TypeProto {
                denotation: None,
                value: Some(TensorType(type_proto::Tensor {
                    elem_type: Some(DataType::Float as i32),
                    shape: Some(TensorShapeProto {
                        dim: dims
                            .iter()
                            .map(|&d| tensor_shape_proto::Dimension {
                                denotation: None,
                                value: Some(DimValue(d)),
                            })
                            .collect(),
                    }),
                })),
            }),
            doc_string: None,
        }
    }

    fn ints_attr(name: &str, ints: &[i64]) -> AttributeProto {
        AttributeProto {
            name: Some(name.to_string()),
            ints: ints.to_vec(),
            r#type: Some(attribute_proto::AttributeType::Ints as i32),
            ..Default::default()
        }
    }

    fn reduce_mean_proto(attrs: Vec<AttributeProto>) -> ModelProto {
        ModelProto {
            ir_version: Some(7),
            opset_import: vec![OperatorSetIdProto {
                domain: Some("".to_string()),
                version: Some(13),
            }],
            graph: Some(GraphProto {
                node: vec![NodeProto {
                    input: vec!["x".to_string()],
                    output: vec!["y".to_string()],
                    name: Some("ReduceMean_0".to_string()),
                    op_type: Some("ReduceMean".to_string()),
                    attribute: attrs,
                    ..Default::default()
                }],
                input: vec![tensor_value_info("x", &[1, 2048, 7, 7])],
                output: vec![tensor_value_info("y", &[1, 2048, 1, 1])],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn reduce_mean_with_axes_attribute() {
        let model =
            load_onnx_from_model_proto(reduce_mean_proto(vec![ints_attr("axes", &[2, 3])]), None)
                .unwrap();
        assert_eq!(model.opset_version, 13);

        let (_, node) = model.graph.nodes.iter().next().unwrap();
        let Op::ReduceMean(ref r) = node.op else {
            panic!("expected ReduceMean, got {:?}", node.op)
        };
        assert_eq!(r.axes, vec![2, 3]);
        assert!(r.keep_dims); // default when absent

        let x = model.graph.values[node.inputs[0]].clone();
        assert_eq!(x.name.as_deref(), Some("x"));
        assert_eq!(x.shape.unwrap().dims.len(), 4);
    }

    #[test]
    fn reduce_mean_without_axes_attribute() {
        let model = load_onnx_from_model_proto(reduce_mean_proto(vec![]), None).unwrap();
        let (_, node) = model.graph.nodes.iter().next().unwrap();
        let Op::ReduceMean(ref r) = node.op else {
            panic!()
        };
        assert!(r.axes.is_empty());
    }

    #[test]
    fn value_info_annotates_intermediates() {
        let mut proto = reduce_mean_proto(vec![ints_attr("axes", &[2, 3])]);
        let graph = proto.graph.as_mut().unwrap();
        graph.node.push(NodeProto {
            input: vec!["y".to_string()],
            output: vec!["z".to_string()],
            name: Some("Relu_0".to_string()),
            op_type: Some("Relu".to_string()),
            ..Default::default()
        });
        graph.output = vec![tensor_value_info("z", &[1, 2048, 1, 1])];
        graph.value_info = vec![tensor_value_info("y", &[1, 2048, 1, 1])];

        let model = load_onnx_from_model_proto(proto, None).unwrap();
        let y = model.graph.values.find_by_name("y").unwrap();
        assert_eq!(model.graph.values[y].shape.as_ref().unwrap().dims.len(), 4);
    }

    #[test]
    fn duplicate_opset_rejected() {
        let mut proto = reduce_mean_proto(vec![]);
        proto.opset_import.push(OperatorSetIdProto {
            domain: Some("ai.onnx".to_string()),
            version: Some(11),
        });
        assert!(matches!(
            load_onnx_from_model_proto(proto, None),
            Err(ModelLoadError::DuplicateOpset)
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            load_onnx("/nonexistent/model.onnx"),
            Err(ModelLoadError::Io(_))
        ));
    }

    #[test]
    fn external_data_is_embedded() {
        let dir = std::env::temp_dir();
        let payload_name = "graft_load_external_test.bin";
        let axes: [i64; 2] = [2, 3];
        let mut bytes = vec![0xffu8; 8]; // leading garbage, skipped by offset
        for a in axes {
            bytes.extend_from_slice(&a.to_le_bytes());
        }
        fs::write(dir.join(payload_name), &bytes).unwrap();

        let mut proto = reduce_mean_proto(vec![]);
        let graph = proto.graph.as_mut().unwrap();
        graph.node[0].input.push("axes".to_string());
        graph.initializer.push(TensorProto {
            dims: vec![2],
            data_type: Some(DataType::Int64 as i32),
            name: Some("axes".to_string()),
            data_location: Some(DataLocation::External as i32),
            external_data: vec![
                StringStringEntryProto {
                    key: Some("location".to_string()),
                    value: Some(payload_name.to_string()),
                },
                StringStringEntryProto {
                    key: Some("offset".to_string()),
                    value: Some("8".to_string()),
                },
                StringStringEntryProto {
                    key: Some("length".to_string()),
                    value: Some("16".to_string()),
                },
            ],
            ..Default::default()
        });

        let model = load_onnx_from_model_proto(proto, Some(&dir)).unwrap();
        let axes_val = model.graph.values.find_by_name("axes").unwrap();
        let tensor = model.graph.init_of(axes_val).unwrap();
        assert_eq!(tensor.data::<i64>(), &[2, 3]);
    }

    #[test]
    fn external_data_without_base_dir_fails() {
        let mut proto = reduce_mean_proto(vec![]);
        proto.graph.as_mut().unwrap().initializer.push(TensorProto {
            dims: vec![2],
            data_type: Some(DataType::Int64 as i32),
            name: Some("axes".to_string()),
            data_location: Some(DataLocation::External as i32),
            external_data: vec![StringStringEntryProto {
                key: Some("location".to_string()),
                value: Some("weights.bin".to_string()),
            }],
            ..Default::default()
        });
        assert!(matches!(
            load_onnx_from_model_proto(proto, None),
            Err(ModelLoadError::NoExternalDataDir)
        ));
    }
}
