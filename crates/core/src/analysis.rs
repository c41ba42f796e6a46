use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::{model::Model, value::ValueId};

/// A structural defect found by [`check_model`]. These are warnings, not
/// errors: graph surgery and saving proceed regardless, the caller only
/// logs them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckWarning {
    #[error("node '{node}' reads '{value}' which nothing produces")]
    UndefinedInput { node: String, value: String },

    #[error("graph output '{0}' is never produced")]
    UnproducedOutput(String),

    #[error("'{0}' is produced by more than one node")]
    Redefined(String),
}

pub fn check_model(model: &Model) -> Vec<CheckWarning> {
    let mut warnings = vec![];

    let mut defined: FxHashSet<ValueId> = model.graph.inits.keys().copied().collect();
    defined.extend(model.graph.inputs.iter().copied());

    for (_, node) in model.graph.nodes.iter() {
        for &output in node.outputs.iter() {
            if !defined.insert(output) {
                warnings.push(CheckWarning::Redefined(value_name(model, output)));
            }
        }
    }

    for (_, node) in model.graph.nodes.iter() {
        for &input in node.inputs.iter() {
            if !defined.contains(&input) {
                warnings.push(CheckWarning::UndefinedInput {
                    node: node.name.clone().unwrap_or_else(|| node.op.name().to_string()),
                    value: value_name(model, input),
                });
            }
        }
    }

    for &output in model.graph.outputs.iter() {
        if !defined.contains(&output) {
            warnings.push(CheckWarning::UnproducedOutput(value_name(model, output)));
        }
    }

    warnings
}

fn value_name(model: &Model, id: ValueId) -> String {
    model.graph.values[id]
        .name
        .clone()
        .unwrap_or_else(|| format!("value.{}", id.index()))
}
