use std::time::Instant;

use crate::{
    model::Model,
    node::{Node, NodeId},
    op::{Op, ReduceMean},
    tensor::TensorElemType,
};

/// What became of a single `ReduceMean` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Replaced,
    Unchanged(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Axes are neither an attribute nor a resolvable constant input,
    /// and the declared input shape does not allow the fallback.
    AxesUnresolved,
    /// Axes resolved but do not cover exactly the two trailing axes of
    /// a rank-4 tensor.
    NotGlobalReduction { axes: Vec<i64> },
    /// `keepdims=0` drops the reduced axes; `GlobalAveragePool` keeps
    /// them, so the two are not equivalent.
    KeepDimsDisabled,
}

#[derive(Debug, Default)]
pub struct RewriteSummary {
    pub replaced: usize,
    /// Nodes left untouched, with the reason, in graph order.
    pub skipped: Vec<(Option<String>, SkipReason)>,
}

enum GlobalPool {
    ByAxes,
    /// Axes unknown but the declared shape makes a global reduction the
    /// only sensible reading. Looser than `ByAxes`.
    ByShapeFallback,
}

/// Replaces every `ReduceMean` that averages over the full spatial
/// extent of a rank-4 tensor with `GlobalAveragePool`. Replacement is
/// one-for-one and in place: the new node reuses the old node's arena
/// slot and output values, so downstream wiring is untouched.
pub fn rewrite_global_avg_pool(model: &mut Model) -> RewriteSummary {
    let start = Instant::now();
    let nodes = model.topo_sort_nodes();

    let mut summary = RewriteSummary::default();
    for node_id in nodes {
        match classify_and_maybe_replace(model, node_id) {
            None => {}
            Some(Outcome::Replaced) => summary.replaced += 1,
            Some(Outcome::Unchanged(reason)) => {
                let name = model.graph.nodes[node_id].name.clone();
                log::warn!(
                    "rewrite_global_avg_pool: leaving {} untouched: {reason:?}",
                    name.as_deref().unwrap_or("(unnamed)")
                );
                summary.skipped.push((name, reason));
            }
        }
    }

    log::info!(
        "rewrite_global_avg_pool({}): {:?}",
        summary.replaced,
        start.elapsed()
    );

    summary
}

/// Classifies one node and, if it is a global-average-pool in disguise,
/// rewrites it in place. Returns `None` for nodes that are not
/// `ReduceMean` at all.
pub fn classify_and_maybe_replace(model: &mut Model, node_id: NodeId) -> Option<Outcome> {
    let node = &model.graph.nodes[node_id];
    let Op::ReduceMean(ref reduce) = node.op else {
        return None;
    };

    match classify(model, node, reduce) {
        Ok(GlobalPool::ByAxes) => {}
        Ok(GlobalPool::ByShapeFallback) => {
            log::warn!(
                "rewrite_global_avg_pool: {} matched on declared shape alone",
                node.name.as_deref().unwrap_or("(unnamed)")
            );
        }
        Err(reason) => return Some(Outcome::Unchanged(reason)),
    }

    let replacement = Node::new(Op::GlobalAveragePool)
        .with_name(rename(node.name.clone()))
        .with_in(node.inputs[0])
        .with_outs(node.outputs.clone());
    model.graph.nodes[node_id] = replacement;

    Some(Outcome::Replaced)
}

fn classify(model: &Model, node: &Node, reduce: &ReduceMean) -> Result<GlobalPool, SkipReason> {
    if !reduce.keep_dims {
        return Err(SkipReason::KeepDimsDisabled);
    }

    let axes = resolve_axes(model, node, reduce);
    let shape = model.graph.values[node.inputs[0]].shape.as_ref();

    match (axes, shape) {
        (Some(axes), Some(shape)) => {
            let rank = shape.dims.len();
            // Normalizing by `axis mod rank` accepts {-2, -1} and
            // rejects the {-2, -3} spelling some exporters emit.
            let mut normalized: Vec<i64> = axes
                .iter()
                .map(|&a| a.rem_euclid(rank as i64))
                .collect();
            normalized.sort_unstable();
            if rank == 4 && normalized == [2, 3] {
                Ok(GlobalPool::ByAxes)
            } else {
                Err(SkipReason::NotGlobalReduction { axes })
            }
        }
        (Some(axes), None) => {
            let mut sorted = axes.clone();
            sorted.sort_unstable();
            if sorted == [2, 3] {
                // NCHW assumed; without a declared shape this is the
                // best that can be done.
                Ok(GlobalPool::ByAxes)
            } else if axes.iter().any(|&a| a < 0) {
                // Negative axes need the rank to normalize.
                Err(SkipReason::AxesUnresolved)
            } else {
                Err(SkipReason::NotGlobalReduction { axes })
            }
        }
        (None, Some(shape)) if shape.dims.len() == 4 => {
            match (shape.dims[2].as_fixed(), shape.dims[3].as_fixed()) {
                (Some(h), Some(w)) if h > 1 && w > 1 => Ok(GlobalPool::ByShapeFallback),
                _ => Err(SkipReason::AxesUnresolved),
            }
        }
        (None, _) => Err(SkipReason::AxesUnresolved),
    }
}

/// Axes from the attribute when present, else from a constant second
/// input (opset 13 moved them there).
fn resolve_axes(model: &Model, node: &Node, reduce: &ReduceMean) -> Option<Vec<i64>> {
    if !reduce.axes.is_empty() {
        return Some(reduce.axes.clone());
    }

    let &axes_in = node.inputs.get(1)?;
    let init = model.graph.init_of(axes_in)?;
    match init.elem_ty() {
        TensorElemType::I64 => Some(init.data::<i64>().to_vec()),
        TensorElemType::I32 => Some(init.data::<i32>().iter().map(|&a| a as i64).collect()),
        _ => None,
    }
}

fn rename(name: Option<String>) -> Option<String> {
    name.map(|n| {
        if n.contains("ReduceMean") {
            n.replace("ReduceMean", "GAP")
        } else {
            format!("{n}_gap")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{rewrite_global_avg_pool, SkipReason};
    use crate::{
        analysis::check_model,
        dim::Dimensions,
        model::Model,
        node::{Node, NodeId},
        op::{Op, ReduceMean},
        tensor::{Tensor, TensorElemType, TypedShape},
    };

    struct Setup {
        attr_axes: Vec<i64>,
        keep_dims: bool,
        input_shape: Option<Vec<usize>>,
        init_axes: Option<Vec<i64>>,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                attr_axes: vec![],
                keep_dims: true,
                input_shape: None,
                init_axes: None,
            }
        }
    }

    fn reduce_mean_model(setup: Setup) -> (Model, NodeId) {
        let mut m = Model::default();
        m.opset_version = 13;

        let x = if let Some(shape) = setup.input_shape {
            let dims: Dimensions = crate::fixed_dim::FixedDimensions(shape).into();
            m.graph.values.new_val_named_and_shaped(
                "input",
                TypedShape::new(dims, TensorElemType::F32),
            )
        } else {
            m.graph.values.new_val_named("input")
        };
        let out = m.graph.values.new_val_named("output");
        m.graph.inputs.push(x);
        m.graph.outputs.push(out);

        let mut node = Node::new(Op::ReduceMean(ReduceMean {
            axes: setup.attr_axes,
            keep_dims: setup.keep_dims,
        }))
        .with_name("ReduceMean_0".to_string())
        .with_in(x)
        .with_out(out);

        if let Some(axes) = setup.init_axes {
            let axes_val = m.graph.values.new_val_named("axes");
            let len = axes.len();
            m.graph
                .inits
                .insert(axes_val, Tensor::new::<i64>(vec![len].into(), axes));
            node = node.with_in(axes_val);
        }

        let id = m.graph.add_node(node);
        (m, id)
    }

    #[test]
    fn replaced_for_trailing_axes() {
        let (mut m, id) = reduce_mean_model(Setup {
            attr_axes: vec![2, 3],
            input_shape: Some(vec![1, 2048, 7, 7]),
            ..Setup::default()
        });
        let out = m.graph.nodes[id].outputs.clone();
        let count = m.graph.nodes.len();

        let summary = rewrite_global_avg_pool(&mut m);

        assert_eq!(summary.replaced, 1);
        assert!(summary.skipped.is_empty());
        let node = &m.graph.nodes[id];
        assert_eq!(node.op, Op::GlobalAveragePool);
        assert_eq!(node.name.as_deref(), Some("GAP_0"));
        assert_eq!(node.inputs.len(), 1);
        assert_eq!(node.outputs, out);
        assert_eq!(m.graph.nodes.len(), count);
        assert!(check_model(&m).is_empty());
    }

    #[test]
    fn replaced_without_declared_shape() {
        let (mut m, id) = reduce_mean_model(Setup {
            attr_axes: vec![2, 3],
            ..Setup::default()
        });
        assert_eq!(rewrite_global_avg_pool(&mut m).replaced, 1);
        assert_eq!(m.graph.nodes[id].op, Op::GlobalAveragePool);
    }

    #[test]
    fn negative_axes_normalized() {
        let (mut m, id) = reduce_mean_model(Setup {
            attr_axes: vec![-2, -1],
            input_shape: Some(vec![1, 2048, 7, 7]),
            ..Setup::default()
        });
        assert_eq!(rewrite_global_avg_pool(&mut m).replaced, 1);
        assert_eq!(m.graph.nodes[id].op, Op::GlobalAveragePool);
    }

    #[test]
    fn misencoded_negative_axes_left_alone() {
        // {-2, -3} normalizes to {1, 2}, not the two trailing axes.
        let (mut m, id) = reduce_mean_model(Setup {
            attr_axes: vec![-2, -3],
            input_shape: Some(vec![1, 2048, 7, 7]),
            ..Setup::default()
        });
        let summary = rewrite_global_avg_pool(&mut m);
        assert_eq!(summary.replaced, 0);
        assert_eq!(
            summary.skipped,
            vec![(
                Some("ReduceMean_0".to_string()),
                SkipReason::NotGlobalReduction { axes: vec![-2, -3] }
            )]
        );
        assert!(matches!(m.graph.nodes[id].op, Op::ReduceMean(_)));
    }

    #[test]
    fn leading_axes_left_alone() {
        let (mut m, id) = reduce_mean_model(Setup {
            attr_axes: vec![0, 1],
            input_shape: Some(vec![1, 2048, 7, 7]),
            ..Setup::default()
        });
        let summary = rewrite_global_avg_pool(&mut m);
        assert_eq!(summary.replaced, 0);
        assert!(matches!(
            summary.skipped[0].1,
            SkipReason::NotGlobalReduction { .. }
        ));
        assert!(matches!(m.graph.nodes[id].op, Op::ReduceMean(_)));
    }

    #[test]
    fn axes_from_constant_input() {
        let (mut m, id) = reduce_mean_model(Setup {
            init_axes: Some(vec![2, 3]),
            ..Setup::default()
        });
        let summary = rewrite_global_avg_pool(&mut m);
        assert_eq!(summary.replaced, 1);
        // The axes input is dropped with the rewrite.
        assert_eq!(m.graph.nodes[id].inputs.len(), 1);
    }

    #[test]
    fn shape_fallback() {
        let (mut m, id) = reduce_mean_model(Setup {
            input_shape: Some(vec![1, 2048, 7, 7]),
            ..Setup::default()
        });
        assert_eq!(rewrite_global_avg_pool(&mut m).replaced, 1);
        assert_eq!(m.graph.nodes[id].op, Op::GlobalAveragePool);
    }

    #[test]
    fn shape_fallback_needs_spatial_extent() {
        let (mut m, id) = reduce_mean_model(Setup {
            input_shape: Some(vec![1, 2048, 1, 7]),
            ..Setup::default()
        });
        let summary = rewrite_global_avg_pool(&mut m);
        assert_eq!(summary.replaced, 0);
        assert_eq!(summary.skipped[0].1, SkipReason::AxesUnresolved);
        assert!(matches!(m.graph.nodes[id].op, Op::ReduceMean(_)));
    }

    #[test]
    fn fully_unresolved_left_alone() {
        let (mut m, id) = reduce_mean_model(Setup::default());
        let summary = rewrite_global_avg_pool(&mut m);
        assert_eq!(summary.replaced, 0);
        assert_eq!(
            summary.skipped,
            vec![(
                Some("ReduceMean_0".to_string()),
                SkipReason::AxesUnresolved
            )]
        );
        assert!(matches!(m.graph.nodes[id].op, Op::ReduceMean(_)));
    }

    #[test]
    fn keep_dims_disabled_left_alone() {
        let (mut m, id) = reduce_mean_model(Setup {
            attr_axes: vec![2, 3],
            keep_dims: false,
            input_shape: Some(vec![1, 2048, 7, 7]),
            ..Setup::default()
        });
        let summary = rewrite_global_avg_pool(&mut m);
        assert_eq!(summary.replaced, 0);
        assert_eq!(summary.skipped[0].1, SkipReason::KeepDimsDisabled);
        assert!(matches!(m.graph.nodes[id].op, Op::ReduceMean(_)));
    }

    #[test]
    fn identity_without_candidates() {
        let mut m = Model::default();
        let x = m.graph.values.new_val_named("x");
        let y = m.graph.values.new_val_named("y");
        m.graph.inputs.push(x);
        m.graph.outputs.push(y);
        m.graph.add_node(Node::new(Op::ReLU).with_in(x).with_out(y));

        let summary = rewrite_global_avg_pool(&mut m);
        assert_eq!(summary.replaced, 0);
        assert!(summary.skipped.is_empty());
        assert_eq!(m.graph.nodes.len(), 1);
    }

    #[test]
    fn idempotent() {
        let (mut m, id) = reduce_mean_model(Setup {
            attr_axes: vec![2, 3],
            input_shape: Some(vec![1, 2048, 7, 7]),
            ..Setup::default()
        });
        assert_eq!(rewrite_global_avg_pool(&mut m).replaced, 1);
        let after_first = m.graph.nodes[id].clone();

        let summary = rewrite_global_avg_pool(&mut m);
        assert_eq!(summary.replaced, 0);
        assert!(summary.skipped.is_empty());
        assert_eq!(m.graph.nodes[id], after_first);
    }
}
