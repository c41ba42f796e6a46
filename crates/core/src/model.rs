use rustc_hash::{FxHashMap, FxHashSet};

use crate::{graph::Graph, node::NodeId, value::ValueId};

/// A loaded model: a graph plus the opset version it was exported with.
/// Lifecycle is load, mutate, save; one thread, one owner.
#[derive(Default, Clone)]
pub struct Model {
    pub graph: Graph,
    pub opset_version: i64,
}

impl Model {
    /// Maps each value to the nodes consuming it.
    pub fn get_value_users(&self) -> FxHashMap<ValueId, FxHashSet<NodeId>> {
        let mut value_users: FxHashMap<ValueId, FxHashSet<NodeId>> = FxHashMap::default();

        for (node_id, node) in self.graph.nodes.iter() {
            for &input in node.inputs.iter() {
                value_users.entry(input).or_default().insert(node_id);
            }
        }

        value_users
    }

    pub fn topo_sort_nodes(&self) -> Vec<NodeId> {
        let value_users = self.get_value_users();

        let mut nodes = vec![];
        let mut num_node_inputs = FxHashMap::default();
        let mut que = vec![];

        let mut consts = self.graph.inits.keys().copied().collect::<FxHashSet<_>>();
        consts.extend(self.graph.inputs.iter().copied());

        for (id, node) in self.graph.nodes.iter() {
            let inputs = &node.inputs.iter().copied().collect::<FxHashSet<_>>() - &consts;
            num_node_inputs.insert(id, inputs.len());
            if inputs.is_empty() {
                que.push(id);
            }
        }

        while let Some(id) = que.pop() {
            nodes.push(id);
            for output in self.graph.nodes[id].outputs.iter() {
                let Some(users) = value_users.get(output) else {
                    continue;
                };
                for &n in users {
                    let remain = num_node_inputs.get_mut(&n).unwrap();
                    *remain -= 1;
                    if *remain == 0 {
                        que.push(n);
                    }
                }
            }
        }

        nodes
    }
}
