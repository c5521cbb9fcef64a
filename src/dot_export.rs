//! GraphViz rendering of a points-to graph.

use crate::graph::DsGraph;
use crate::ir::{Module, Value};

/// Write `g` as a `.dot` graph: scalar values point at their classes, and
/// classes point at each other through their labeled edge offsets.
pub fn write_dot(
    g: &DsGraph,
    module: &Module,
    w: &mut impl std::io::Write,
) -> std::io::Result<()> {
    #[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
    enum Node {
        Scalar(Value),
        Class(usize),
    }
    type Edge = (Node, Node, String);

    struct View<'a> {
        g: &'a DsGraph,
        module: &'a Module,
    }

    impl<'a> dot::Labeller<'a, Node, Edge> for View<'a> {
        fn graph_id(&'a self) -> dot::Id<'a> {
            dot::Id::new("points_to").unwrap()
        }
        fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
            dot::Id::new(match n {
                Node::Scalar(Value::Local { func, local }) => {
                    format!("v_l{}_{}", func.0, local.0)
                }
                Node::Scalar(Value::Global(g)) => format!("v_g{}", g.0),
                Node::Scalar(Value::Func(f)) => format!("v_f{}", f.0),
                Node::Class(slot) => format!("n{}", slot),
            })
            .unwrap()
        }
        fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
            match n {
                Node::Scalar(v) => dot::LabelText::label(self.module.value_name(*v)),
                Node::Class(slot) => {
                    let h = self.g.store().handle_for_slot(*slot);
                    let node = self.g.store().node(h);
                    let mut label = format!("n{}: size={}", slot, node.size());
                    if !node.flags().is_empty() {
                        label.push_str(&format!("\n{:?}", node.flags()));
                    }
                    let globals: Vec<String> = node
                        .globals_iter()
                        .map(|s| match s {
                            crate::ir::GlobalSym::Var(g) => {
                                format!("@{}", self.module.global(*g).name)
                            }
                            crate::ir::GlobalSym::Func(f) => {
                                format!("@{}", self.module.function(*f).name)
                            }
                        })
                        .collect();
                    if !globals.is_empty() {
                        label.push_str(&format!("\n{}", globals.join(" ")));
                    }
                    dot::LabelText::escaped(label.replace('\n', "\\l"))
                }
            }
        }
        fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
            match n {
                Node::Scalar(_) => None,
                Node::Class(_) => Some(dot::LabelText::label("box")),
            }
        }
        fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
            dot::LabelText::label(e.2.clone())
        }
    }

    fn nodes_and_edges(g: &DsGraph) -> (Vec<Node>, Vec<Edge>) {
        let mut nodes: Vec<Node> = Vec::new();
        let mut edges: Vec<Edge> = Vec::new();
        for (v, h) in g.scalar_entries() {
            let slot = g.store().canonical_slot(h);
            nodes.push(Node::Scalar(v));
            edges.push((Node::Scalar(v), Node::Class(slot), String::new()));
        }
        for (slot, node) in g.store().live_slots() {
            nodes.push(Node::Class(slot));
            for (off, t) in node.edges_iter() {
                let t = g.store().canonical_slot(t);
                edges.push((Node::Class(slot), Node::Class(t), format!("+{}", off)));
            }
        }
        nodes.sort();
        nodes.dedup();
        (nodes, edges)
    }

    impl<'a> dot::GraphWalk<'a, Node, Edge> for View<'a> {
        fn nodes(&self) -> dot::Nodes<'a, Node> {
            nodes_and_edges(self.g).0.into()
        }
        fn edges(&'a self) -> dot::Edges<'a, Edge> {
            nodes_and_edges(self.g).1.into()
        }
        fn source(&self, e: &Edge) -> Node {
            e.0.clone()
        }
        fn target(&self, e: &Edge) -> Node {
            e.1.clone()
        }
    }

    dot::render(&View { g, module }, w)
}

/// Generate a `.dot` file representing the graph.
pub fn generate_dot(g: &DsGraph, module: &Module) -> String {
    let mut s: Vec<u8> = vec![];
    write_dot(g, module, &mut s).unwrap();
    String::from_utf8(s).unwrap()
}
