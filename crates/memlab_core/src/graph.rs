//! Object graph traversal

use crate::{ObjectId, TensorLike};
use std::collections::HashSet;
use std::rc::Rc;

/// A reachable value: a tensor or something that holds named values.
#[derive(Clone)]
pub enum Node {
    Tensor(Rc<dyn TensorLike>),
    Composite(Rc<dyn Composite>),
}

impl Node {
    pub fn id(&self) -> ObjectId {
        match self {
            Node::Tensor(t) => ObjectId::of(t),
            Node::Composite(c) => ObjectId::of(c),
        }
    }
}

/// An object with named sub-values, e.g. a model with parameters and submodules.
pub trait Composite {
    fn children(&self) -> Vec<(String, Node)>;
}

/// Host facility enumerating every live tensor, in a stable order.
pub trait LiveObjects {
    fn live_tensors(&self) -> Vec<Rc<dyn TensorLike>>;
}

/// A tensor found during collection and the name it was found under.
#[derive(Clone)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: Rc<dyn TensorLike>,
    /// Found by the structural walk rather than by enumeration.
    pub structural: bool,
}

fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Depth-first walk from `root` collecting tensors under qualified names.
///
/// Children are visited in the order `Composite::children` yields them.
/// Every object is visited at most once, so cyclic graphs terminate and a
/// tensor reachable through several paths keeps the first name.
pub fn walk(root: &Node, visited: &mut HashSet<ObjectId>) -> Vec<NamedTensor> {
    let mut found = Vec::new();
    let mut stack = vec![(String::new(), root.clone())];

    while let Some((name, node)) = stack.pop() {
        if !visited.insert(node.id()) {
            continue;
        }
        match node {
            Node::Tensor(tensor) => {
                let name = if name.is_empty() { "root".to_string() } else { name };
                if let Some(grad) = tensor.grad() {
                    stack.push((qualify(&name, "grad"), Node::Tensor(grad)));
                }
                found.push(NamedTensor {
                    name,
                    tensor,
                    structural: true,
                });
            }
            Node::Composite(composite) => {
                for (child, value) in composite.children().into_iter().rev() {
                    stack.push((qualify(&name, &child), value));
                }
            }
        }
    }

    tracing::debug!(tensors = found.len(), objects = visited.len(), "structural walk finished");
    found
}
