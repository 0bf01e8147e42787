use super::GraphNode;
use crate::tensor::Result;
use std::collections::HashSet;
use std::rc::Rc;

/// Runs every node reachable from `root` in reverse topological order.
///
/// The sort is iterative: an unrolled ConvLSTM graph is thousands of nodes deep, which would
/// overflow the stack with a recursive walk.
pub fn backward(root: Option<Rc<dyn GraphNode>>) -> Result<()> {
    let Some(root) = root else { return Ok(()) };

    for node in topological_order(root).iter().rev() {
        node.backward()?;
    }
    Ok(())
}

/// Post-order DFS over `parents()`: every node appears after all of its parents.
fn topological_order(root: Rc<dyn GraphNode>) -> Vec<Rc<dyn GraphNode>> {
    let mut topo = Vec::new();
    // Node identity is the data pointer of the Rc allocation
    let mut visited: HashSet<*const ()> = HashSet::new();
    let mut stack: Vec<(Rc<dyn GraphNode>, bool)> = vec![(root, false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            topo.push(node);
            continue;
        }
        if !visited.insert(Rc::as_ptr(&node) as *const ()) {
            continue;
        }

        let parents = node.parents();
        stack.push((node, true));
        for parent in parents {
            if !visited.contains(&(Rc::as_ptr(&parent) as *const ())) {
                stack.push((parent, false));
            }
        }
    }

    topo
}
