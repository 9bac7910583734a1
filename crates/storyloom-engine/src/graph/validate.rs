use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use storyloom_core::error::{LoomError, Result};
use storyloom_core::types::{Edge, Node, EXTERNAL_INPUT};

/// Check that `nodes` and `edges` form a well-formed DAG.
///
/// Checks run in this order: every edge endpoint exists, the node set is
/// non-empty, node ids are unique, and no cycle exists. Edges from the
/// external-input pseudo-node are exempt from the existence check on their
/// source side.
pub fn validate_dag(nodes: &[Node], edges: &[Edge]) -> Result<()> {
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

    for edge in edges {
        if !edge.is_external() && !ids.contains(edge.from.as_str()) {
            return Err(unknown_reference(edge, &edge.from));
        }
        if !ids.contains(edge.to.as_str()) {
            return Err(unknown_reference(edge, &edge.to));
        }
    }

    if nodes.is_empty() {
        return Err(LoomError::InvalidGraph(
            "recipe must have at least one node".into(),
        ));
    }

    if ids.len() != nodes.len() {
        let mut seen = HashSet::new();
        let dup = nodes
            .iter()
            .find(|n| !seen.insert(n.id.as_str()))
            .map(|n| n.id.as_str())
            .unwrap_or_default();
        return Err(LoomError::InvalidGraph(format!("duplicate node id '{}'", dup)));
    }
    if ids.contains(EXTERNAL_INPUT) {
        return Err(LoomError::InvalidGraph(format!(
            "node id '{}' is reserved for the external input",
            EXTERNAL_INPUT
        )));
    }

    if let Some(node_id) = find_cycle(nodes, edges) {
        return Err(LoomError::InvalidGraph(format!(
            "cycle detected involving node {}",
            node_id
        )));
    }

    Ok(())
}

fn unknown_reference(edge: &Edge, missing: &str) -> LoomError {
    LoomError::InvalidGraph(format!(
        "unknown node reference: edge {} -> {} references missing node '{}'",
        edge.from, edge.to, missing
    ))
}

/// Successors of each node in edge declaration order, ignoring external edges.
fn adjacency<'a>(edges: &'a [Edge]) -> HashMap<&'a str, Vec<&'a str>> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges.iter().filter(|e| !e.is_external()) {
        adj.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }
    adj
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search tracking the nodes currently on the stack. Returns the
/// node that was reached again while still being visited.
fn find_cycle(nodes: &[Node], edges: &[Edge]) -> Option<String> {
    let adj = adjacency(edges);
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for start in nodes {
        if marks.contains_key(start.id.as_str()) {
            continue;
        }
        // (node, index of next successor to explore)
        let mut stack: Vec<(&str, usize)> = vec![(start.id.as_str(), 0)];
        marks.insert(start.id.as_str(), Mark::Visiting);

        while let Some((node, next)) = stack.last_mut() {
            let succ = adj.get(*node).and_then(|s| s.get(*next)).copied();
            *next += 1;
            match succ {
                Some(child) => match marks.get(child) {
                    Some(Mark::Visiting) => return Some(child.to_string()),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                },
                None => {
                    marks.insert(*node, Mark::Done);
                    stack.pop();
                }
            }
        }
    }
    None
}

/// Validate the graph and return its execution order.
///
/// Kahn's algorithm; among nodes that are ready at the same time the one
/// declared first runs first, so the order is stable for a given definition.
pub fn topological_order(nodes: &[Node], edges: &[Edge]) -> Result<Vec<String>> {
    validate_dag(nodes, edges)?;

    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();
    let adj = adjacency(edges);

    let mut in_degree = vec![0usize; nodes.len()];
    for edge in edges.iter().filter(|e| !e.is_external()) {
        in_degree[index[edge.to.as_str()]] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(i)) = ready.pop() {
        let id = nodes[i].id.as_str();
        order.push(id.to_string());
        for child in adj.get(id).into_iter().flatten() {
            let c = index[child];
            in_degree[c] -= 1;
            if in_degree[c] == 0 {
                ready.push(Reverse(c));
            }
        }
    }

    if order.len() != nodes.len() {
        // validate_dag already rejects cycles; kept as an internal consistency check.
        return Err(LoomError::InvalidGraph(
            "graph could not be fully ordered".into(),
        ));
    }
    Ok(order)
}

/// Every node with a path to `node_id`, excluding the node itself.
pub fn ancestors(node_id: &str, edges: &[Edge]) -> HashSet<String> {
    let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges.iter().filter(|e| !e.is_external()) {
        parents.entry(edge.to.as_str()).or_default().push(edge.from.as_str());
    }

    let mut found = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([node_id]);
    while let Some(current) = queue.pop_front() {
        for parent in parents.get(current).into_iter().flatten() {
            if *parent != node_id && found.insert(parent.to_string()) {
                queue.push_back(parent);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter().map(|id| Node::text(*id, "p")).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<Edge> {
        pairs.iter().map(|(a, b)| Edge::new(*a, *b)).collect()
    }

    fn assert_respects_edges(order: &[String], edges: &[Edge]) {
        let pos: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for e in edges.iter().filter(|e| !e.is_external()) {
            assert!(pos[e.from.as_str()] < pos[e.to.as_str()], "{} !< {}", e.from, e.to);
        }
    }

    #[test]
    fn test_three_cycle_rejected() {
        let err = validate_dag(
            &nodes(&["a", "b", "c"]),
            &edges(&[("a", "b"), ("b", "c"), ("c", "a")]),
        )
        .unwrap_err();
        match err {
            LoomError::InvalidGraph(msg) => {
                assert!(msg.starts_with("cycle detected involving node "), "{}", msg)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        let err = validate_dag(&nodes(&["a"]), &edges(&[("a", "a")])).unwrap_err();
        assert_eq!(err.to_string(), "Invalid graph: cycle detected involving node a");
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let err = validate_dag(
            &nodes(&["root", "x", "y"]),
            &edges(&[("root", "x"), ("x", "y"), ("y", "x")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn test_unknown_reference_checked_before_empty_set() {
        let err = validate_dag(&[], &edges(&[("a", "b")])).unwrap_err();
        assert!(err.to_string().contains("unknown node reference"));

        let err = validate_dag(&[], &[]).unwrap_err();
        assert!(err.to_string().contains("at least one node"));
    }

    #[test]
    fn test_dangling_target_and_source() {
        let ns = nodes(&["a", "b"]);
        assert!(validate_dag(&ns, &edges(&[("a", "zz")])).is_err());
        assert!(validate_dag(&ns, &edges(&[("zz", "a")])).is_err());
        // External input is not a node but is a valid source.
        assert!(validate_dag(&ns, &[Edge::external("topic", "a", "topic")]).is_ok());
        // ...and never a valid target.
        assert!(validate_dag(&ns, &[Edge::new("a", EXTERNAL_INPUT)]).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = validate_dag(&nodes(&["a", "a"]), &[]).unwrap_err();
        assert!(err.to_string().contains("duplicate node id 'a'"));
    }

    #[test]
    fn test_order_respects_edges() {
        let ns = nodes(&["c", "b", "a", "d"]);
        let es = edges(&[("a", "b"), ("b", "c"), ("a", "d"), ("d", "c")]);
        let order = topological_order(&ns, &es).unwrap();
        assert_eq!(order.len(), 4);
        assert_respects_edges(&order, &es);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let ns = nodes(&["z", "m", "a"]);
        assert_eq!(topological_order(&ns, &[]).unwrap(), vec!["z", "m", "a"]);

        // b and c are both ready after a; c is declared first.
        let ns = nodes(&["a", "c", "b", "d"]);
        let es = edges(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        assert_eq!(topological_order(&ns, &es).unwrap(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_order_is_deterministic() {
        let ns = nodes(&["e", "d", "c", "b", "a"]);
        let es = edges(&[("a", "c"), ("b", "c"), ("c", "d"), ("b", "e")]);
        let first = topological_order(&ns, &es).unwrap();
        for _ in 0..10 {
            assert_eq!(topological_order(&ns, &es).unwrap(), first);
        }
    }

    #[test]
    fn test_parallel_edges_between_same_pair() {
        let ns = nodes(&["a", "b"]);
        let es = vec![
            Edge::wired("a", "output", "b", "x"),
            Edge::wired("a", "output", "b", "y"),
        ];
        assert_eq!(topological_order(&ns, &es).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_ancestors_exclude_siblings() {
        // a -> b -> d, c -> d, a -> e (sibling branch)
        let es = edges(&[("a", "b"), ("b", "d"), ("c", "d"), ("a", "e")]);
        let found = ancestors("d", &es);
        let expected: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(found, expected);
        assert!(ancestors("a", &es).is_empty());
    }
}
