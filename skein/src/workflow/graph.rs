//! DAG utilities for the workflow scheduler: topological ordering and
//! longest-path ranks.

use std::collections::HashMap;

/// Topological order over `names` with `edges` as (before, after) pairs.
/// `None` when the graph has a cycle. Edges naming unknown nodes are
/// ignored (the builder validates references separately).
pub(crate) fn topological_order(
    names: &[String],
    edges: &[(String, String)],
) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> =
        names.iter().map(|n| (n.as_str(), 0)).collect();
    let mut out_edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in edges {
        if !in_degree.contains_key(from.as_str()) || !in_degree.contains_key(to.as_str()) {
            continue;
        }
        out_edges.entry(from.as_str()).or_default().push(to.as_str());
        *in_degree.get_mut(to.as_str()).expect("known node") += 1;
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut order = Vec::with_capacity(names.len());
    while let Some(node) = queue.pop() {
        order.push(node.to_string());
        for &child in out_edges.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            let d = in_degree.get_mut(child).expect("known node");
            *d -= 1;
            if *d == 0 {
                queue.push(child);
            }
        }
    }

    (order.len() == names.len()).then_some(order)
}

/// Longest path (in edges) from each node to any sink. Ready steps are
/// started in descending rank order so the critical path is never starved
/// by wide fan-outs.
pub(crate) fn longest_path_ranks(
    names: &[String],
    edges: &[(String, String)],
) -> HashMap<String, usize> {
    let order = match topological_order(names, edges) {
        Some(order) => order,
        None => return names.iter().map(|n| (n.clone(), 0)).collect(),
    };

    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in edges {
        children.entry(from.as_str()).or_default().push(to.as_str());
    }

    let mut ranks: HashMap<String, usize> = names.iter().map(|n| (n.clone(), 0)).collect();
    for node in order.iter().rev() {
        let best = children
            .get(node.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter_map(|c| ranks.get(*c))
            .max()
            .copied();
        if let Some(best) = best {
            ranks.insert(node.clone(), best + 1);
        }
    }
    ranks
}
