//! Dependency-ordered loading sequence.
//!
//! Iterative depth-first traversal over an index arena. Each node is
//! `New`, `Active` (on the current path) or `Done`; reaching an `Active`
//! node again is a cycle.

use std::collections::{BTreeMap, HashMap};

use super::ModelMetadata;
use crate::error::{ShardError, ShardResult};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    Active,
    Done,
}

enum Edge<'a> {
    Known(usize),
    Missing(&'a str),
}

pub(super) fn loading_order(
    meta: &ModelMetadata,
    targets: Option<&[String]>,
) -> ShardResult<Vec<String>> {
    let ids: Vec<&str> = meta.shards.keys().map(String::as_str).collect();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let edges: Vec<Vec<Edge<'_>>> = meta
        .shards
        .values()
        .map(|record| {
            record
                .depends_on
                .iter()
                .map(|dep| match index.get(dep.as_str()) {
                    Some(&i) => Edge::Known(i),
                    None => Edge::Missing(dep.as_str()),
                })
                .collect()
        })
        .collect();

    let roots: Vec<usize> = match targets {
        Some(targets) => targets
            .iter()
            .map(|t| {
                index
                    .get(t.as_str())
                    .copied()
                    .ok_or_else(|| ShardError::UnknownShard {
                        model: meta.model_name.clone(),
                        shard_id: t.clone(),
                    })
            })
            .collect::<ShardResult<_>>()?,
        None => (0..ids.len()).collect(),
    };

    let mut state = vec![Visit::New; ids.len()];
    let mut order = Vec::with_capacity(ids.len());
    let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
    // (node, next edge to follow)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in roots {
        if state[root] != Visit::New {
            continue;
        }
        state[root] = Visit::Active;
        stack.push((root, 0));

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let Some(edge) = edges[node].get(next) else {
                state[node] = Visit::Done;
                order.push(ids[node].to_string());
                stack.pop();
                continue;
            };
            frame.1 += 1;

            match *edge {
                Edge::Missing(dep) => {
                    let entry = missing.entry(ids[node].to_string()).or_default();
                    if !entry.iter().any(|d| d == dep) {
                        entry.push(dep.to_string());
                    }
                }
                Edge::Known(child) => match state[child] {
                    Visit::Done => {}
                    Visit::Active => {
                        let start = stack
                            .iter()
                            .position(|(n, _)| *n == child)
                            .unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|(n, _)| ids[*n].to_string()).collect();
                        cycle.push(ids[child].to_string());
                        return Err(ShardError::DependencyCycle {
                            model: meta.model_name.clone(),
                            cycle,
                        });
                    }
                    Visit::New => {
                        state[child] = Visit::Active;
                        stack.push((child, 0));
                    }
                },
            }
        }
    }

    if !missing.is_empty() {
        return Err(ShardError::MissingDependencies {
            model: meta.model_name.clone(),
            missing,
        });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::super::ShardRecord;
    use super::*;

    fn meta_with(edges: &[(&str, &[&str])]) -> ModelMetadata {
        let mut meta = ModelMetadata::new("m");
        for (id, deps) in edges {
            meta.add_shard(*id, ShardRecord::new().with_dependencies(deps.iter().copied()));
        }
        meta
    }

    fn targets(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn assert_topological(meta: &ModelMetadata, order: &[String]) {
        let pos: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for id in order {
            for dep in &meta.shard(id).unwrap().depends_on {
                assert!(pos[dep.as_str()] < pos[id.as_str()], "{dep} must precede {id}");
            }
        }
    }

    #[test]
    fn test_chain_order() {
        let meta = meta_with(&[("s1", &[]), ("s2", &["s1"]), ("s3", &["s2"])]);
        let order = meta.loading_order(Some(&targets(&["s3"]))).unwrap();
        assert_eq!(order, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_closure_excludes_unrelated() {
        let meta = meta_with(&[("a", &[]), ("b", &["a"]), ("x", &[])]);
        let order = meta.loading_order(Some(&targets(&["b"]))).unwrap();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_diamond_all_shards() {
        let meta = meta_with(&[
            ("base", &[]),
            ("left", &["base"]),
            ("right", &["base"]),
            ("top", &["left", "right"]),
        ]);
        let order = meta.loading_order(None).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order.iter().filter(|id| *id == "base").count(), 1);
        assert_topological(&meta, &order);
    }

    #[test]
    fn test_cycle_detected() {
        let meta = meta_with(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        let err = meta.loading_order(None).unwrap_err();
        match err {
            ShardError::DependencyCycle { cycle, .. } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let meta = meta_with(&[("a", &["a"])]);
        assert!(matches!(
            meta.loading_order(None),
            Err(ShardError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_missing_dependency_not_omitted() {
        let meta = meta_with(&[("s1", &[]), ("s4", &["s5"])]);
        match meta.loading_order(Some(&targets(&["s4"]))).unwrap_err() {
            ShardError::MissingDependencies { missing, .. } => {
                assert_eq!(missing["s4"], vec!["s5".to_string()]);
            }
            other => panic!("expected missing dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_target() {
        let meta = meta_with(&[("s1", &[])]);
        assert!(matches!(
            meta.loading_order(Some(&targets(&["zz"]))),
            Err(ShardError::UnknownShard { .. })
        ));
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let mut meta = ModelMetadata::new("deep");
        meta.add_shard("n00000", ShardRecord::new());
        for i in 1..20_000 {
            meta.add_shard(
                format!("n{:05}", i),
                ShardRecord::new().with_dependencies([format!("n{:05}", i - 1)]),
            );
        }
        let order = meta.loading_order(Some(&targets(&["n19999"]))).unwrap();
        assert_eq!(order.len(), 20_000);
        assert_eq!(order[0], "n00000");
    }
}
