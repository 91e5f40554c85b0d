//! Resolution of deferred shapes.
//!
//! Variables declared with `shape_by_conn`, `copy_shape` or `compute_shape`
//! get their shape once the shapes they depend on are known. Resolution
//! repeats passes over the unresolved variables until no pass makes progress.
//! Whatever is left is either part of a dependency cycle or depends on a
//! variable that cannot be resolved.

use std::collections::BTreeMap;

use log::debug;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use crate::connections::Connections;
use crate::core::{ShapeSpec, VarKind, VarMeta};
use crate::model::{index_vars, CompInfo, SetupError, VarIndex};
use crate::naming::join;

fn abs_name(comps: &[CompInfo], (c, v): (usize, usize)) -> String {
    join(comps[c].owner.path(), comps[c].vars[v].name())
}

fn var(comps: &[CompInfo], (c, v): (usize, usize)) -> &VarMeta {
    &comps[c].vars[v]
}

/// Variables a deferred variable waits for.
fn dependencies(
    comps: &[CompInfo],
    index: &VarIndex,
    conns: &Connections,
    targets: &BTreeMap<&str, Vec<&str>>,
    loc: (usize, usize),
) -> Result<Vec<(usize, usize)>, SetupError> {
    let meta = var(comps, loc);
    let abs = abs_name(comps, loc);

    let deps = match meta.shape_spec() {
        ShapeSpec::Known => Vec::new(),
        ShapeSpec::ByConn if meta.kind().is_input() => conns
            .sources
            .get(&abs)
            .and_then(|src| index.get(src))
            .copied()
            .into_iter()
            .collect(),
        ShapeSpec::ByConn => targets
            .get(abs.as_str())
            .map(|tgts| tgts.iter().filter_map(|t| index.get(*t).copied()).collect())
            .unwrap_or_default(),
        ShapeSpec::Copy(other) => {
            let found = comps[loc.0]
                .vars
                .iter()
                .position(|v| v.name() == other)
                .ok_or_else(|| SetupError::UnknownCopyShape {
                    name: abs.clone(),
                    other: other.clone(),
                })?;
            vec![(loc.0, found)]
        }
        ShapeSpec::Compute(_) => comps[loc.0]
            .vars
            .iter()
            .enumerate()
            .filter(|(_, v)| v.kind() == VarKind::Input)
            .map(|(i, _)| (loc.0, i))
            .collect(),
    };

    Ok(deps)
}

/// Attempts to determine the shape of a deferred variable from its
/// dependencies.
fn try_shape(
    comps: &[CompInfo],
    loc: (usize, usize),
    deps: &[(usize, usize)],
) -> Result<Option<Vec<usize>>, SetupError> {
    let meta = var(comps, loc);

    match meta.shape_spec() {
        ShapeSpec::Known => Ok(None),
        ShapeSpec::ByConn | ShapeSpec::Copy(_) => Ok(deps
            .iter()
            .map(|&d| var(comps, d))
            .find(|d| d.is_shape_resolved())
            .map(|d| d.shape().clone())),
        ShapeSpec::Compute(f) => {
            if !deps.iter().all(|&d| var(comps, d).is_shape_resolved()) {
                return Ok(None);
            }
            let shapes: BTreeMap<String, Vec<usize>> = deps
                .iter()
                .map(|&d| {
                    let v = var(comps, d);
                    (v.name().clone(), v.shape().clone())
                })
                .collect();
            f(&shapes).map(Some).map_err(|message| SetupError::ComputeShape {
                name: abs_name(comps, loc),
                message,
            })
        }
    }
}

/// Resolves all deferred shapes in place.
pub(crate) fn resolve(comps: &mut [CompInfo], conns: &Connections) -> Result<(), SetupError> {
    let index = index_vars(comps);
    let targets = conns.targets();

    let mut pending: Vec<(usize, usize)> = index
        .values()
        .copied()
        .filter(|&loc| !var(comps, loc).is_shape_resolved())
        .collect();

    let mut deps = BTreeMap::new();
    for &loc in &pending {
        deps.insert(loc, dependencies(comps, &index, conns, &targets, loc)?);
    }

    loop {
        let mut progress = false;
        let mut still = Vec::new();

        for loc in pending {
            match try_shape(comps, loc, &deps[&loc])? {
                Some(shape) => {
                    debug!("shape of '{}' resolved to {:?}", abs_name(comps, loc), shape);
                    let owner = comps[loc.0].owner.clone();
                    comps[loc.0].vars[loc.1]
                        .resolve_shape(shape)
                        .map_err(|source| SetupError::declaration(&owner, source))?;
                    progress = true;
                }
                None => still.push(loc),
            }
        }

        pending = still;
        if pending.is_empty() {
            return Ok(());
        }
        if !progress {
            break;
        }
    }

    // Report cycles among the leftovers first, they are the usual cause.
    let mut graph = DiGraph::<(usize, usize), ()>::new();
    let nodes: BTreeMap<(usize, usize), _> =
        pending.iter().map(|&loc| (loc, graph.add_node(loc))).collect();
    for &loc in &pending {
        for dep in &deps[&loc] {
            if let Some(&to) = nodes.get(dep) {
                graph.add_edge(nodes[&loc], to, ());
            }
        }
    }

    for scc in tarjan_scc(&graph) {
        let cyclic = scc.len() > 1 || graph.contains_edge(scc[0], scc[0]);
        if cyclic {
            let mut names: Vec<String> = scc.iter().map(|&n| abs_name(comps, graph[n])).collect();
            names.sort();
            return Err(SetupError::ShapeCycle(names));
        }
    }

    let mut names: Vec<String> = pending.iter().map(|&loc| abs_name(comps, loc)).collect();
    names.sort();
    Err(SetupError::UnresolvedShapes(names))
}
