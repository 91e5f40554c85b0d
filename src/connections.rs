//! Connection graph of the model.
//!
//! Sources of inputs come from three places, checked in this order:
//!
//! * explicit `connect(src, tgt)` calls of the groups,
//! * implicit connections, i.e., an output and inputs promoted to the same
//!   name in some group,
//! * automatic independent outputs created for inputs that have no source.
//!
//! Every input ends up with exactly one source output. An input that would
//! get two different sources is an error.

use std::collections::{BTreeMap, HashMap, HashSet};

use approx::relative_eq;
use log::{debug, warn};

use crate::core::{VarKind, VarMeta};
use crate::group::{Group, InputDefaults, Subsystem};
use crate::model::{CompInfo, SetupError, VarIndex, AUTO_IVC};
use crate::naming::{join, Naming, Scope};
use crate::units;

/// Resolved sources of all inputs.
#[derive(Debug, Clone, Default)]
pub(crate) struct Connections {
    /// Absolute name of an input to the absolute name of its source.
    pub(crate) sources: BTreeMap<String, String>,
}

impl Connections {
    /// Inputs grouped by their source.
    pub(crate) fn targets(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut targets: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (tgt, src) in &self.sources {
            targets.entry(src.as_str()).or_default().push(tgt.as_str());
        }
        targets
    }
}

fn meta<'a>(comps: &'a [CompInfo], index: &VarIndex, abs: &str) -> Option<&'a VarMeta> {
    index.get(abs).map(|&(c, v)| &comps[c].vars[v])
}

fn kind(comps: &[CompInfo], index: &VarIndex, abs: &str) -> Option<VarKind> {
    meta(comps, index, abs).map(VarMeta::kind)
}

/// Resolves all connections and appends the automatic independent outputs
/// to the first component of `comps`.
pub(crate) fn resolve(
    root: &Group,
    naming: &Naming,
    comps: &mut [CompInfo],
    index: &VarIndex,
    require_defaults: bool,
) -> Result<Connections, SetupError> {
    let mut sources = BTreeMap::new();

    connect_explicit(root, "", naming, comps, index, &mut HashSet::new(), &mut sources)?;
    connect_implicit(naming, comps, index, &mut sources)?;

    let auto = auto_ivc(root, naming, comps, index, &sources, require_defaults)?;
    for (var, inputs) in auto {
        let abs = join(AUTO_IVC, var.name());
        for input in inputs {
            sources.insert(input, abs.clone());
        }
        comps[0].vars.push(var);
    }

    debug!("resolved {} connections", sources.len());
    Ok(Connections { sources })
}

fn check_kinds(
    comps: &[CompInfo],
    index: &VarIndex,
    src: &str,
    tgt: &str,
) -> Result<(), SetupError> {
    let src_discrete = kind(comps, index, src).map_or(false, |k| k.is_discrete());
    let tgt_discrete = kind(comps, index, tgt).map_or(false, |k| k.is_discrete());

    if src_discrete != tgt_discrete {
        return Err(SetupError::DiscreteMismatch {
            src: src.to_string(),
            tgt: tgt.to_string(),
            src_kind: if src_discrete { "discrete" } else { "continuous" },
            tgt_kind: if tgt_discrete { "discrete" } else { "continuous" },
        });
    }

    Ok(())
}

fn insert_source(
    sources: &mut BTreeMap<String, String>,
    tgt: &str,
    src: &str,
) -> Result<(), SetupError> {
    match sources.get(tgt) {
        Some(existing) if existing != src => Err(SetupError::DuplicateConnection {
            target: tgt.to_string(),
            src: src.to_string(),
            existing: existing.clone(),
        }),
        _ => {
            sources.insert(tgt.to_string(), src.to_string());
            Ok(())
        }
    }
}

fn resolve_output(
    scope: &Scope,
    path: &str,
    name: &str,
    tgt: &str,
    comps: &[CompInfo],
    index: &VarIndex,
) -> Result<String, SetupError> {
    if let Some(abs) = scope.outputs.get(name) {
        return Ok(abs.clone());
    }

    let abs = join(path, name);
    match kind(comps, index, &abs) {
        Some(k) if !k.is_input() => Ok(abs),
        Some(_) => Err(SetupError::ConnectFromInput {
            group: path.to_string(),
            src: name.to_string(),
            tgt: tgt.to_string(),
        }),
        None if scope.inputs.contains_key(name) => Err(SetupError::ConnectFromInput {
            group: path.to_string(),
            src: name.to_string(),
            tgt: tgt.to_string(),
        }),
        None => Err(SetupError::UnknownConnectionEnd {
            group: path.to_string(),
            src: name.to_string(),
            tgt: tgt.to_string(),
            missing: name.to_string(),
        }),
    }
}

fn resolve_inputs(
    scope: &Scope,
    path: &str,
    src: &str,
    name: &str,
    comps: &[CompInfo],
    index: &VarIndex,
) -> Result<Vec<String>, SetupError> {
    if let Some(abs) = scope.inputs.get(name) {
        return Ok(abs.clone());
    }

    let abs = join(path, name);
    match kind(comps, index, &abs) {
        Some(k) if k.is_input() => Ok(vec![abs]),
        Some(_) => Err(SetupError::ConnectToOutput {
            group: path.to_string(),
            src: src.to_string(),
            tgt: name.to_string(),
        }),
        None if scope.outputs.contains_key(name) => Err(SetupError::ConnectToOutput {
            group: path.to_string(),
            src: src.to_string(),
            tgt: name.to_string(),
        }),
        None => Err(SetupError::UnknownConnectionEnd {
            group: path.to_string(),
            src: src.to_string(),
            tgt: name.to_string(),
            missing: name.to_string(),
        }),
    }
}

fn connect_explicit(
    group: &Group,
    path: &str,
    naming: &Naming,
    comps: &[CompInfo],
    index: &VarIndex,
    connected: &mut HashSet<String>,
    sources: &mut BTreeMap<String, String>,
) -> Result<(), SetupError> {
    if let Some(scope) = naming.scope(path) {
        for (src, tgt) in group.connections() {
            let src_abs = resolve_output(scope, path, src, tgt, comps, index)?;
            for tgt_abs in resolve_inputs(scope, path, src, tgt, comps, index)? {
                check_kinds(comps, index, &src_abs, &tgt_abs)?;
                insert_source(sources, &tgt_abs, &src_abs)?;
                // Each input takes at most one explicit connection, even from
                // the same source.
                if !connected.insert(tgt_abs.clone()) {
                    return Err(SetupError::AlreadyConnected {
                        target: tgt_abs,
                        src: src_abs,
                    });
                }
            }
        }
    }

    for child in group.children() {
        if let Subsystem::Group(sub) = &child.system {
            let child_path = join(path, &child.name);
            connect_explicit(sub, &child_path, naming, comps, index, connected, sources)?;
        }
    }

    Ok(())
}

fn connect_implicit(
    naming: &Naming,
    comps: &[CompInfo],
    index: &VarIndex,
    sources: &mut BTreeMap<String, String>,
) -> Result<(), SetupError> {
    for (_, scope) in naming.scopes_deepest_first() {
        for (name, inputs) in &scope.inputs {
            let Some(src) = scope.outputs.get(name) else {
                continue;
            };
            for tgt in inputs {
                check_kinds(comps, index, src, tgt)?;
                insert_source(sources, tgt, src)?;
            }
        }
    }
    Ok(())
}

/// `set_input_defaults` calls of the whole tree, parents first.
fn collect_defaults<'a>(
    group: &'a Group,
    path: &str,
    out: &mut Vec<(String, &'a str, &'a InputDefaults)>,
) {
    for (name, defaults) in group.input_defaults() {
        out.push((path.to_string(), name.as_str(), defaults));
    }
    for child in group.children() {
        if let Subsystem::Group(sub) = &child.system {
            collect_defaults(sub, &join(path, &child.name), out);
        }
    }
}

/// Creates an automatic independent output for every promoted name at the
/// root whose inputs have no source. Returns the new outputs with the inputs
/// they feed.
fn auto_ivc(
    root: &Group,
    naming: &Naming,
    comps: &[CompInfo],
    index: &VarIndex,
    sources: &BTreeMap<String, String>,
    require_defaults: bool,
) -> Result<Vec<(VarMeta, Vec<String>)>, SetupError> {
    let mut defaults = Vec::new();
    collect_defaults(root, "", &mut defaults);

    for (path, name, _) in &defaults {
        let known = naming
            .scope(path)
            .map_or(false, |scope| scope.inputs.contains_key(*name));
        if !known {
            return Err(SetupError::UnknownInputDefault {
                group: path.clone(),
                name: name.to_string(),
            });
        }
    }

    let scope = naming.root();
    let position: HashMap<&str, usize> = scope
        .order
        .iter()
        .enumerate()
        .map(|(i, abs)| (abs.as_str(), i))
        .collect();

    let mut groups: Vec<(&String, Vec<&String>)> = scope
        .inputs
        .iter()
        .map(|(prom, inputs)| {
            let unconnected = inputs.iter().filter(|i| !sources.contains_key(*i)).collect();
            (prom, unconnected)
        })
        .filter(|(_, inputs): &(&String, Vec<&String>)| !inputs.is_empty())
        .collect();
    groups.sort_by_key(|(_, inputs)| position.get(inputs[0].as_str()).copied());

    let mut auto = Vec::new();
    let mut missing = Vec::new();

    for (i, (prom, inputs)) in groups.into_iter().enumerate() {
        let metas: Vec<&VarMeta> = inputs
            .iter()
            .filter_map(|abs| meta(comps, index, abs))
            .collect();
        let name = format!("v{i}");
        let abs_inputs: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();

        // Defaults apply when the group that set them sees these inputs under
        // the given name. Parents take precedence.
        let mut val = None;
        let mut def_units = None;
        let mut has_defaults = false;
        for (path, dname, d) in &defaults {
            let applies = naming
                .scope(path)
                .and_then(|s| s.abs2prom.get(inputs[0].as_str()))
                .map_or(false, |p| p == dname);
            if applies {
                has_defaults = true;
                val = val.or(d.val.clone());
                def_units = def_units.or(d.units.clone());
            }
        }

        if !has_defaults && require_defaults {
            missing.extend(abs_inputs.iter().cloned());
        }

        let n_discrete = metas.iter().filter(|m| m.kind().is_discrete()).count();
        if n_discrete > 0 {
            if n_discrete != metas.len() {
                return Err(SetupError::DiscreteMismatch {
                    src: prom.clone(),
                    tgt: abs_inputs[0].clone(),
                    src_kind: "discrete",
                    tgt_kind: "continuous",
                });
            }
            let value = metas[0].discrete_val().clone().unwrap_or_default();
            auto.push((VarMeta::new_discrete_output(&name, value), abs_inputs));
            continue;
        }

        let mut distinct_units: Vec<&String> = Vec::new();
        for u in metas.iter().filter_map(|m| m.units().as_ref()) {
            if !distinct_units.contains(&u) {
                distinct_units.push(u);
            }
        }

        let units = match def_units {
            Some(u) => Some(u),
            None if distinct_units.len() > 1 => {
                return Err(SetupError::AmbiguousInputs {
                    prom: prom.clone(),
                    inputs: abs_inputs,
                    attr: "units",
                });
            }
            None => distinct_units.first().map(|u| u.to_string()),
        };

        let first = metas[0];
        let resolved = metas.iter().find(|m| m.is_shape_resolved());
        let shape = resolved.map(|m| m.shape().clone());

        let value = match val {
            Some(val) => match &shape {
                Some(shape) => {
                    val.broadcast(shape.iter().product())
                        .ok_or_else(|| SetupError::DefaultSizeMismatch {
                            prom: prom.clone(),
                            size: val.as_slice().len(),
                            shape: shape.clone(),
                        })?
                }
                None => val.as_slice().to_vec(),
            },
            None => {
                let known: Vec<&&VarMeta> = metas.iter().filter(|m| m.is_shape_resolved()).collect();
                let differ = known.windows(2).any(|w| {
                    w[0].val().len() != w[1].val().len()
                        || w[0]
                            .val()
                            .iter()
                            .zip(w[1].val().iter())
                            .any(|(a, b)| !relative_eq!(*a, *b, epsilon = 1e-12))
                });
                if differ {
                    return Err(SetupError::AmbiguousInputs {
                        prom: prom.clone(),
                        inputs: abs_inputs,
                        attr: "val",
                    });
                }

                let source = resolved.copied().unwrap_or(first);
                let mut value = source.val().clone();
                if let (Some(from), Some(to)) = (source.units(), &units) {
                    if let Ok((scale, shift)) = units::conversion(from, to) {
                        value.iter_mut().for_each(|v| *v = scale * *v + shift);
                    }
                }
                value
            }
        };

        let mut var = match shape {
            Some(shape) => VarMeta::new_output(&name, shape, value),
            None => VarMeta::new_deferred_output(&name, value),
        };
        var.set_units(units);

        debug!("auto independent output '{}' feeds {:?}", name, abs_inputs);
        auto.push((var, abs_inputs));
    }

    if !missing.is_empty() {
        return Err(SetupError::MissingInputDefaults(missing));
    }

    Ok(auto)
}

/// Checks connected shapes and units, returning the unit conversion
/// `(scale, shift)` of every continuous connection.
pub(crate) fn validate(
    comps: &[CompInfo],
    index: &VarIndex,
    conns: &Connections,
) -> Result<BTreeMap<String, (f64, f64)>, SetupError> {
    let mut conversions = BTreeMap::new();

    for (tgt, src) in &conns.sources {
        let (Some(t), Some(s)) = (meta(comps, index, tgt), meta(comps, index, src)) else {
            continue;
        };

        if t.kind().is_discrete() {
            continue;
        }

        if t.size() != s.size() {
            return Err(SetupError::ShapeMismatch {
                src: src.clone(),
                tgt: tgt.clone(),
                src_shape: s.shape().clone(),
                tgt_shape: t.shape().clone(),
            });
        }

        let conversion = match (s.units(), t.units()) {
            (Some(su), Some(tu)) => {
                units::conversion(su, tu).map_err(|_| SetupError::IncompatibleUnits {
                    src: src.clone(),
                    src_units: su.clone(),
                    tgt: tgt.clone(),
                    tgt_units: tu.clone(),
                })?
            }
            (Some(su), None) => {
                warn!(
                    "Output '{}' with units of '{}' is connected to input '{}' which has no units.",
                    src, su, tgt
                );
                (1.0, 0.0)
            }
            (None, Some(tu)) => {
                if !src.starts_with(AUTO_IVC) {
                    warn!(
                        "Input '{}' with units of '{}' is connected to output '{}' which has no units.",
                        tgt, tu, src
                    );
                }
                (1.0, 0.0)
            }
            (None, None) => (1.0, 0.0),
        };

        conversions.insert(tgt.clone(), conversion);
    }

    Ok(conversions)
}
