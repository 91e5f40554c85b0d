//! Promotion and naming of variables.
//!
//! Every variable has an absolute name (the path of its component joined with
//! its local name by `.`) and, in every group on the way to the root, a
//! promoted name relative to that group. Resolution runs in two passes:
//!
//! 1. Bottom-up, each group computes the names its subsystems expose to it by
//!    applying their promotions to the names they expose themselves. The pass
//!    has no shared state, every group returns what it exposes.
//! 2. Top-down, the exposed names of every group are turned into the lookup
//!    tables of a [`Scope`], checking that no two outputs share a name.

use std::collections::BTreeMap;

use crate::core::{VarKind, VarMeta};
use crate::group::{Group, Promote, Subsystem};
use crate::model::SetupError;

/// Matches a name against a glob pattern supporting `*` (any sequence) and
/// `?` (any single character).
pub fn fnmatch(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            // Let the last star swallow one more character.
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// Joins a path and a name with `.`, treating the empty path as the root.
pub(crate) fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

/// A variable as seen from a group.
#[derive(Debug, Clone, PartialEq)]
struct Exposed {
    abs: String,
    kind: VarKind,
    name: String,
}

/// Lookup tables of names in one group.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Scope {
    /// Promoted name to absolute names of inputs, in tree order.
    pub(crate) inputs: BTreeMap<String, Vec<String>>,
    /// Promoted name to the absolute name of the output.
    pub(crate) outputs: BTreeMap<String, String>,
    /// Absolute name to promoted name.
    pub(crate) abs2prom: BTreeMap<String, String>,
    /// Absolute names in tree order.
    pub(crate) order: Vec<String>,
}

/// Names of all variables in all groups of the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Naming {
    scopes: BTreeMap<String, Scope>,
}

impl Naming {
    /// Resolves promoted names. `vars` maps component paths to their
    /// declared variables.
    pub(crate) fn resolve(
        root: &Group,
        vars: &BTreeMap<String, Vec<VarMeta>>,
    ) -> Result<Self, SetupError> {
        let mut exposed_by_scope = Vec::new();
        let root_exposed = expose(root, "", vars, &mut exposed_by_scope)?;
        exposed_by_scope.push((String::new(), root_exposed));

        // Parents before children.
        exposed_by_scope.sort_by_key(|(path, _)| depth(path));

        let mut scopes = BTreeMap::new();
        for (path, exposed) in exposed_by_scope {
            let scope = build_scope(&path, exposed)?;
            scopes.insert(path, scope);
        }

        Ok(Self { scopes })
    }

    /// Scope of a group given by its path.
    pub(crate) fn scope(&self, path: &str) -> Option<&Scope> {
        self.scopes.get(path)
    }

    /// Scope of the root group.
    pub(crate) fn root(&self) -> &Scope {
        // The root scope is always inserted by `resolve`.
        &self.scopes[""]
    }

    /// Group paths, deepest first.
    pub(crate) fn scopes_deepest_first(&self) -> Vec<(&str, &Scope)> {
        let mut scopes: Vec<_> = self
            .scopes
            .iter()
            .map(|(path, scope)| (path.as_str(), scope))
            .collect();
        scopes.sort_by_key(|(path, _)| std::cmp::Reverse(depth(path)));
        scopes
    }

    /// Promoted name of a variable at the root.
    pub(crate) fn prom_name(&self, abs: &str) -> Option<&str> {
        self.root().abs2prom.get(abs).map(String::as_str)
    }
}

fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('.').count() + 1
    }
}

/// Applies promotion rules to a name, returning the promoted name and the
/// index of the matching rule.
fn promote(rules: &[Promote], name: &str) -> Option<(String, usize)> {
    rules.iter().enumerate().find_map(|(i, rule)| match rule {
        Promote::Pattern(p) if fnmatch(p, name) => Some((name.to_string(), i)),
        Promote::Rename(old, new) if old == name => Some((new.clone(), i)),
        _ => None,
    })
}

/// Bottom-up pass: names exposed by the subsystems of `group` to it.
fn expose(
    group: &Group,
    path: &str,
    vars: &BTreeMap<String, Vec<VarMeta>>,
    nested: &mut Vec<(String, Vec<Exposed>)>,
) -> Result<Vec<Exposed>, SetupError> {
    let mut exposed = Vec::new();

    for child in group.children() {
        let child_path = join(path, &child.name);

        let own: Vec<Exposed> = match &child.system {
            Subsystem::Group(sub) => {
                let list = expose(sub, &child_path, vars, nested)?;
                nested.push((child_path.clone(), list.clone()));
                list
            }
            Subsystem::Explicit(_) | Subsystem::Implicit(_) => vars
                .get(&child_path)
                .map(|vars| {
                    vars.iter()
                        .map(|v| Exposed {
                            abs: join(&child_path, v.name()),
                            kind: v.kind(),
                            name: v.name().clone(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };

        let promotes = &child.promotes;
        let mut any_used = vec![false; promotes.any.len()];
        let mut inputs_used = vec![false; promotes.inputs.len()];
        let mut outputs_used = vec![false; promotes.outputs.len()];

        for var in own {
            let (specific, used) = if var.kind.is_input() {
                (&promotes.inputs, &mut inputs_used)
            } else {
                (&promotes.outputs, &mut outputs_used)
            };

            let name = if let Some((name, i)) = promote(specific, &var.name) {
                used[i] = true;
                name
            } else if let Some((name, i)) = promote(&promotes.any, &var.name) {
                any_used[i] = true;
                name
            } else {
                join(&child.name, &var.name)
            };

            exposed.push(Exposed { name, ..var });
        }

        for (kind, rules, used) in [
            ("promotes", &promotes.any, &any_used),
            ("promotes_inputs", &promotes.inputs, &inputs_used),
            ("promotes_outputs", &promotes.outputs, &outputs_used),
        ] {
            let unmatched: Vec<String> = rules
                .iter()
                .zip(used.iter())
                .filter(|(rule, used)| !**used && **rule != Promote::Pattern("*".to_string()))
                .map(|(rule, _)| rule.label())
                .collect();

            if !unmatched.is_empty() {
                return Err(SetupError::UnmatchedPromotes {
                    path: child_path,
                    kind,
                    patterns: unmatched,
                });
            }
        }
    }

    Ok(exposed)
}

/// Top-down pass: lookup tables of one group.
fn build_scope(path: &str, exposed: Vec<Exposed>) -> Result<Scope, SetupError> {
    let mut scope = Scope::default();
    let mut multiple: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for var in exposed {
        if var.kind.is_input() {
            scope
                .inputs
                .entry(var.name.clone())
                .or_default()
                .push(var.abs.clone());
        } else if let Some(existing) = scope.outputs.get(&var.name) {
            multiple
                .entry(var.name.clone())
                .or_insert_with(|| vec![existing.clone()])
                .push(var.abs.clone());
        } else {
            scope.outputs.insert(var.name.clone(), var.abs.clone());
        }

        scope.abs2prom.insert(var.abs.clone(), var.name);
        scope.order.push(var.abs);
    }

    if let Some((name, outputs)) = multiple.into_iter().next() {
        return Err(SetupError::MultipleOutputs {
            group: path.to_string(),
            name,
            outputs,
        });
    }

    Ok(scope)
}
