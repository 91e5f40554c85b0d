//! Setup of the model and evaluation of its components.
//!
//! Setup flattens the tree of groups into a list of components, resolves
//! names, connections and shapes, lays out the global vectors and computes
//! the execution order. Index `0` of the component list is reserved for the
//! automatic independent outputs feeding unconnected inputs.
//!
//! Every evaluation of a component follows the same discipline: the values
//! the component may only read are locked for the duration of the call and
//! the values it writes go into a scratch buffer that is committed only when
//! the call succeeds.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use log::debug;
use nalgebra::{DMatrix, DVector};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use thiserror::Error;

use crate::connections::{self, Connections};
use crate::core::{
    DeclarationError, Declarations, EvalError, EvaluationStrategy, ExplicitComponent, Mode,
    PartialDecl, PrimalSignature, PrimalValue, VarKind, VarMeta,
};
use crate::derivatives::{Jacobian, PartialCheck};
use crate::group::{Group, Subsystem};
use crate::naming::{join, Naming};
use crate::partials::Partials;
use crate::shapes;
use crate::solver::NonlinearSolver;
use crate::vectors::{Owner, ReadOnlyGuard, Region, Scratch, Vector, VectorKind, View};

/// Path of the component owning automatic independent outputs.
pub(crate) const AUTO_IVC: &str = "_auto_ivc";

fn group_label(path: &str) -> String {
    if path.is_empty() {
        "<model>".to_string()
    } else {
        format!("'{path}'")
    }
}

fn list(names: &[String]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("'{n}'")).collect();
    format!("[{}]", quoted.join(", "))
}

/// Error encountered while setting up the model.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Invalid declaration of a variable or partial derivative.
    #[error("'{path}' <class {class}>: {source}")]
    Declaration {
        /// Absolute path of the component.
        path: String,
        /// Class name of the component.
        class: String,
        /// The declaration error.
        source: DeclarationError,
    },
    /// The primal routine of a component does not fit its variables.
    #[error("'{path}' <class {class}>: {message}")]
    Primal {
        /// Absolute path of the component.
        path: String,
        /// Class name of the component.
        class: String,
        /// Description of the mismatch.
        message: String,
    },
    /// Two subsystems of a group share a name.
    #[error("{} <class Group>: Subsystem name '{name}' is already used.", group_label(.group))]
    DuplicateSubsystem {
        /// Path of the group.
        group: String,
        /// The name.
        name: String,
    },
    /// Two outputs are promoted to the same name.
    #[error("{} <class Group>: Output name '{name}' refers to multiple outputs: {outputs:?}.", group_label(.group))]
    MultipleOutputs {
        /// Path of the group.
        group: String,
        /// Promoted name.
        name: String,
        /// Absolute names of the outputs.
        outputs: Vec<String>,
    },
    /// A promotion rule matched no variable.
    #[error("'{path}': '{kind}' failed to find any matches for the following names or patterns: {patterns:?}.")]
    UnmatchedPromotes {
        /// Path of the subsystem.
        path: String,
        /// Kind of the rule (`promotes`, `promotes_inputs` or
        /// `promotes_outputs`).
        kind: &'static str,
        /// Unmatched rules.
        patterns: Vec<String>,
    },
    /// An input would get more than one source.
    #[error("Input '{target}' cannot be connected to '{src}' because it's already connected to '{existing}'.")]
    DuplicateConnection {
        /// Absolute name of the input.
        target: String,
        /// Absolute name of the new source.
        src: String,
        /// Absolute name of the existing source.
        existing: String,
    },
    /// An input was explicitly connected more than once.
    #[error("Input '{target}' is already connected to '{src}'.")]
    AlreadyConnected {
        /// Absolute name of the input.
        target: String,
        /// Absolute name of the source.
        src: String,
    },
    /// The source of a connection is an input.
    #[error("{} <class Group>: Attempted to connect from '{src}' to '{tgt}', but '{src}' is an input. All connections must be from an output to an input.", group_label(.group))]
    ConnectFromInput {
        /// Path of the group.
        group: String,
        /// Source name.
        src: String,
        /// Target name.
        tgt: String,
    },
    /// The target of a connection is an output.
    #[error("{} <class Group>: Attempted to connect from '{src}' to '{tgt}', but '{tgt}' is an output. All connections must be from an output to an input.", group_label(.group))]
    ConnectToOutput {
        /// Path of the group.
        group: String,
        /// Source name.
        src: String,
        /// Target name.
        tgt: String,
    },
    /// One end of a connection does not exist.
    #[error("{} <class Group>: Attempted to connect from '{src}' to '{tgt}', but '{missing}' doesn't exist.", group_label(.group))]
    UnknownConnectionEnd {
        /// Path of the group.
        group: String,
        /// Source name.
        src: String,
        /// Target name.
        tgt: String,
        /// The name that was not found.
        missing: String,
    },
    /// A discrete variable is connected to a continuous one.
    #[error("Can't connect {src_kind} variable '{src}' to {tgt_kind} variable '{tgt}'.")]
    DiscreteMismatch {
        /// Source name.
        src: String,
        /// Target name.
        tgt: String,
        /// Kind of the source.
        src_kind: &'static str,
        /// Kind of the target.
        tgt_kind: &'static str,
    },
    /// Connected variables differ in size.
    #[error("The source and target shapes do not match or are ambiguous for the connection '{src}' to '{tgt}'. The source shape is {src_shape:?} but the target shape is {tgt_shape:?}.")]
    ShapeMismatch {
        /// Source name.
        src: String,
        /// Target name.
        tgt: String,
        /// Shape of the source.
        src_shape: Vec<usize>,
        /// Shape of the target.
        tgt_shape: Vec<usize>,
    },
    /// Connected variables have incompatible units.
    #[error("Output units of '{src_units}' for '{src}' are incompatible with input units of '{tgt_units}' for '{tgt}'.")]
    IncompatibleUnits {
        /// Source name.
        src: String,
        /// Units of the source.
        src_units: String,
        /// Target name.
        tgt: String,
        /// Units of the target.
        tgt_units: String,
    },
    /// Inputs promoted to the same name disagree and no input defaults were
    /// given.
    #[error("The following inputs, {inputs:?}, promoted to '{prom}', are connected but their metadata entries ['{attr}'] differ. Call <group>.set_input_defaults('{prom}', {attr}=?), where <group> is the model to remove the ambiguity.")]
    AmbiguousInputs {
        /// Promoted name.
        prom: String,
        /// Absolute names of the inputs.
        inputs: Vec<String>,
        /// The attribute that differs (`val` or `units`).
        attr: &'static str,
    },
    /// An input default cannot be broadcast to the shape of its inputs.
    #[error("The default value of '{prom}' has size {size} but the promoted inputs have shape {shape:?}.")]
    DefaultSizeMismatch {
        /// Promoted name.
        prom: String,
        /// Size of the default value.
        size: usize,
        /// Shape of the inputs.
        shape: Vec<usize>,
    },
    /// Input defaults were given for a name that is not an input.
    #[error("{} <class Group>: Input defaults were set for '{name}', which is not a promoted input of the group.", group_label(.group))]
    UnknownInputDefault {
        /// Path of the group.
        group: String,
        /// The name.
        name: String,
    },
    /// Inputs without source and without defaults when defaults are required.
    #[error("The following inputs are not connected and have no input defaults: {0:?}.")]
    MissingInputDefaults(Vec<String>),
    /// Shapes depend on each other in a cycle.
    #[error("Shapes of the following variables depend on each other in a cycle: {0:?}.")]
    ShapeCycle(Vec<String>),
    /// Shapes could not be determined.
    #[error("Failed to resolve shapes for {0:?}.")]
    UnresolvedShapes(Vec<String>),
    /// A shape function failed.
    #[error("Failed to compute the shape of '{name}': {message}")]
    ComputeShape {
        /// Absolute name of the variable.
        name: String,
        /// Error of the shape function.
        message: String,
    },
    /// `copy_shape` names a variable that does not exist.
    #[error("'{name}': Can't copy shape from '{other}' because it doesn't exist.")]
    UnknownCopyShape {
        /// Absolute name of the variable.
        name: String,
        /// The missing variable.
        other: String,
    },
}

impl SetupError {
    pub(crate) fn declaration(owner: &Owner, source: DeclarationError) -> Self {
        SetupError::Declaration {
            path: owner.path().clone(),
            class: owner.class().clone(),
            source,
        }
    }

    fn primal(owner: &Owner, message: String) -> Self {
        SetupError::Primal {
            path: owner.path().clone(),
            class: owner.class().clone(),
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompKind {
    AutoIvc,
    Explicit,
    Implicit,
}

/// Source of one continuous input slot.
#[derive(Debug, Clone)]
pub(crate) struct Source {
    /// Index of the input slot within the component.
    pub(crate) slot: usize,
    /// Index of the source component.
    pub(crate) comp: usize,
    /// Range of the source in the global output vector.
    pub(crate) range: Range<usize>,
    pub(crate) scale: f64,
    pub(crate) shift: f64,
}

/// Source of one discrete input slot.
#[derive(Debug, Clone)]
pub(crate) struct DiscreteSource {
    pub(crate) slot: usize,
    pub(crate) comp: usize,
    /// Index in the global discrete output storage.
    pub(crate) index: usize,
}

/// Flattened component.
#[derive(Debug, Clone)]
pub(crate) struct CompInfo {
    pub(crate) owner: Owner,
    /// Child indices leading to the component from the root.
    pub(crate) route: Vec<usize>,
    pub(crate) kind: CompKind,
    pub(crate) strategy: EvaluationStrategy,
    pub(crate) primal: Option<PrimalSignature>,
    pub(crate) vars: Vec<VarMeta>,
    pub(crate) partial_decls: Vec<PartialDecl>,
    /// Solvers configured on the groups above the component, root first.
    pub(crate) solvers: Vec<Option<NonlinearSolver>>,
    pub(crate) inputs: Region,
    pub(crate) outputs: Region,
    pub(crate) sources: Vec<Source>,
    pub(crate) discrete_sources: Vec<DiscreteSource>,
}

impl CompInfo {
    fn new(owner: Owner, route: Vec<usize>, kind: CompKind) -> Self {
        Self {
            owner,
            route,
            kind,
            strategy: EvaluationStrategy::default(),
            primal: None,
            vars: Vec::new(),
            partial_decls: Vec::new(),
            solvers: Vec::new(),
            inputs: Region::default(),
            outputs: Region::default(),
            sources: Vec::new(),
            discrete_sources: Vec::new(),
        }
    }

    pub(crate) fn path(&self) -> &str {
        self.owner.path()
    }

    pub(crate) fn var(&self, name: &str) -> Option<&VarMeta> {
        self.vars.iter().find(|v| v.name() == name)
    }
}

/// Absolute variable name to `(component, variable)` indices.
pub(crate) type VarIndex = BTreeMap<String, (usize, usize)>;

pub(crate) fn index_vars(comps: &[CompInfo]) -> VarIndex {
    comps
        .iter()
        .enumerate()
        .flat_map(|(c, info)| {
            info.vars
                .iter()
                .enumerate()
                .map(move |(v, var)| (join(info.path(), var.name()), (c, v)))
        })
        .collect()
}

/// Strongly connected set of components evaluated together.
#[derive(Debug, Clone)]
pub(crate) struct Block {
    /// Component indices in tree order.
    pub(crate) comps: Vec<usize>,
    /// More than one component or a component feeding itself.
    pub(crate) coupled: bool,
    pub(crate) solver: Option<NonlinearSolver>,
}

impl Block {
    pub(crate) fn paths(&self, comps: &[CompInfo]) -> Vec<String> {
        self.comps.iter().map(|&c| comps[c].path().to_string()).collect()
    }
}

/// Linearization of the residuals of one component.
#[derive(Debug, Clone)]
pub(crate) enum LinearOp {
    /// `dR = d_outputs`.
    Identity,
    /// `dR = d_in * d_inputs + d_out * d_outputs`.
    Dense {
        d_in: DMatrix<f64>,
        d_out: DMatrix<f64>,
    },
    /// Products are evaluated by the component.
    MatrixFree,
}

/// Location of a variable in a global vector.
#[derive(Debug, Clone)]
pub(crate) struct Location {
    pub(crate) kind: VarKind,
    /// Range in the continuous storage, or a single index in the discrete
    /// storage.
    pub(crate) range: Range<usize>,
}

/// The set up model.
#[derive(Debug)]
pub(crate) struct Model {
    pub(crate) comps: Vec<CompInfo>,
    pub(crate) index: VarIndex,
    pub(crate) naming: Naming,
    pub(crate) conns: Connections,
    pub(crate) blocks: Vec<Block>,
    pub(crate) inputs: Vector,
    pub(crate) outputs: Vector,
    pub(crate) residuals: Vector,
    pub(crate) partials: Vec<Partials>,
    pub(crate) ops: Vec<LinearOp>,
}

fn collect(
    group: &mut Group,
    path: &str,
    route: &[usize],
    solvers: &mut Vec<Option<NonlinearSolver>>,
    comps: &mut Vec<CompInfo>,
) -> Result<(), SetupError> {
    solvers.push(group.nonlinear_solver().cloned());

    let mut names = HashSet::new();
    for (i, child) in group.children_mut().iter_mut().enumerate() {
        if !names.insert(child.name.clone()) {
            return Err(SetupError::DuplicateSubsystem {
                group: path.to_string(),
                name: child.name.clone(),
            });
        }

        let child_path = join(path, &child.name);
        let mut child_route = route.to_vec();
        child_route.push(i);

        let mut decl = Declarations::new();
        let mut info = match &mut child.system {
            Subsystem::Group(sub) => {
                collect(sub, &child_path, &child_route, solvers, comps)?;
                continue;
            }
            Subsystem::Explicit(comp) => {
                let owner = Owner::new(&child_path, comp.class_name());
                comp.setup(&mut decl)
                    .map_err(|source| SetupError::declaration(&owner, source))?;
                let mut info = CompInfo::new(owner, child_route, CompKind::Explicit);
                info.strategy = comp.evaluation_strategy();
                info.primal = comp.primal_signature();
                info
            }
            Subsystem::Implicit(comp) => {
                let owner = Owner::new(&child_path, comp.class_name());
                comp.setup(&mut decl)
                    .map_err(|source| SetupError::declaration(&owner, source))?;
                CompInfo::new(owner, child_route, CompKind::Implicit)
            }
        };

        let (vars, partial_decls) = decl
            .finish(info.kind == CompKind::Implicit)
            .map_err(|source| SetupError::declaration(&info.owner, source))?;
        info.vars = vars;
        info.partial_decls = partial_decls;
        info.solvers = solvers.clone();
        comps.push(info);
    }

    solvers.pop();
    Ok(())
}

/// Names the primal routine is called with, continuous inputs first.
fn mapped_names(info: &CompInfo, kinds: [VarKind; 2]) -> Vec<(String, bool)> {
    kinds
        .iter()
        .flat_map(|&kind| {
            info.vars
                .iter()
                .filter(move |v| v.kind() == kind)
                .map(|v| match v.primal_name() {
                    Some(name) => (name.clone(), true),
                    None => (v.name().clone(), false),
                })
        })
        .collect()
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn primal_hint(side: &str) -> String {
    let (direction, methods) = match side {
        "input" => ("inputs", "add_input/add_discrete_input"),
        _ => ("outputs", "add_output/add_discrete_output"),
    };
    format!(
        "To map {direction} to the compute_primal method, set the name used in compute_primal \
         to the 'primal_name' arg when calling {methods}. This is only necessary if the declared \
         component {side} name is not a valid identifier."
    )
}

fn check_primal(info: &CompInfo) -> Result<(), SetupError> {
    let Some(signature) = &info.primal else {
        return Ok(());
    };

    let inputs = mapped_names(info, [VarKind::Input, VarKind::DiscreteInput]);
    let args: Vec<String> = inputs.iter().map(|(name, _)| name.clone()).collect();
    if signature.params() != args.as_slice() {
        return Err(SetupError::primal(
            &info.owner,
            format!(
                "compute_primal method args {} don't match the args {} mapped from this \
                 component's inputs. {}",
                list(signature.params()),
                list(&args),
                primal_hint("input")
            ),
        ));
    }
    if let Some((name, _)) = inputs.iter().find(|(n, mapped)| !mapped && !is_identifier(n)) {
        return Err(SetupError::primal(
            &info.owner,
            format!(
                "compute_primal method arg '{name}' is not a valid identifier. {}",
                primal_hint("input")
            ),
        ));
    }

    let outputs = mapped_names(info, [VarKind::Output, VarKind::DiscreteOutput]);
    if signature.returns().len() != outputs.len() {
        return Err(SetupError::primal(
            &info.owner,
            format!(
                "compute_primal method returns {} value(s) but {} output(s) are mapped from this \
                 component's outputs.",
                signature.returns().len(),
                outputs.len()
            ),
        ));
    }
    for (i, (ret, (name, mapped))) in signature.returns().iter().zip(outputs.iter()).enumerate() {
        if ret != name {
            return Err(SetupError::primal(
                &info.owner,
                format!(
                    "compute_primal method returns {ret} for return value {i} but the name of \
                     the output that was mapped for this component is {name}. {}",
                    primal_hint("output")
                ),
            ));
        }
        if !mapped && !is_identifier(name) {
            return Err(SetupError::primal(
                &info.owner,
                format!(
                    "compute_primal method return value {i} '{name}' is not a valid identifier. {}",
                    primal_hint("output")
                ),
            ));
        }
    }

    Ok(())
}

/// Nearest solver configured on a group containing all given components.
fn block_solver(comps: &[CompInfo], members: &[usize]) -> Option<NonlinearSolver> {
    let routes: Vec<&[usize]> = members
        .iter()
        .map(|&c| {
            let route = comps[c].route.as_slice();
            &route[..route.len().saturating_sub(1)]
        })
        .collect();

    let first = routes.first()?;
    let common = (0..=first.len())
        .take_while(|&k| routes.iter().all(|r| r.len() >= k && r[..k] == first[..k]))
        .last()?;

    let chain = &comps[members[0]].solvers;
    chain
        .iter()
        .take((common + 1).min(chain.len()))
        .rev()
        .find_map(Clone::clone)
}

impl Model {
    /// Runs the setup of all components and builds the model.
    pub(crate) fn setup(root: &mut Group, require_defaults: bool) -> Result<Self, SetupError> {
        let mut comps = vec![CompInfo::new(
            Owner::new(AUTO_IVC, "_AutoIndepVarComp"),
            Vec::new(),
            CompKind::AutoIvc,
        )];
        collect(root, "", &[], &mut Vec::new(), &mut comps)?;

        let declared: BTreeMap<String, Vec<VarMeta>> = comps[1..]
            .iter()
            .map(|c| (c.path().to_string(), c.vars.clone()))
            .collect();
        let naming = Naming::resolve(root, &declared)?;

        let index = index_vars(&comps);
        let conns = connections::resolve(root, &naming, &mut comps, &index, require_defaults)?;
        let index = index_vars(&comps);

        shapes::resolve(&mut comps, &conns)?;
        let conversions = connections::validate(&comps, &index, &conns)?;

        let mut partials = Vec::with_capacity(comps.len());
        for info in &comps {
            check_primal(info)?;
            let size = |name: &str| info.var(name).map_or(0, VarMeta::size);
            for decl in &info.partial_decls {
                decl.validate(size(decl.of()), size(decl.wrt()))
                    .map_err(|source| SetupError::declaration(&info.owner, source))?;
            }
            partials.push(Partials::new(info.owner.clone(), &info.partial_decls, size));
        }

        // Layout of the global vectors.
        let (mut n_in, mut n_din, mut n_out, mut n_dout) = (0, 0, 0, 0);
        for info in comps.iter_mut() {
            info.inputs = Region::build(&info.vars, VarKind::Input, VarKind::DiscreteInput, n_in, n_din);
            info.outputs =
                Region::build(&info.vars, VarKind::Output, VarKind::DiscreteOutput, n_out, n_dout);
            n_in = info.inputs.range.end;
            n_din = info.inputs.discrete_range.end;
            n_out = info.outputs.range.end;
            n_dout = info.outputs.discrete_range.end;
        }

        for c in 0..comps.len() {
            let mut sources = Vec::new();
            let mut discrete_sources = Vec::new();
            let info = &comps[c];

            for (slot_idx, slot) in info.inputs.slots.iter().enumerate() {
                let abs = join(info.path(), &slot.name);
                let Some(src) = conns.sources.get(&abs) else {
                    continue;
                };
                let (sc, sv) = index[src];
                let src_info = &comps[sc];
                let Some(src_slot) = src_info.outputs.slot(src_info.vars[sv].name()) else {
                    continue;
                };
                let start = src_info.outputs.range.start + src_slot.start;
                let (scale, shift) = conversions.get(&abs).copied().unwrap_or((1.0, 0.0));
                sources.push(Source {
                    slot: slot_idx,
                    comp: sc,
                    range: start..start + src_slot.size,
                    scale,
                    shift,
                });
            }

            for (slot_idx, slot) in info.inputs.discrete.iter().enumerate() {
                let abs = join(info.path(), &slot.name);
                let Some(src) = conns.sources.get(&abs) else {
                    continue;
                };
                let (sc, sv) = index[src];
                let src_info = &comps[sc];
                if let Some(src_slot) = src_info.outputs.discrete_slot(src_info.vars[sv].name()) {
                    discrete_sources.push(DiscreteSource {
                        slot: slot_idx,
                        comp: sc,
                        index: src_info.outputs.discrete_range.start + src_slot.start,
                    });
                }
            }

            comps[c].sources = sources;
            comps[c].discrete_sources = discrete_sources;
        }

        let blocks = Self::order(&comps);

        let mut inputs = Vector::new(VectorKind::Input, n_in, n_din);
        let mut outputs = Vector::new(VectorKind::Output, n_out, n_dout);
        for info in &comps {
            for (vector, region, kinds) in [
                (&mut inputs, &info.inputs, (VarKind::Input, VarKind::DiscreteInput)),
                (&mut outputs, &info.outputs, (VarKind::Output, VarKind::DiscreteOutput)),
            ] {
                for var in &info.vars {
                    if var.kind() == kinds.0 {
                        if let Some(slot) = region.slot(var.name()) {
                            let start = region.range.start + slot.start;
                            vector.as_mut_slice()[start..start + slot.size].copy_from_slice(var.val());
                        }
                    } else if var.kind() == kinds.1 {
                        if let Some(slot) = region.discrete_slot(var.name()) {
                            vector.discrete_mut()[region.discrete_range.start + slot.start] =
                                var.discrete_val().clone().unwrap_or_default();
                        }
                    }
                }
            }
        }

        debug!(
            "model set up with {} components, {} inputs, {} outputs and {} blocks",
            comps.len() - 1,
            n_in,
            n_out,
            blocks.len()
        );

        let ops = vec![LinearOp::Identity; comps.len()];
        Ok(Self {
            comps,
            index,
            naming,
            conns,
            blocks,
            inputs,
            outputs,
            residuals: Vector::new(VectorKind::Residual, n_out, n_dout),
            partials,
            ops,
        })
    }

    /// Strongly connected blocks of the data flow graph in execution order.
    fn order(comps: &[CompInfo]) -> Vec<Block> {
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..comps.len()).map(|c| graph.add_node(c)).collect();
        for (c, info) in comps.iter().enumerate() {
            let sources = info
                .sources
                .iter()
                .map(|s| s.comp)
                .chain(info.discrete_sources.iter().map(|s| s.comp));
            for src in sources {
                graph.update_edge(nodes[src], nodes[c], ());
            }
        }

        // Tarjan's algorithm yields the components in reverse topological
        // order.
        let mut sccs = tarjan_scc(&graph);
        sccs.reverse();

        sccs.into_iter()
            .map(|scc| {
                let mut members: Vec<usize> = scc.iter().map(|&n| graph[n]).collect();
                members.sort_unstable();
                let coupled = members.len() > 1 || graph.contains_edge(scc[0], scc[0]);
                let solver = if coupled || comps[members[0]].kind == CompKind::Implicit {
                    block_solver(comps, &members)
                } else {
                    None
                };
                Block {
                    comps: members,
                    coupled,
                    solver,
                }
            })
            .collect()
    }

    /// Where a variable lives in the global vectors.
    pub(crate) fn locate(&self, abs: &str) -> Option<Location> {
        let &(c, v) = self.index.get(abs)?;
        let info = &self.comps[c];
        let meta = &info.vars[v];
        let region = if meta.kind().is_input() {
            &info.inputs
        } else {
            &info.outputs
        };

        let range = if meta.kind().is_discrete() {
            let slot = region.discrete_slot(meta.name())?;
            let start = region.discrete_range.start + slot.start;
            start..start + 1
        } else {
            let slot = region.slot(meta.name())?;
            let start = region.range.start + slot.start;
            start..start + slot.size
        };

        Some(Location {
            kind: meta.kind(),
            range,
        })
    }

    /// Metadata of a variable by its absolute name.
    pub(crate) fn meta(&self, abs: &str) -> Option<&VarMeta> {
        self.index.get(abs).map(|&(c, v)| &self.comps[c].vars[v])
    }

    /// Whether the component owning a variable is implicit.
    pub(crate) fn is_implicit(&self, abs: &str) -> bool {
        self.index
            .get(abs)
            .map_or(false, |&(c, _)| self.comps[c].kind == CompKind::Implicit)
    }

    /// Current values of a continuous variable.
    pub(crate) fn read(&self, abs: &str) -> Option<&[f64]> {
        let loc = self.locate(abs)?;
        match loc.kind {
            VarKind::Input => Some(&self.inputs.as_slice()[loc.range]),
            VarKind::Output => Some(&self.outputs.as_slice()[loc.range]),
            _ => None,
        }
    }

    /// Current residuals of a continuous output.
    pub(crate) fn read_residuals(&self, abs: &str) -> Option<&[f64]> {
        let loc = self.locate(abs)?;
        match loc.kind {
            VarKind::Output => Some(&self.residuals.as_slice()[loc.range]),
            _ => None,
        }
    }

    /// Current value of a discrete variable.
    pub(crate) fn read_discrete(&self, abs: &str) -> Option<&serde_json::Value> {
        let loc = self.locate(abs)?;
        match loc.kind {
            VarKind::DiscreteInput => self.inputs.discrete().get(loc.range.start),
            VarKind::DiscreteOutput => self.outputs.discrete().get(loc.range.start),
            _ => None,
        }
    }

    /// Sets a continuous variable from outside of any evaluation. The write
    /// fails if the vector is locked.
    pub(crate) fn write(&mut self, abs: &str, values: &[f64]) -> Result<(), EvalError> {
        self.with_view(abs, |view, name| view.set(name, values))
    }

    /// Sets a discrete variable from outside of any evaluation.
    pub(crate) fn write_discrete(
        &mut self,
        abs: &str,
        value: serde_json::Value,
    ) -> Result<(), EvalError> {
        self.with_view(abs, |view, name| view.set_discrete(name, value))
    }

    fn with_view<F>(&mut self, abs: &str, f: F) -> Result<(), EvalError>
    where
        F: FnOnce(&mut View, &str) -> Result<(), EvalError>,
    {
        let Some(&(c, v)) = self.index.get(abs) else {
            return Err(EvalError::UnknownVariable {
                path: String::new(),
                class: "Group".to_string(),
                name: abs.to_string(),
            });
        };

        let info = &self.comps[c];
        let meta = &info.vars[v];
        let (vector, region, kind) = if meta.kind().is_input() {
            (&mut self.inputs, &info.inputs, VectorKind::Input)
        } else {
            (&mut self.outputs, &info.outputs, VectorKind::Output)
        };

        let (data, discrete, lock) = vector.region_mut(region);
        let mut view = View::new(kind, data, discrete, region, lock, &info.owner);
        f(&mut view, meta.name())
    }

    /// Zeroes the residuals of a component.
    pub(crate) fn clear_residuals(&mut self, idx: usize) {
        let range = self.comps[idx].outputs.range.clone();
        self.residuals.as_mut_slice()[range].fill(0.0);
    }

    /// Copies the values of the sources into the inputs of a component.
    pub(crate) fn transfer(&mut self, idx: usize) {
        let info = &self.comps[idx];
        let start = info.inputs.range.start;

        for src in &info.sources {
            let slot = &info.inputs.slots[src.slot];
            let from = &self.outputs.as_slice()[src.range.clone()];
            let to = &mut self.inputs.as_mut_slice()[start + slot.start..start + slot.start + slot.size];
            for (t, f) in to.iter_mut().zip(from) {
                *t = src.scale * f + src.shift;
            }
        }

        for src in &info.discrete_sources {
            let value = self.outputs.discrete()[src.index].clone();
            self.inputs.discrete_mut()[info.inputs.discrete_range.start + src.slot] = value;
        }
    }

    /// Evaluates a component so that its outputs satisfy its residuals, as
    /// far as the component itself can do that.
    pub(crate) fn run_solve(&mut self, root: &mut Group, idx: usize) -> Result<(), EvalError> {
        self.transfer(idx);
        let info = &self.comps[idx];
        let Some(node) = root.node_mut(&info.route) else {
            return Ok(());
        };

        let mut scratch = Scratch::copy_of(&self.outputs, &info.outputs);
        {
            let (data, discrete, lock) = self.inputs.region_mut(&info.inputs);
            let _guard = ReadOnlyGuard::new(lock);
            let mut inputs = View::new(VectorKind::Input, data, discrete, &info.inputs, lock, &info.owner);
            let mut outputs = scratch.view(VectorKind::Output, &info.owner);

            match node {
                Subsystem::Explicit(comp) => {
                    evaluate_explicit(comp.as_mut(), info, &mut inputs, &mut outputs)?
                }
                Subsystem::Implicit(comp) => comp
                    .solve_nonlinear(&mut inputs, &mut outputs)
                    .map_err(|e| e.with_owner(&info.owner))?,
                Subsystem::Group(_) => {}
            }
        }

        scratch.commit(&mut self.outputs, &info.outputs);
        Ok(())
    }

    /// Residuals of a component at the current inputs and outputs, without
    /// transferring the inputs first.
    fn residuals_of(&mut self, root: &mut Group, idx: usize) -> Result<Vec<f64>, EvalError> {
        let info = &self.comps[idx];
        let Some(node) = root.node_mut(&info.route) else {
            return Ok(vec![0.0; info.outputs.size()]);
        };

        let (in_data, in_discrete, in_lock) = self.inputs.region_mut(&info.inputs);
        let _in_guard = ReadOnlyGuard::new(in_lock);
        let mut inputs = View::new(
            VectorKind::Input,
            in_data,
            in_discrete,
            &info.inputs,
            in_lock,
            &info.owner,
        );

        match node {
            Subsystem::Explicit(comp) => {
                let mut values = Scratch::copy_of(&self.outputs, &info.outputs);
                let mut outputs = values.view(VectorKind::Output, &info.owner);
                evaluate_explicit(comp.as_mut(), info, &mut inputs, &mut outputs)?;

                let current = &self.outputs.as_slice()[info.outputs.range.clone()];
                Ok(current
                    .iter()
                    .zip(values.data())
                    .map(|(y, f)| y - f)
                    .collect())
            }
            Subsystem::Implicit(comp) => {
                let (out_data, out_discrete, out_lock) = self.outputs.region_mut(&info.outputs);
                let _out_guard = ReadOnlyGuard::new(out_lock);
                let mut outputs = View::new(
                    VectorKind::Output,
                    out_data,
                    out_discrete,
                    &info.outputs,
                    out_lock,
                    &info.owner,
                );
                let mut residuals = Scratch::zeros(&info.outputs);
                comp.apply_nonlinear(
                    &mut inputs,
                    &mut outputs,
                    &mut residuals.view(VectorKind::Residual, &info.owner),
                )
                .map_err(|e| e.with_owner(&info.owner))?;
                Ok(residuals.into_data())
            }
            Subsystem::Group(_) => Ok(vec![0.0; info.outputs.size()]),
        }
    }

    /// Evaluates the residuals of a component into the residual vector.
    pub(crate) fn run_apply(&mut self, root: &mut Group, idx: usize) -> Result<(), EvalError> {
        self.transfer(idx);
        let residuals = self.residuals_of(root, idx)?;
        let range = self.comps[idx].outputs.range.clone();
        self.residuals.as_mut_slice()[range].copy_from_slice(&residuals);
        Ok(())
    }

    /// Euclidean norm of the residuals of given components.
    pub(crate) fn residual_norm(&self, members: &[usize]) -> f64 {
        members
            .iter()
            .flat_map(|&c| self.residuals.as_slice()[self.comps[c].outputs.range.clone()].iter())
            .map(|r| r * r)
            .sum::<f64>()
            .sqrt()
    }

    /// Continuous outputs of given components, concatenated.
    pub(crate) fn gather_outputs(&self, members: &[usize]) -> DVector<f64> {
        let values: Vec<f64> = members
            .iter()
            .flat_map(|&c| self.outputs.as_slice()[self.comps[c].outputs.range.clone()].iter().copied())
            .collect();
        DVector::from_vec(values)
    }

    /// Inverse of [`gather_outputs`](Model::gather_outputs).
    pub(crate) fn scatter_outputs(&mut self, members: &[usize], values: &DVector<f64>) {
        let mut offset = 0;
        for &c in members {
            let range = self.comps[c].outputs.range.clone();
            let n = range.len();
            self.outputs.as_mut_slice()[range].copy_from_slice(&values.as_slice()[offset..offset + n]);
            offset += n;
        }
    }

    /// Inverse of [`gather_residuals`](Model::gather_residuals).
    pub(crate) fn scatter_residuals(&mut self, members: &[usize], values: &DVector<f64>) {
        let mut offset = 0;
        for &c in members {
            let range = self.comps[c].outputs.range.clone();
            let n = range.len();
            self.residuals.as_mut_slice()[range].copy_from_slice(&values.as_slice()[offset..offset + n]);
            offset += n;
        }
    }

    /// Residuals of given components, concatenated.
    pub(crate) fn gather_residuals(&self, members: &[usize]) -> DVector<f64> {
        let values: Vec<f64> = members
            .iter()
            .flat_map(|&c| {
                self.residuals.as_slice()[self.comps[c].outputs.range.clone()]
                    .iter()
                    .copied()
            })
            .collect();
        DVector::from_vec(values)
    }

    /// Global ranges of the continuous variables of a component that
    /// derivatives can be taken with respect to.
    fn wrt_ranges(&self, idx: usize) -> Vec<(String, VectorKind, Range<usize>)> {
        let info = &self.comps[idx];
        let mut ranges: Vec<_> = info
            .inputs
            .slots
            .iter()
            .map(|s| {
                let start = info.inputs.range.start + s.start;
                (s.name.clone(), VectorKind::Input, start..start + s.size)
            })
            .collect();

        if info.kind == CompKind::Implicit {
            ranges.extend(info.outputs.slots.iter().map(|s| {
                let start = info.outputs.range.start + s.start;
                (s.name.clone(), VectorKind::Output, start..start + s.size)
            }));
        }

        ranges
    }

    fn write_point(&mut self, cols: &[(String, VectorKind, Range<usize>)], x: &[f64]) {
        let mut offset = 0;
        for (_, kind, range) in cols {
            let n = range.len();
            let vector = match kind {
                VectorKind::Input => &mut self.inputs,
                _ => &mut self.outputs,
            };
            vector.as_mut_slice()[range.clone()].copy_from_slice(&x[offset..offset + n]);
            offset += n;
        }
    }

    /// Finite difference Jacobian of the residuals of a component with
    /// respect to given variables.
    fn fd(
        &mut self,
        root: &mut Group,
        idx: usize,
        cols: &[(String, VectorKind, Range<usize>)],
    ) -> Result<DMatrix<f64>, EvalError> {
        let values: Vec<f64> = cols
            .iter()
            .flat_map(|(_, kind, range)| {
                let vector = match kind {
                    VectorKind::Input => &self.inputs,
                    _ => &self.outputs,
                };
                vector.as_slice()[range.clone()].to_vec()
            })
            .collect();

        let mut x = DVector::from_vec(values);
        let scale = DVector::from_element(x.len(), 1.0);
        let fx = DVector::from_vec(self.residuals_of(root, idx)?);

        let jac = Jacobian::new(&mut x, &scale, &fx, |x| {
            self.write_point(cols, x.as_slice());
            self.residuals_of(root, idx).map(DVector::from_vec)
        });
        self.write_point(cols, x.as_slice());

        Ok(jac?.into_inner())
    }

    fn exact_partials(&mut self, root: &mut Group, idx: usize) -> Result<(), EvalError> {
        let info = &self.comps[idx];
        let Some(node) = root.node_mut(&info.route) else {
            return Ok(());
        };
        let partials = &mut self.partials[idx];

        let (in_data, in_discrete, in_lock) = self.inputs.region_mut(&info.inputs);
        let _in_guard = ReadOnlyGuard::new(in_lock);
        let mut inputs = View::new(
            VectorKind::Input,
            in_data,
            in_discrete,
            &info.inputs,
            in_lock,
            &info.owner,
        );

        let result = match node {
            Subsystem::Explicit(comp) => comp.compute_partials(&mut inputs, partials),
            Subsystem::Implicit(comp) => {
                let (out_data, out_discrete, out_lock) = self.outputs.region_mut(&info.outputs);
                let _out_guard = ReadOnlyGuard::new(out_lock);
                let mut outputs = View::new(
                    VectorKind::Output,
                    out_data,
                    out_discrete,
                    &info.outputs,
                    out_lock,
                    &info.owner,
                );
                comp.linearize(&mut inputs, &mut outputs, partials)
            }
            Subsystem::Group(_) => Ok(()),
        };

        result.map_err(|e| e.with_owner(&info.owner))
    }

    /// Approximates the pairs declared with the finite difference method.
    fn fd_partials(&mut self, root: &mut Group, idx: usize) -> Result<(), EvalError> {
        let pairs = self.partials[idx].fd_pairs();
        if pairs.is_empty() {
            return Ok(());
        }

        let cols: Vec<_> = self
            .wrt_ranges(idx)
            .into_iter()
            .filter(|(name, _, _)| pairs.iter().any(|(_, wrt)| wrt == name))
            .collect();
        let jac = self.fd(root, idx, &cols)?;

        // Explicit partials are those of the outputs, not of the residuals.
        let sign = if self.comps[idx].kind == CompKind::Explicit {
            -1.0
        } else {
            1.0
        };

        let mut offsets = BTreeMap::new();
        let mut offset = 0;
        for (name, _, range) in &cols {
            offsets.insert(name.clone(), (offset, range.len()));
            offset += range.len();
        }

        for (of, wrt) in pairs {
            let Some(row) = self.comps[idx].outputs.slot(&of).cloned() else {
                continue;
            };
            let Some(&(col, n)) = offsets.get(&wrt) else {
                continue;
            };
            let block = jac.view((row.start, col), (row.size, n)) * sign;
            self.partials[idx].store_dense(&of, &wrt, &block)?;
        }

        Ok(())
    }

    /// Linearizes a component at the current point.
    pub(crate) fn linearize(&mut self, root: &mut Group, idx: usize) -> Result<(), EvalError> {
        self.transfer(idx);
        let (kind, strategy) = (self.comps[idx].kind, self.comps[idx].strategy);
        let n_out = self.comps[idx].outputs.size();

        let op = match (kind, strategy) {
            (CompKind::AutoIvc, _) => LinearOp::Identity,
            (CompKind::Explicit, EvaluationStrategy::MatrixFree) => LinearOp::MatrixFree,
            (CompKind::Explicit, EvaluationStrategy::ComputePrimal) => {
                let cols = self.wrt_ranges(idx);
                LinearOp::Dense {
                    d_in: self.fd(root, idx, &cols)?,
                    d_out: DMatrix::identity(n_out, n_out),
                }
            }
            (CompKind::Explicit, EvaluationStrategy::ComputeApply) => {
                self.exact_partials(root, idx)?;
                self.fd_partials(root, idx)?;
                let info = &self.comps[idx];
                LinearOp::Dense {
                    d_in: -self.partials[idx].assemble(&info.outputs, &info.inputs),
                    d_out: DMatrix::identity(n_out, n_out),
                }
            }
            (CompKind::Implicit, _) => {
                self.exact_partials(root, idx)?;
                self.fd_partials(root, idx)?;
                let info = &self.comps[idx];
                LinearOp::Dense {
                    d_in: self.partials[idx].assemble(&info.outputs, &info.inputs),
                    d_out: self.partials[idx].assemble(&info.outputs, &info.outputs),
                }
            }
        };

        self.ops[idx] = op;
        Ok(())
    }

    /// Calls the matrix-free product of a component. Returns `J * seed` in
    /// forward mode and `J^T * seed` in reverse mode.
    fn jacvec(
        &mut self,
        root: &mut Group,
        idx: usize,
        seed: &[f64],
        mode: Mode,
    ) -> Result<Vec<f64>, EvalError> {
        let info = &self.comps[idx];
        let Some(Subsystem::Explicit(comp)) = root.node_mut(&info.route) else {
            return Ok(Vec::new());
        };

        let (in_data, in_discrete, in_lock) = self.inputs.region_mut(&info.inputs);
        let _in_guard = ReadOnlyGuard::new(in_lock);
        let mut inputs = View::new(
            VectorKind::Input,
            in_data,
            in_discrete,
            &info.inputs,
            in_lock,
            &info.owner,
        );

        let (mut d_inputs, mut d_outputs) = match mode {
            Mode::Fwd => (
                Scratch::from_values(&info.inputs, seed.to_vec()),
                Scratch::zeros(&info.outputs),
            ),
            Mode::Rev => (
                Scratch::zeros(&info.inputs),
                Scratch::from_values(&info.outputs, seed.to_vec()),
            ),
        };

        let result = match mode {
            Mode::Fwd => {
                let (_guard, mut seed) = d_inputs.locked_view(VectorKind::Input, &info.owner);
                let mut product = d_outputs.view(VectorKind::Output, &info.owner);
                comp.compute_jacvec_product(&mut inputs, &mut seed, &mut product, mode)
            }
            Mode::Rev => {
                let (_guard, mut seed) = d_outputs.locked_view(VectorKind::Output, &info.owner);
                let mut product = d_inputs.view(VectorKind::Input, &info.owner);
                comp.compute_jacvec_product(&mut inputs, &mut product, &mut seed, mode)
            }
        };
        result.map_err(|e| e.with_owner(&info.owner))?;

        Ok(match mode {
            Mode::Fwd => d_outputs.into_data(),
            Mode::Rev => d_inputs.into_data(),
        })
    }

    /// Forward product of the linearized residuals: `dR = dR/dx * d_in +
    /// dR/dy * d_out`.
    pub(crate) fn apply_fwd(
        &mut self,
        root: &mut Group,
        idx: usize,
        d_in: &[f64],
        d_out: &[f64],
    ) -> Result<Vec<f64>, EvalError> {
        if let LinearOp::MatrixFree = self.ops[idx] {
            let jv = self.jacvec(root, idx, d_in, Mode::Fwd)?;
            return Ok(d_out.iter().zip(jv).map(|(d, j)| d - j).collect());
        }

        Ok(match &self.ops[idx] {
            LinearOp::Dense { d_in: a, d_out: b } => {
                let r = a * DVector::from_column_slice(d_in) + b * DVector::from_column_slice(d_out);
                r.as_slice().to_vec()
            }
            _ => d_out.to_vec(),
        })
    }

    /// Reverse product of the linearized residuals. Returns the seeds of the
    /// inputs and of the outputs.
    pub(crate) fn apply_rev(
        &mut self,
        root: &mut Group,
        idx: usize,
        d_res: &[f64],
    ) -> Result<(Vec<f64>, Vec<f64>), EvalError> {
        if let LinearOp::MatrixFree = self.ops[idx] {
            let jv = self.jacvec(root, idx, d_res, Mode::Rev)?;
            return Ok((jv.into_iter().map(|j| -j).collect(), d_res.to_vec()));
        }

        Ok(match &self.ops[idx] {
            LinearOp::Dense { d_in: a, d_out: b } => {
                let seed = DVector::from_column_slice(d_res);
                (
                    a.tr_mul(&seed).as_slice().to_vec(),
                    b.tr_mul(&seed).as_slice().to_vec(),
                )
            }
            _ => (vec![0.0; self.comps[idx].inputs.size()], d_res.to_vec()),
        })
    }

    /// Compares the partial derivatives provided by the components with
    /// finite difference approximations.
    pub(crate) fn check_partials(&mut self, root: &mut Group) -> Result<Vec<PartialCheck>, EvalError> {
        let mut checks = Vec::new();

        for idx in 1..self.comps.len() {
            let (kind, strategy) = (self.comps[idx].kind, self.comps[idx].strategy);
            if kind == CompKind::Explicit && strategy == EvaluationStrategy::ComputePrimal {
                continue;
            }

            self.transfer(idx);
            let cols = self.wrt_ranges(idx);
            let fd = self.fd(root, idx, &cols)?;
            let sign = if kind == CompKind::Explicit { -1.0 } else { 1.0 };

            let analytic: Vec<(String, String, DMatrix<f64>)> = if strategy == EvaluationStrategy::MatrixFree
                && kind == CompKind::Explicit
            {
                let n_in = self.comps[idx].inputs.size();
                let n_out = self.comps[idx].outputs.size();
                let mut jac = DMatrix::zeros(n_out, n_in);
                for j in 0..n_in {
                    let mut seed = vec![0.0; n_in];
                    seed[j] = 1.0;
                    let col = self.jacvec(root, idx, &seed, Mode::Fwd)?;
                    jac.set_column(j, &DVector::from_vec(col));
                }
                let info = &self.comps[idx];
                info.outputs
                    .slots
                    .iter()
                    .flat_map(|o| {
                        let jac = &jac;
                        info.inputs.slots.iter().map(move |i| {
                            (
                                o.name.clone(),
                                i.name.clone(),
                                jac.view((o.start, i.start), (o.size, i.size)).into_owned(),
                            )
                        })
                    })
                    .collect()
            } else {
                self.exact_partials(root, idx)?;
                let fd_pairs = self.partials[idx].fd_pairs();
                let partials = &self.partials[idx];
                partials
                    .pairs()
                    .filter(|(of, wrt)| {
                        !fd_pairs
                            .iter()
                            .any(|(o, w)| o.as_str() == *of && w.as_str() == *wrt)
                    })
                    .filter_map(|(of, wrt)| {
                        partials
                            .get(of, wrt)
                            .map(|m| (of.to_string(), wrt.to_string(), m))
                    })
                    .collect()
            };

            let mut offsets = BTreeMap::new();
            let mut offset = 0;
            for (name, _, range) in &cols {
                offsets.insert(name.clone(), (offset, range.len()));
                offset += range.len();
            }

            let info = &self.comps[idx];
            for (of, wrt, m) in analytic {
                let (Some(row), Some(&(col, n))) = (info.outputs.slot(&of), offsets.get(&wrt)) else {
                    continue;
                };
                let approx = fd.view((row.start, col), (row.size, n)) * sign;
                checks.push(PartialCheck::new(info.path(), &of, &wrt, m, approx));
            }
        }

        Ok(checks)
    }
}

/// Computes the outputs of an explicit component according to its
/// evaluation strategy.
fn evaluate_explicit(
    comp: &mut dyn ExplicitComponent,
    info: &CompInfo,
    inputs: &mut View,
    outputs: &mut View,
) -> Result<(), EvalError> {
    let result = match info.strategy {
        EvaluationStrategy::ComputePrimal => evaluate_primal(comp, info, inputs, outputs),
        _ => comp.compute(inputs, outputs),
    };
    result.map_err(|e| e.with_owner(&info.owner))
}

fn evaluate_primal(
    comp: &mut dyn ExplicitComponent,
    info: &CompInfo,
    inputs: &View,
    outputs: &mut View,
) -> Result<(), EvalError> {
    let mut args = Vec::new();
    for slot in &info.inputs.slots {
        args.push(PrimalValue::Array(inputs.get(&slot.name)?.to_vec()));
    }
    for slot in &info.inputs.discrete {
        args.push(PrimalValue::Discrete(inputs.discrete(&slot.name)?.clone()));
    }

    let returned = comp.compute_primal(&args)?;

    let names: Vec<(&str, bool)> = info
        .outputs
        .slots
        .iter()
        .map(|s| (s.name.as_str(), false))
        .chain(info.outputs.discrete.iter().map(|s| (s.name.as_str(), true)))
        .collect();

    if returned.len() != names.len() {
        return Err(EvalError::PrimalArity {
            path: info.owner.path().clone(),
            class: info.owner.class().clone(),
            expected: names.len(),
            got: returned.len(),
        });
    }

    for ((name, discrete), value) in names.into_iter().zip(returned) {
        match (discrete, value) {
            (false, PrimalValue::Array(values)) => outputs.set(name, &values)?,
            (true, PrimalValue::Discrete(value)) => outputs.set_discrete(name, value)?,
            (true, PrimalValue::Array(values)) => outputs.set_discrete(name, values)?,
            (false, PrimalValue::Discrete(value)) => {
                return Err(EvalError::Custom(
                    format!("compute_primal returned {value} for continuous output '{name}'").into(),
                ))
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    use crate::core::{DeclarationError, DiscreteOptions, PartialOptions, VarOptions};
    use crate::group::InputDefaults;

    struct Scale(f64);

    impl ExplicitComponent for Scale {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            decl.add_input("x", 1.0)?;
            decl.add_output("y", 1.0)?;
            decl.declare_partials("y", "x", PartialOptions::new().with_val(self.0))
        }

        fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
            outputs.set_scalar("y", self.0 * inputs.scalar("x")?)
        }
    }

    struct Vectorized;

    impl ExplicitComponent for Vectorized {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            decl.add_input("x", VarOptions::new().with_shape_by_conn())?;
            decl.add_output("y", VarOptions::new().with_copy_shape("x"))?;
            Ok(())
        }

        fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
            let y: Vec<f64> = inputs.get("x")?.iter().map(|x| 2.0 * x).collect();
            outputs.set("y", &y)
        }
    }

    struct Source3;

    impl ExplicitComponent for Source3 {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            decl.add_input("a", 1.0)?;
            decl.add_output("v", VarOptions::new().with_val(vec![1.0, 2.0, 3.0]))?;
            Ok(())
        }

        fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
            let a = inputs.scalar("a")?;
            outputs.set("v", &[a, 2.0 * a, 3.0 * a])
        }
    }

    #[test]
    fn chain_is_ordered_and_auto_ivc_created() {
        let mut root = Group::new();
        root.add_explicit("c2", Scale(3.0)).promotes_inputs([("x", "y1")]);
        root.add_explicit("c1", Scale(2.0)).promotes_outputs([("y", "y1")]);

        let model = Model::setup(&mut root, false).unwrap();

        assert_eq!(model.conns.sources["c2.x"], "c1.y");
        assert_eq!(model.conns.sources["c1.x"], "_auto_ivc.v0");

        let order: Vec<Vec<String>> = model.blocks.iter().map(|b| b.paths(&model.comps)).collect();
        assert_eq!(
            order,
            vec![
                vec!["_auto_ivc".to_string()],
                vec!["c1".to_string()],
                vec!["c2".to_string()]
            ]
        );
        assert!(model.blocks.iter().all(|b| !b.coupled));
    }

    #[test]
    fn evaluation_follows_sources() {
        let mut root = Group::new();
        root.add_explicit("c1", Scale(2.0));
        root.add_explicit("c2", Scale(3.0));
        root.connect("c1.y", "c2.x");

        let mut model = Model::setup(&mut root, false).unwrap();
        for block in model.blocks.clone() {
            for c in block.comps {
                model.run_solve(&mut root, c).unwrap();
            }
        }

        let y = model.locate("c2.y").unwrap();
        assert_abs_diff_eq!(model.outputs.as_slice()[y.range][0], 6.0);
    }

    #[test]
    fn deferred_shapes_follow_connections() {
        let mut root = Group::new();
        root.add_explicit("src", Source3);
        root.add_explicit("vec", Vectorized);
        root.connect("src.v", "vec.x");

        let model = Model::setup(&mut root, false).unwrap();
        assert_eq!(model.meta("vec.x").unwrap().shape(), &vec![3]);
        assert_eq!(model.meta("vec.y").unwrap().shape(), &vec![3]);
    }

    #[test]
    fn unresolvable_shapes_are_reported() {
        let mut root = Group::new();
        root.add_explicit("vec", Vectorized);

        let err = Model::setup(&mut root, false).unwrap_err();
        assert!(matches!(err, SetupError::UnresolvedShapes(_) | SetupError::ShapeCycle(_)));
    }

    #[test]
    fn input_defaults_set_auto_ivc() {
        let mut root = Group::new();
        root.add_explicit("c1", Scale(2.0)).promotes_inputs(["x"]);
        root.add_explicit("c2", Scale(3.0)).promotes_inputs(["x"]);
        root.set_input_defaults("x", InputDefaults::new().with_val(5.0));

        let model = Model::setup(&mut root, false).unwrap();
        let ivc = model.locate("_auto_ivc.v0").unwrap();
        assert_abs_diff_eq!(model.outputs.as_slice()[ivc.range][0], 5.0);
        assert_eq!(model.conns.sources["c2.x"], "_auto_ivc.v0");
    }

    #[test]
    fn strict_input_defaults() {
        let mut root = Group::new();
        root.add_explicit("c1", Scale(2.0));

        let err = Model::setup(&mut root, true).unwrap_err();
        assert!(matches!(err, SetupError::MissingInputDefaults(ref inputs) if inputs == &vec!["c1.x".to_string()]));
    }

    #[test]
    fn duplicate_connection() {
        let mut root = Group::new();
        root.add_explicit("c1", Scale(2.0));
        root.add_explicit("c2", Scale(2.0));
        root.add_explicit("c3", Scale(2.0));
        root.connect("c1.y", "c3.x");
        root.connect("c2.y", "c3.x");

        let err = Model::setup(&mut root, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Input 'c3.x' cannot be connected to 'c2.y' because it's already connected to 'c1.y'."
        );
    }

    #[test]
    fn connection_from_input() {
        let mut root = Group::new();
        root.add_explicit("c1", Scale(2.0));
        root.add_explicit("c2", Scale(2.0));
        root.connect("c1.x", "c2.x");

        let err = Model::setup(&mut root, false).unwrap_err();
        assert!(matches!(err, SetupError::ConnectFromInput { .. }));
    }

    #[test]
    fn duplicate_subsystem_name() {
        let mut root = Group::new();
        root.add_explicit("c1", Scale(2.0));
        root.add_explicit("c1", Scale(2.0));

        let err = Model::setup(&mut root, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "<model> <class Group>: Subsystem name 'c1' is already used."
        );
    }

    #[test]
    fn cycle_forms_one_block() {
        let mut root = Group::new();
        root.add_explicit("a", Scale(0.5));
        root.add_explicit("b", Scale(0.5));
        root.connect("a.y", "b.x");
        root.connect("b.y", "a.x");

        let model = Model::setup(&mut root, false).unwrap();
        let coupled: Vec<&Block> = model.blocks.iter().filter(|b| b.coupled).collect();
        assert_eq!(coupled.len(), 1);
        assert_eq!(coupled[0].paths(&model.comps), vec!["a", "b"]);
    }

    #[test]
    fn explicit_linearization() {
        let mut root = Group::new();
        root.add_explicit("c1", Scale(2.0));
        let mut model = Model::setup(&mut root, false).unwrap();

        model.linearize(&mut root, 1).unwrap();
        let d_res = model.apply_fwd(&mut root, 1, &[1.0], &[0.5]).unwrap();
        assert_abs_diff_eq!(d_res[0], 0.5 - 2.0);

        let (d_in, d_out) = model.apply_rev(&mut root, 1, &[1.0]).unwrap();
        assert_abs_diff_eq!(d_in[0], -2.0);
        assert_abs_diff_eq!(d_out[0], 1.0);
    }

    #[test]
    fn repeated_connection_is_an_error() {
        let mut root = Group::new();
        root.add_explicit("a", Scale(2.0));
        root.add_explicit("b", Scale(2.0));
        root.connect("a.y", "b.x");
        root.connect("a.y", "b.x");

        let err = Model::setup(&mut root, false).unwrap_err();
        assert_eq!(err.to_string(), "Input 'b.x' is already connected to 'a.y'.");
    }

    struct Triple;

    impl ExplicitComponent for Triple {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            decl.add_input("x", vec![1.0, 1.0, 1.0])?;
            decl.add_output("y", 1.0)?;
            Ok(())
        }

        fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
            outputs.set_scalar("y", inputs.get("x")?.iter().sum())
        }
    }

    #[test]
    fn input_default_of_wrong_size() {
        let mut root = Group::new();
        root.add_explicit("c", Triple).promotes_inputs(["x"]);
        root.set_input_defaults("x", InputDefaults::new().with_val(vec![1.0, 2.0]));

        let err = Model::setup(&mut root, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The default value of 'x' has size 2 but the promoted inputs have shape [3]."
        );
    }

    /// Dot product with a discrete input, declared with configurable names.
    struct PrimalDot {
        params: [&'static str; 3],
        inputs: [(&'static str, Option<&'static str>); 3],
        outputs: [(&'static str, Option<&'static str>); 2],
    }

    impl PrimalDot {
        fn new() -> Self {
            Self {
                params: ["x", "y", "disc_in"],
                inputs: [("x", None), ("y", None), ("disc_in", None)],
                outputs: [("z", None), ("zz", None)],
            }
        }
    }

    impl ExplicitComponent for PrimalDot {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            for (i, (name, primal)) in self.inputs.iter().enumerate() {
                if i < 2 {
                    let mut options = VarOptions::from(vec![1.0, 1.0]);
                    if let Some(primal) = primal {
                        options = options.with_primal_name(*primal);
                    }
                    decl.add_input(name, options)?;
                } else {
                    let mut options = DiscreteOptions::new(3);
                    if let Some(primal) = primal {
                        options = options.with_primal_name(*primal);
                    }
                    decl.add_discrete_input(name, options)?;
                }
            }
            for (name, primal) in &self.outputs {
                let mut options = VarOptions::from(1.0);
                if let Some(primal) = primal {
                    options = options.with_primal_name(*primal);
                }
                decl.add_output(name, options)?;
            }
            Ok(())
        }

        fn primal_signature(&self) -> Option<PrimalSignature> {
            Some(PrimalSignature::new(self.params, ["z", "zz"]))
        }

        fn evaluation_strategy(&self) -> EvaluationStrategy {
            EvaluationStrategy::ComputePrimal
        }
    }

    fn primal_error(comp: PrimalDot) -> String {
        let mut root = Group::new();
        root.add_explicit("comp", comp);
        match Model::setup(&mut root, false) {
            Err(err @ SetupError::Primal { .. }) => err.to_string(),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    const INPUT_HINT: &str = "To map inputs to the compute_primal method, set the name used in \
        compute_primal to the 'primal_name' arg when calling add_input/add_discrete_input. This is \
        only necessary if the declared component input name is not a valid identifier.";

    const OUTPUT_HINT: &str = "To map outputs to the compute_primal method, set the name used in \
        compute_primal to the 'primal_name' arg when calling add_output/add_discrete_output. This \
        is only necessary if the declared component output name is not a valid identifier.";

    #[test]
    fn mapped_primal_names_are_accepted() {
        let mut comp = PrimalDot::new();
        comp.inputs = [("my:x", Some("x")), ("my:y", Some("y")), ("my:disc_in", Some("disc_in"))];
        comp.outputs = [("my:z", Some("z")), ("my:zz", Some("zz"))];

        let mut root = Group::new();
        root.add_explicit("comp", comp);
        assert!(Model::setup(&mut root, false).is_ok());
    }

    #[test]
    fn primal_inputs_in_wrong_order() {
        let mut comp = PrimalDot::new();
        comp.inputs = [("my:y", Some("y")), ("my:x", Some("x")), ("my:disc_in", Some("disc_in"))];

        assert_eq!(
            primal_error(comp),
            format!(
                "'comp' <class PrimalDot>: compute_primal method args ['x', 'y', 'disc_in'] don't \
                 match the args ['y', 'x', 'disc_in'] mapped from this component's inputs. {INPUT_HINT}"
            )
        );
    }

    #[test]
    fn primal_outputs_in_wrong_order() {
        let mut comp = PrimalDot::new();
        comp.outputs = [("zz", None), ("z", None)];

        assert_eq!(
            primal_error(comp),
            format!(
                "'comp' <class PrimalDot>: compute_primal method returns z for return value 0 but \
                 the name of the output that was mapped for this component is zz. {OUTPUT_HINT}"
            )
        );
    }

    #[test]
    fn primal_inputs_without_mapping() {
        let mut comp = PrimalDot::new();
        comp.inputs = [("my:x", None), ("my:y", None), ("my:disc_in", None)];

        assert_eq!(
            primal_error(comp),
            format!(
                "'comp' <class PrimalDot>: compute_primal method args ['x', 'y', 'disc_in'] don't \
                 match the args ['my:x', 'my:y', 'my:disc_in'] mapped from this component's \
                 inputs. {INPUT_HINT}"
            )
        );
    }

    #[test]
    fn primal_outputs_without_mapping() {
        let mut comp = PrimalDot::new();
        comp.outputs = [("my:z", None), ("my:zz", None)];

        assert_eq!(
            primal_error(comp),
            format!(
                "'comp' <class PrimalDot>: compute_primal method returns z for return value 0 but \
                 the name of the output that was mapped for this component is my:z. {OUTPUT_HINT}"
            )
        );
    }

    #[test]
    fn unmapped_primal_names_must_be_identifiers() {
        let mut comp = PrimalDot::new();
        comp.params = ["my:x", "y", "disc_in"];
        comp.inputs = [("my:x", None), ("y", None), ("disc_in", None)];

        assert_eq!(
            primal_error(comp),
            format!(
                "'comp' <class PrimalDot>: compute_primal method arg 'my:x' is not a valid \
                 identifier. {INPUT_HINT}"
            )
        );
    }

    #[test]
    fn identifier_rule() {
        assert!(is_identifier("x"));
        assert!(is_identifier("_disc_in2"));
        assert!(!is_identifier("my:x"));
        assert!(!is_identifier("2x"));
        assert!(!is_identifier(""));
    }
}
