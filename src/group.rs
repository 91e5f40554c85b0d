//! Groups of subsystems.
//!
//! A [`Group`] owns its subsystems (components or other groups) under names
//! unique among siblings. When a subsystem is added, the returned
//! [`Promotes`] decides which of its variables are visible in the group under
//! their own (possibly renamed) name instead of `child.name`.
//!
//! ```rust
//! use mdao::{Group, InputDefaults};
//! # use mdao::{Declarations, DeclarationError, ExplicitComponent};
//! # struct Comp;
//! # impl ExplicitComponent for Comp {
//! #     fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
//! #         decl.add_input("x", 1.0)?;
//! #         decl.add_output("y", 1.0)?;
//! #         Ok(())
//! #     }
//! # }
//!
//! let mut model = Group::new();
//! model.add_explicit("c1", Comp).promotes_inputs(["x"]);
//! model.add_explicit("c2", Comp).promotes_inputs([("x", "x2")]);
//! model.connect("c1.y", "x2");
//! model.set_input_defaults("x", InputDefaults::new().with_val(3.0));
//! ```

use crate::core::{Array, ExplicitComponent, ImplicitComponent};
use crate::solver::NonlinearSolver;

/// A single promotion rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promote {
    /// Glob pattern (`*`, `?`) matching names that keep their name.
    Pattern(String),
    /// Exact name promoted under a new name.
    Rename(String, String),
}

impl Promote {
    pub(crate) fn label(&self) -> String {
        match self {
            Promote::Pattern(p) => p.clone(),
            Promote::Rename(old, new) => format!("('{old}', '{new}')"),
        }
    }
}

impl From<&str> for Promote {
    fn from(pattern: &str) -> Self {
        Promote::Pattern(pattern.to_string())
    }
}

impl From<String> for Promote {
    fn from(pattern: String) -> Self {
        Promote::Pattern(pattern)
    }
}

impl From<(&str, &str)> for Promote {
    fn from((old, new): (&str, &str)) -> Self {
        Promote::Rename(old.to_string(), new.to_string())
    }
}

/// Promotions of a subsystem into its parent group.
#[derive(Debug, Clone, Default)]
pub struct Promotes {
    pub(crate) any: Vec<Promote>,
    pub(crate) inputs: Vec<Promote>,
    pub(crate) outputs: Vec<Promote>,
}

impl Promotes {
    /// Promotes matching inputs and outputs.
    pub fn promotes<I>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<Promote>,
    {
        self.any.extend(names.into_iter().map(Into::into));
        self
    }

    /// Promotes matching inputs.
    pub fn promotes_inputs<I>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<Promote>,
    {
        self.inputs.extend(names.into_iter().map(Into::into));
        self
    }

    /// Promotes matching outputs.
    pub fn promotes_outputs<I>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<Promote>,
    {
        self.outputs.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Default value and units of a promoted input that has no source.
#[derive(Debug, Clone, Default)]
pub struct InputDefaults {
    pub(crate) val: Option<Array>,
    pub(crate) units: Option<String>,
}

impl InputDefaults {
    /// Empty defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default value.
    pub fn with_val(mut self, val: impl Into<Array>) -> Self {
        self.val = Some(val.into());
        self
    }

    /// Units of the default value.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }
}

/// A node of the model tree.
pub enum Subsystem {
    /// Explicit component.
    Explicit(Box<dyn ExplicitComponent>),
    /// Implicit component.
    Implicit(Box<dyn ImplicitComponent>),
    /// Nested group.
    Group(Group),
}

pub(crate) struct Child {
    pub(crate) name: String,
    pub(crate) system: Subsystem,
    pub(crate) promotes: Promotes,
}

/// Composite of subsystems.
#[derive(Default)]
pub struct Group {
    children: Vec<Child>,
    connections: Vec<(String, String)>,
    input_defaults: Vec<(String, InputDefaults)>,
    nonlinear_solver: Option<NonlinearSolver>,
}

impl Group {
    /// Empty group.
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, name: impl Into<String>, system: Subsystem) -> &mut Promotes {
        self.children.push(Child {
            name: name.into(),
            system,
            promotes: Promotes::default(),
        });
        let last = self.children.len() - 1;
        &mut self.children[last].promotes
    }

    /// Adds an explicit component.
    pub fn add_explicit<C>(&mut self, name: impl Into<String>, comp: C) -> &mut Promotes
    where
        C: ExplicitComponent + 'static,
    {
        self.add(name, Subsystem::Explicit(Box::new(comp)))
    }

    /// Adds an implicit component.
    pub fn add_implicit<C>(&mut self, name: impl Into<String>, comp: C) -> &mut Promotes
    where
        C: ImplicitComponent + 'static,
    {
        self.add(name, Subsystem::Implicit(Box::new(comp)))
    }

    /// Adds a nested group.
    pub fn add_group(&mut self, name: impl Into<String>, group: Group) -> &mut Promotes {
        self.add(name, Subsystem::Group(group))
    }

    /// Connects an output to an input. Names are promoted names in this group
    /// or paths relative to it.
    pub fn connect(&mut self, src: impl Into<String>, tgt: impl Into<String>) {
        self.connections.push((src.into(), tgt.into()));
    }

    /// Sets the value and units of the automatic source of a promoted input.
    pub fn set_input_defaults(&mut self, name: impl Into<String>, defaults: InputDefaults) {
        self.input_defaults.push((name.into(), defaults));
    }

    /// Sets the solver used for coupled subsystems of this group.
    pub fn set_nonlinear_solver(&mut self, solver: impl Into<NonlinearSolver>) {
        self.nonlinear_solver = Some(solver.into());
    }

    pub(crate) fn children(&self) -> &[Child] {
        &self.children
    }

    pub(crate) fn connections(&self) -> &[(String, String)] {
        &self.connections
    }

    pub(crate) fn input_defaults(&self) -> &[(String, InputDefaults)] {
        &self.input_defaults
    }

    pub(crate) fn nonlinear_solver(&self) -> Option<&NonlinearSolver> {
        self.nonlinear_solver.as_ref()
    }

    pub(crate) fn children_mut(&mut self) -> &mut [Child] {
        &mut self.children
    }

    /// Follows child indices down the tree.
    pub(crate) fn node_mut(&mut self, route: &[usize]) -> Option<&mut Subsystem> {
        let (&first, rest) = route.split_first()?;
        let node = &mut self.children.get_mut(first)?.system;
        if rest.is_empty() {
            return Some(node);
        }
        match node {
            Subsystem::Group(group) => group.node_mut(rest),
            _ => None,
        }
    }
}
