//! Core abstractions and types.
//!
//! *Users* are mainly interested in implementing the [`ExplicitComponent`] or
//! [`ImplicitComponent`] trait and declaring variables through
//! [`Declarations`].

mod array;
mod component;
mod error;
mod metadata;

pub use array::*;
pub use component::*;
pub use error::*;
pub use metadata::*;
