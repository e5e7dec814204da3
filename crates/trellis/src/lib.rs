//! # Trellis - A Compositional Constraint Solving Kernel
//!
//! Trellis solves decision and optimization problems by combining a stack of
//! cooperating *abstract domains*: a variable store at the bottom, propagation
//! domains in the middle, and a depth-first search tree with an optional
//! branch-and-bound wrapper on top. Each domain is a lattice element that can
//! interpret logic formulas into its own internal representation (a *tell*
//! that narrows the domain, or an *ask* that queries entailment), and exposes
//! snapshot/restore operations so the search can backtrack cheaply.
//!
//! The lattice convention used throughout the crate is the information
//! ordering: *bot* means "no information" (an unconstrained element) and
//! *top* means "infeasible or completely explored". Telling a domain moves it
//! up this ordering and is always monotone.

pub mod domain;
pub mod fixpoint;
pub mod interval;
pub mod logic;
pub mod propagation;
pub mod search;
pub mod store;
pub mod tables;
#[cfg(test)]
pub(crate) mod tests;

use std::fmt;

pub use crate::{
	domain::{Deinterpret, Domain, Refinable, TellVar},
	fixpoint::GaussSeidel,
	interval::Interval,
	logic::{Formula, InterpretationError, Sig, VarEnv},
	propagation::Propagation,
	search::{
		bab::{Bab, Goal, Objective},
		branch::Branch,
		split::{SplitStrategy, Strategy, ValueOrder, VariableOrder},
		tree::SearchTree,
	},
	store::VStore,
	tables::Tables,
};

/// Type alias for the type of integer values manipulated by the universes of
/// the crate.
pub type IntVal = i64;

/// Identifier of an abstract domain in a stack of domains, usually called the
/// "abstract type" of the domain.
///
/// Every domain of a solving stack is created with a distinct abstract type.
/// Variables carry the abstract type of the domain that hosts them.
pub type AType = i32;

/// The abstract type of variables that have not (yet) been associated with a
/// particular domain.
pub const UNTYPED: AType = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// A reference to a variable hosted by an abstract domain.
///
/// An abstract variable is a pair of the abstract type of the hosting domain
/// and the index of the variable within that domain. Two abstract variables
/// are equal whenever both components are equal.
pub struct AVar {
	/// The abstract type of the domain hosting the variable.
	aty: AType,
	/// The index of the variable within its hosting domain.
	vid: usize,
}

impl AVar {
	/// Create a reference to variable `vid` of the domain identified by `aty`.
	pub fn new(aty: AType, vid: usize) -> Self {
		Self { aty, vid }
	}

	/// Create a variable reference that is not associated with any domain.
	pub fn untyped() -> Self {
		Self {
			aty: UNTYPED,
			vid: 0,
		}
	}

	/// The abstract type of the domain hosting this variable.
	pub fn aty(&self) -> AType {
		self.aty
	}

	/// The index of this variable within its hosting domain.
	pub fn vid(&self) -> usize {
		self.vid
	}

	/// Whether this variable reference is not associated with any domain.
	pub fn is_untyped(&self) -> bool {
		self.aty == UNTYPED
	}
}

impl fmt::Display for AVar {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_untyped() {
			write!(f, "x?")
		} else {
			write!(f, "x{}@{}", self.vid, self.aty)
		}
	}
}
