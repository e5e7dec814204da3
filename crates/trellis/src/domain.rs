//! The interfaces shared by the abstract domains of a solving stack.

use crate::{
	interval::Interval,
	logic::{Formula, InterpretationError, VarEnv},
	store::VStore,
	AVar,
};

/// Interface of an abstract domain in a solving stack.
///
/// A domain is a lattice element in the information ordering: *bot* carries no
/// information and *top* is infeasible or completely explored. Formulas are
/// first interpreted — a pure operation producing a tell or an ask — and the
/// resulting value is then told or asked separately, so that interpretation
/// errors never leave a domain partially updated.
pub trait Domain {
	/// A delta that narrows this domain when told.
	type Tell: Clone + std::fmt::Debug;
	/// A query checking whether a property is entailed by this domain.
	type Ask;
	/// An opaque value restoring this domain to an earlier state.
	///
	/// For any domain `a`, `a.restore(&a.snapshot())` leaves the observable
	/// state of `a` unchanged.
	type Snapshot: Clone;

	/// Interpret `f` as a delta narrowing this domain.
	fn interpret_tell(
		&self,
		f: &Formula,
		env: &VarEnv,
	) -> Result<Self::Tell, InterpretationError>;

	/// Interpret `f` as an entailment query on this domain.
	fn interpret_ask(&self, f: &Formula, env: &VarEnv)
		-> Result<Self::Ask, InterpretationError>;

	/// Narrow this domain with `t`. Returns whether the domain changed.
	///
	/// Telling is monotone: information is only ever added.
	fn tell(&mut self, t: &Self::Tell) -> bool;

	/// Whether the property described by `a` is entailed by this domain.
	fn ask(&self, a: &Self::Ask) -> bool;

	/// The universe value currently associated with the variable `x`.
	fn project(&self, x: AVar) -> Interval;

	/// The number of variables hosted by this domain.
	fn vars(&self) -> usize;

	/// Whether this domain carries no information.
	fn is_bot(&self) -> bool;

	/// Whether this domain is infeasible or completely explored.
	fn is_top(&self) -> bool;

	/// Whether a single concrete solution can be read out of this domain.
	fn is_extractable(&self) -> bool;

	/// Copy the current solution into `target`.
	///
	/// Only meaningful when [`Domain::is_extractable`] holds.
	fn extract(&self, target: &mut VStore);

	/// Capture the current state of this domain.
	fn snapshot(&self) -> Self::Snapshot;

	/// Restore this domain to the state captured in `snap`.
	fn restore(&mut self, snap: &Self::Snapshot);
}

/// Indexable narrowing interface of the propagation domains.
///
/// Refinements are addressed by index so that an external driver can schedule
/// them freely, including in parallel sweeps; each index narrows the domain
/// monotonically and is safe to repeat at a fixed point.
pub trait Refinable {
	/// The number of refinement operations this domain exposes.
	fn num_refinements(&self) -> usize;

	/// Apply the `i`-th refinement. Returns whether the domain changed.
	fn refine(&mut self, i: usize) -> bool;
}

/// Direct narrowing of a single variable of a store-backed domain.
pub trait TellVar {
	/// Narrow the universe of `x` with `u`. Returns whether the domain
	/// changed.
	fn tell_var(&mut self, x: AVar, u: Interval) -> bool;
}

/// Reconstruction of a formula describing the current state of a domain.
pub trait Deinterpret {
	/// A formula whose interpretation in a fresh copy of this domain would
	/// reproduce its current state.
	fn deinterpret(&self, env: &VarEnv) -> Formula;
}
