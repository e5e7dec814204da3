//! Helpers shared by the unit tests of the crate.

use std::{cell::RefCell, rc::Rc};

use itertools::Itertools;

use crate::{
	domain::Domain,
	logic::{Formula, Sig, VarEnv},
	store::VStore,
	AType, AVar, IntVal,
};

/// Create an unconstrained store with one variable per name, and an
/// environment declaring them.
pub(crate) fn store_with_env(aty: AType, names: &[&str]) -> (Rc<RefCell<VStore>>, VarEnv) {
	let store = Rc::new(RefCell::new(VStore::new(aty, names.len())));
	let mut env = VarEnv::default();
	for (i, name) in names.iter().enumerate() {
		env.bind(name, AVar::new(aty, i));
	}
	(store, env)
}

/// The atoms `lb <= x` and `x <= ub` for every named variable.
pub(crate) fn bounds_atoms(names: &[&str], lb: IntVal, ub: IntVal) -> Vec<Formula> {
	names
		.iter()
		.flat_map(|name| {
			[
				Formula::binary(Formula::lvar(name), Sig::Geq, Formula::z(lb)),
				Formula::binary(Formula::lvar(name), Sig::Leq, Formula::z(ub)),
			]
		})
		.collect()
}

/// Whether every variable of the store is assigned to a single value.
pub(crate) fn all_assigned(store: &VStore) -> bool {
	(0..store.vars()).all(|i| store.project(AVar::new(store.aty(), i)).is_singleton())
}

/// The assigned values of the store, in variable order.
pub(crate) fn assignment(store: &VStore) -> String {
	(0..store.vars())
		.map(|i| {
			let u = store.project(AVar::new(store.aty(), i));
			debug_assert!(u.is_singleton());
			u.lb()
		})
		.join(", ")
}
