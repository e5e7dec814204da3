//! The variable store: the base abstract domain mapping every abstract
//! variable to an interval universe. Narrowings are recorded on a trail so
//! that snapshots are cheap trail positions rather than deep copies.

use index_vec::IndexVec;
use tracing::trace;

use crate::{
	domain::{Deinterpret, Domain, Refinable, TellVar},
	interval::Interval,
	logic::{Formula, InterpretationError, Sig, VarEnv},
	AType, AVar,
};

index_vec::define_index_type! {
	/// Identifies a variable within a [`VStore`].
	pub struct VarIx = u32;
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// The base abstract domain mapping abstract variables to intervals.
///
/// All narrowings go through [`TellVar::tell_var`], which records the
/// previous universe of the variable on an internal trail. A snapshot of the
/// store is the current trail length; restoring unwinds the trail back to the
/// captured position.
pub struct VStore {
	/// The abstract type identifying this store.
	aty: AType,
	/// The universe currently associated with each variable.
	values: IndexVec<VarIx, Interval>,
	/// Previous universes of narrowed variables, in narrowing order.
	trail: Vec<(VarIx, Interval)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Snapshot of a [`VStore`]: the length of its trail at capture time.
pub struct StoreSnapshot {
	/// Trail length when the snapshot was taken.
	trail_len: usize,
}

/// Tell delta of a [`VStore`]: a list of variable narrowings.
pub type StoreTell = Vec<(AVar, Interval)>;

/// Ask delta of a [`VStore`]: a list of intervals that must each contain the
/// universe of their variable.
pub type StoreAsk = Vec<(AVar, Interval)>;

impl VStore {
	/// Name of the component in diagnostics.
	const NAME: &'static str = "VStore";

	/// Create a store with `vars` unconstrained variables, identified by the
	/// abstract type `aty`.
	pub fn new(aty: AType, vars: usize) -> Self {
		Self {
			aty,
			values: IndexVec::from_vec(vec![Interval::bot(); vars]),
			trail: Vec::new(),
		}
	}

	/// The abstract type identifying this store.
	pub fn aty(&self) -> AType {
		self.aty
	}

	/// The index of `x` within this store.
	fn ix(&self, x: AVar) -> VarIx {
		debug_assert!(
			x.is_untyped() || x.aty() == self.aty,
			"variable {x} projected in store {}",
			self.aty
		);
		VarIx::from_usize(x.vid())
	}

	/// Interpret the atom `x <sig> k` over a single variable, shared by the
	/// tell and ask interpretations.
	fn interpret_atom(
		&self,
		f: &Formula,
		env: &VarEnv,
	) -> Result<(AVar, Interval), InterpretationError> {
		if let Formula::Seq(sig, children) = f {
			if let [var, Formula::Z(k)] = children.as_slice() {
				let x = match var {
					Formula::AVar(x) => Some(*x),
					Formula::LVar(name) => env.get(name),
					_ => None,
				};
				let Some(x) = x else {
					return Err(InterpretationError::new(
						Self::NAME,
						"the left-hand side of an atom must be a declared variable",
						f,
					));
				};
				if let Some(u) = Interval::interpret_atom(*sig, *k) {
					return Ok((x, u));
				}
			}
		}
		Err(InterpretationError::new(
			Self::NAME,
			"the store only interprets atoms of the form `x <op> k` over a single variable",
			f,
		))
	}

	/// Interpret `f` as a list of variable narrowings, flattening
	/// conjunctions.
	fn interpret(
		&self,
		f: &Formula,
		env: &VarEnv,
		out: &mut Vec<(AVar, Interval)>,
	) -> Result<(), InterpretationError> {
		match f {
			Formula::Seq(Sig::And, children) => {
				for c in children {
					self.interpret(c, env, out)?;
				}
				Ok(())
			}
			_ => {
				out.push(self.interpret_atom(f, env)?);
				Ok(())
			}
		}
	}
}

impl Domain for VStore {
	type Ask = StoreAsk;
	type Snapshot = StoreSnapshot;
	type Tell = StoreTell;

	fn interpret_tell(&self, f: &Formula, env: &VarEnv) -> Result<StoreTell, InterpretationError> {
		let mut out = Vec::new();
		self.interpret(f, env, &mut out)?;
		Ok(out)
	}

	fn interpret_ask(&self, f: &Formula, env: &VarEnv) -> Result<StoreAsk, InterpretationError> {
		let mut out = Vec::new();
		self.interpret(f, env, &mut out)?;
		Ok(out)
	}

	fn tell(&mut self, t: &StoreTell) -> bool {
		let mut has_changed = false;
		for &(x, u) in t {
			has_changed |= self.tell_var(x, u);
		}
		has_changed
	}

	fn ask(&self, a: &StoreAsk) -> bool {
		a.iter().all(|&(x, u)| u.contains(&self.project(x)))
	}

	fn project(&self, x: AVar) -> Interval {
		self.values[self.ix(x)]
	}

	fn vars(&self) -> usize {
		self.values.len()
	}

	fn is_bot(&self) -> bool {
		self.values.iter().all(Interval::is_bot)
	}

	fn is_top(&self) -> bool {
		self.values.iter().any(Interval::is_top)
	}

	fn is_extractable(&self) -> bool {
		!self.is_top()
	}

	fn extract(&self, target: &mut VStore) {
		debug_assert_eq!(
			self.aty, target.aty,
			"extraction target must share the abstract type of the store"
		);
		target.values = self.values.clone();
		target.trail.clear();
	}

	fn snapshot(&self) -> StoreSnapshot {
		StoreSnapshot {
			trail_len: self.trail.len(),
		}
	}

	fn restore(&mut self, snap: &StoreSnapshot) {
		while self.trail.len() > snap.trail_len {
			let (ix, u) = self.trail.pop().unwrap();
			self.values[ix] = u;
		}
	}
}

impl Refinable for VStore {
	fn num_refinements(&self) -> usize {
		0
	}

	fn refine(&mut self, _i: usize) -> bool {
		false
	}
}

impl TellVar for VStore {
	fn tell_var(&mut self, x: AVar, u: Interval) -> bool {
		let ix = self.ix(x);
		let old = self.values[ix];
		let new = old.join(u);
		if new == old {
			return false;
		}
		trace!(var = x.vid(), from = %old, to = %new, "narrow variable");
		self.trail.push((ix, old));
		self.values[ix] = new;
		true
	}
}

impl Deinterpret for VStore {
	fn deinterpret(&self, _env: &VarEnv) -> Formula {
		let conjuncts = self
			.values
			.iter_enumerated()
			.filter(|(_, u)| !u.is_bot())
			.map(|(ix, u)| u.deinterpret(AVar::new(self.aty, ix.index())))
			.collect::<Vec<_>>();
		Formula::Seq(Sig::And, conjuncts)
	}
}

#[cfg(test)]
mod tests {
	use crate::{
		domain::{Domain, TellVar},
		interval::Interval,
		logic::{Formula, Sig, VarEnv},
		store::VStore,
		AVar,
	};

	#[test]
	fn test_tell_and_project() {
		let mut store = VStore::new(0, 2);
		let x = AVar::new(0, 0);
		let y = AVar::new(0, 1);
		assert!(store.is_bot());
		assert!(store.tell_var(x, Interval::new(0, 10)));
		assert!(store.tell_var(y, Interval::new(-5, 5)));
		assert!(!store.tell_var(x, Interval::new(-2, 12)));
		assert_eq!(store.project(x), Interval::new(0, 10));
		assert!(!store.is_bot());
		assert!(!store.is_top());
		assert!(store.tell_var(y, Interval::new(6, 8)));
		assert!(store.is_top());
		assert!(!store.is_extractable());
	}

	#[test]
	fn test_snapshot_restore_round_trip() {
		let mut store = VStore::new(0, 3);
		let vars: Vec<_> = (0..3).map(|i| AVar::new(0, i)).collect();
		for &x in &vars {
			let _ = store.tell_var(x, Interval::new(0, 9));
		}
		let snap = store.snapshot();
		let observed: Vec<_> = vars.iter().map(|&x| store.project(x)).collect();

		let _ = store.tell_var(vars[0], Interval::singleton(3));
		let _ = store.tell_var(vars[2], Interval::new(4, 9));
		let _ = store.tell_var(vars[2], Interval::new(4, 5));
		store.restore(&snap);
		for (x, before) in vars.iter().zip(observed) {
			assert_eq!(store.project(*x), before);
		}

		// Restoring a snapshot that captured the current state is a no-op.
		let roundtrip = store.snapshot();
		store.restore(&roundtrip);
		for &x in &vars {
			assert_eq!(store.project(x), Interval::new(0, 9));
		}
	}

	#[test]
	fn test_interpret_tell() {
		let mut store = VStore::new(0, 1);
		let mut env = VarEnv::default();
		let x = AVar::new(0, 0);
		env.bind("x", x);

		let f = Formula::Seq(
			Sig::And,
			vec![
				Formula::binary(Formula::lvar("x"), Sig::Geq, Formula::z(0)),
				Formula::binary(Formula::lvar("x"), Sig::Lt, Formula::z(4)),
			],
		);
		let t = store.interpret_tell(&f, &env).unwrap();
		assert!(store.tell(&t));
		assert_eq!(store.project(x), Interval::new(0, 3));

		let neq = Formula::binary(Formula::lvar("x"), Sig::Neq, Formula::z(2));
		assert!(store.interpret_tell(&neq, &env).is_err());
		// A failed interpretation leaves the store untouched.
		assert_eq!(store.project(x), Interval::new(0, 3));
	}
}
