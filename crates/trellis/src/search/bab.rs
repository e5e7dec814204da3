//! Branch-and-bound on top of a search tree: detect solution candidates,
//! record the best one found so far, and post a bound-tightening constraint
//! after each solution so that strictly worse ones become unreachable.

use std::{
	cell::{Ref, RefCell},
	rc::Rc,
};

use tracing::{debug, warn};

use crate::{
	domain::Domain,
	interval::{NEG_INF, POS_INF},
	logic::{Formula, InterpretationError, Sig, VarEnv},
	store::VStore,
	AType, AVar, IntVal,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Direction of the optimization objective.
pub enum Goal {
	/// Maximize the value of the objective variable.
	Maximize,
	/// Minimize the value of the objective variable.
	Minimize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// An optimization objective: a variable and the direction to optimize it in.
pub struct Objective {
	/// The variable being optimized.
	pub var: AVar,
	/// The direction of the optimization.
	pub goal: Goal,
}

#[derive(Clone, Debug)]
/// Tell delta of a [`Bab`] domain: updates forwarded to the subdomain, plus
/// at most one objective declaration.
pub struct BabTell<T> {
	/// The objective declared by the formula, if any.
	objective: Option<Objective>,
	/// Updates forwarded to the subdomain.
	sub_tells: Vec<T>,
}

/// Branch-and-bound wrapper around a search tree.
///
/// Until an objective is told the search runs in satisfaction mode: every
/// solution found simply replaces `best`. Once `minimize(v)` or `maximize(v)`
/// has been told, each recorded solution additionally posts the constraint
/// `v < best.lb(v)` (respectively `v > best.ub(v)`) to the subdomain, so
/// `best` strictly improves over the rest of the search.
pub struct Bab<A: Domain> {
	/// The abstract type identifying this domain.
	aty: AType,
	/// The subdomain explored by the search, usually a search tree.
	sub: Rc<RefCell<A>>,
	/// The best solution found so far; an independent copy of the store.
	best: Rc<RefCell<VStore>>,
	/// The declared objective, or `None` in satisfaction mode.
	objective: Option<Objective>,
	/// Number of solutions recorded so far.
	solutions_found: usize,
}

impl<A: Domain> Bab<A> {
	/// Name of the component in diagnostics.
	const NAME: &'static str = "BAB";

	/// Create a branch-and-bound wrapper exploring `sub` and recording the
	/// best solution in `best`, identified by the abstract type `aty`.
	///
	/// `best` must be an independent store sharing the abstract type of the
	/// store underlying `sub`; it is never narrowed by the live search.
	pub fn new(aty: AType, sub: Rc<RefCell<A>>, best: Rc<RefCell<VStore>>) -> Self {
		Self {
			aty,
			sub,
			best,
			objective: None,
			solutions_found: 0,
		}
	}

	/// The abstract type identifying this domain.
	pub fn aty(&self) -> AType {
		self.aty
	}

	/// Interpret `f`, recognising the `minimize(v)` and `maximize(v)`
	/// predicates and flattening conjunctions; everything else is forwarded
	/// to the subdomain.
	pub fn interpret_tell(
		&self,
		f: &Formula,
		env: &VarEnv,
	) -> Result<BabTell<A::Tell>, InterpretationError> {
		let mut tell = BabTell {
			objective: None,
			sub_tells: Vec::new(),
		};
		self.interpret_into(f, env, &mut tell)?;
		Ok(tell)
	}

	/// Recursive worker of [`Bab::interpret_tell`].
	fn interpret_into(
		&self,
		f: &Formula,
		env: &VarEnv,
		tell: &mut BabTell<A::Tell>,
	) -> Result<(), InterpretationError> {
		match f {
			Formula::Seq(Sig::And, children) => {
				for c in children {
					self.interpret_into(c, env, tell)?;
				}
				Ok(())
			}
			Formula::Seq(sig @ (Sig::Minimize | Sig::Maximize), children)
				if children.len() == 1 =>
			{
				let goal = if *sig == Sig::Minimize {
					Goal::Minimize
				} else {
					Goal::Maximize
				};
				match &children[0] {
					Formula::AVar(x) => {
						tell.objective = Some(Objective { var: *x, goal });
						Ok(())
					}
					Formula::LVar(name) => match env.get(name) {
						Some(var) => {
							tell.objective = Some(Objective { var, goal });
							Ok(())
						}
						None => Err(InterpretationError::new(
							Self::NAME,
							format!("undeclared variable `{name}'"),
							f,
						)),
					},
					arg if arg.num_vars() == 0 => {
						warn!(objective = %arg, "the objective is a constant; solving as a satisfaction problem");
						Ok(())
					}
					_ => Err(InterpretationError::new(
						Self::NAME,
						"optimization predicates expect a single variable to optimize; \
						 create a new variable constrained to the expression instead",
						f,
					)),
				}
			}
			_ => {
				tell.sub_tells
					.push(self.sub.borrow().interpret_tell(f, env)?);
				Ok(())
			}
		}
	}

	/// Narrow the subdomain and record the objective, if one was declared.
	///
	/// # Panics
	///
	/// Panics when an objective is told while another one is already set:
	/// multi-objective optimization is not supported.
	pub fn tell(&mut self, t: &BabTell<A::Tell>) -> bool {
		let mut has_changed = false;
		for sub_tell in &t.sub_tells {
			has_changed |= self.sub.borrow_mut().tell(sub_tell);
		}
		if let Some(obj) = t.objective {
			assert!(
				self.objective.is_none(),
				"multi-objective optimization is not supported"
			);
			self.objective = Some(obj);
			has_changed = true;
		}
		has_changed
	}

	/// The constraint making every solution not strictly better than `best`
	/// unreachable; `true` when the relevant bound of `best` is unbounded.
	fn bound_formula(&self, obj: Objective, bound: IntVal) -> Formula {
		match obj.goal {
			Goal::Minimize if bound == NEG_INF => Formula::truth(),
			Goal::Maximize if bound == POS_INF => Formula::truth(),
			Goal::Minimize => Formula::binary(Formula::avar(obj.var), Sig::Lt, Formula::z(bound)),
			Goal::Maximize => Formula::binary(Formula::avar(obj.var), Sig::Gt, Formula::z(bound)),
		}
	}

	/// One branch-and-bound step: when the subdomain is a solution candidate,
	/// record it in `best` and, when optimising, post the tightening bound.
	/// Returns whether a solution was recorded.
	pub fn refine(&mut self) -> bool {
		if !self.sub.borrow().is_extractable() {
			return false;
		}
		self.sub.borrow().extract(&mut self.best.borrow_mut());
		self.solutions_found += 1;
		if let Some(obj) = self.objective {
			let bound = {
				let best = self.best.borrow();
				match obj.goal {
					Goal::Minimize => best.project(obj.var).lb(),
					Goal::Maximize => best.project(obj.var).ub(),
				}
			};
			debug!(solution = self.solutions_found, bound, "record solution");
			let f = self.bound_formula(obj, bound);
			let t = self
				.sub
				.borrow()
				.interpret_tell(&f, &VarEnv::default())
				.expect("the subdomain must support posting objective bounds");
			let _ = self.sub.borrow_mut().tell(&t);
		} else {
			debug!(solution = self.solutions_found, "record solution");
		}
		true
	}

	/// Whether `s1` carries a strictly better objective bound than `s2`.
	///
	/// Minimization compares lower bounds (lower is better), maximization
	/// compares upper bounds (higher is better).
	///
	/// # Panics
	///
	/// Panics when no objective has been declared.
	pub fn compare_bound(&self, s1: &VStore, s2: &VStore) -> bool {
		let obj = self
			.objective
			.expect("comparing bounds requires an objective");
		match obj.goal {
			Goal::Minimize => s1.project(obj.var).lb() < s2.project(obj.var).lb(),
			Goal::Maximize => s1.project(obj.var).ub() > s2.project(obj.var).ub(),
		}
	}

	/// Whether an optimum is reached: at least one solution was recorded, the
	/// subdomain is completely explored, and `best` holds a readable
	/// solution.
	pub fn is_extractable(&self) -> bool {
		self.solutions_found > 0
			&& self.sub.borrow().is_top()
			&& self.best.borrow().is_extractable()
	}

	/// Copy the best recorded solution into `target`. Returns whether a
	/// solution was available, which requires the subdomain to be completely
	/// explored.
	pub fn extract(&self, target: &mut VStore) -> bool {
		if self.solutions_found > 0 && self.sub.borrow().is_top() {
			self.best.borrow().extract(target);
			true
		} else {
			false
		}
	}

	/// The best solution recorded so far.
	///
	/// Only an optimum when [`Bab::is_extractable`] holds.
	pub fn optimum(&self) -> Ref<'_, VStore> {
		self.best.borrow()
	}

	/// The number of solutions recorded so far.
	pub fn solutions_count(&self) -> usize {
		self.solutions_found
	}

	/// The declared objective, or `None` in satisfaction mode.
	pub fn objective(&self) -> Option<Objective> {
		self.objective
	}

	/// Whether the declared objective minimizes its variable.
	pub fn is_minimization(&self) -> bool {
		matches!(
			self.objective,
			Some(Objective {
				goal: Goal::Minimize,
				..
			})
		)
	}

	/// Whether the declared objective maximizes its variable.
	pub fn is_maximization(&self) -> bool {
		matches!(
			self.objective,
			Some(Objective {
				goal: Goal::Maximize,
				..
			})
		)
	}

	/// Whether neither an objective nor any information was told yet.
	pub fn is_bot(&self) -> bool {
		self.objective.is_none() && self.sub.borrow().is_bot()
	}

	/// Whether the subdomain is infeasible or completely explored.
	pub fn is_top(&self) -> bool {
		self.sub.borrow().is_top()
	}
}

#[cfg(test)]
mod tests {
	use std::{cell::RefCell, rc::Rc};

	use tracing_test::traced_test;

	use crate::{
		domain::{Domain, TellVar},
		fixpoint::GaussSeidel,
		interval::Interval,
		logic::{Formula, Sig},
		propagation::Propagation,
		search::{
			bab::{Bab, Goal},
			split::SplitStrategy,
			tree::SearchTree,
		},
		store::VStore,
		tests::{assignment, bounds_atoms, store_with_env},
		AVar,
	};

	/// The formulas of the three-variable model `a, b, c in [0, 2]` with an
	/// input-order/min search and the given solve predicate.
	fn model_formulas(names: &[&str], solve: Formula, constrained: bool) -> Vec<Formula> {
		let mut formulas = bounds_atoms(names, 0, 2);
		if constrained {
			formulas.push(Formula::binary(
				Formula::Seq(Sig::Add, vec![Formula::lvar("a"), Formula::lvar("b")]),
				Sig::Eq,
				Formula::lvar("c"),
			));
		}
		formulas.push(Formula::search(
			"input_order",
			"indomain_min",
			names.iter().map(|n| Formula::lvar(n)),
		));
		formulas.push(solve);
		formulas
	}

	#[test]
	fn test_unconstrained_minimization() {
		let names = ["a", "b", "c"];
		let (store, env) = store_with_env(0, &names);
		let split = Rc::new(RefCell::new(SplitStrategy::new(1, 0, Rc::clone(&store))));
		let st = Rc::new(RefCell::new(SearchTree::new(2, Rc::clone(&store), split)));
		let best = Rc::new(RefCell::new(VStore::new(0, 3)));
		let mut bab = Bab::new(3, Rc::clone(&st), Rc::clone(&best));

		assert!(bab.is_bot());
		assert!(!bab.is_top());

		for f in model_formulas(&names, Formula::minimize(Formula::lvar("c")), false) {
			let t = bab.interpret_tell(&f, &env).unwrap();
			let _ = bab.tell(&t);
		}
		assert!(!bab.is_bot());
		assert!(bab.is_minimization());

		let mut iterations = 0;
		let mut has_changed = true;
		while !bab.is_extractable() && has_changed {
			iterations += 1;
			has_changed = false;
			if st.borrow().is_extractable() {
				has_changed |= bab.refine();
			}
			has_changed |= st.borrow_mut().refine();
		}

		// Without constraints the root node is already the optimum.
		assert_eq!(iterations, 1);
		for i in 0..3 {
			assert_eq!(best.borrow().project(AVar::new(0, i)), Interval::new(0, 2));
		}
		assert!(st.borrow().is_top());
		assert!(!st.borrow_mut().refine());
	}

	/// Run branch and bound on the constrained model `a + b = c`. Returns the
	/// number of driver iterations to reach the optimum.
	fn constrained_bab(solve: Formula, expected_best: &str) -> usize {
		let names = ["a", "b", "c"];
		let (store, env) = store_with_env(0, &names);
		let prop = Rc::new(RefCell::new(Propagation::new(1, Rc::clone(&store))));
		let split = Rc::new(RefCell::new(SplitStrategy::new(2, 0, Rc::clone(&prop))));
		let st = Rc::new(RefCell::new(SearchTree::new(3, Rc::clone(&prop), split)));
		let best = Rc::new(RefCell::new(VStore::new(0, 3)));
		let mut bab = Bab::new(4, Rc::clone(&st), Rc::clone(&best));

		for f in model_formulas(&names, solve, true) {
			let t = bab.interpret_tell(&f, &env).unwrap();
			let _ = bab.tell(&t);
		}

		let mut iterations = 0;
		let mut has_changed = true;
		while !bab.is_extractable() && has_changed {
			iterations += 1;
			has_changed = false;
			has_changed |= GaussSeidel.fixpoint(&mut *prop.borrow_mut());
			if st.borrow().is_extractable() {
				has_changed |= bab.refine();
			}
			has_changed |= st.borrow_mut().refine();
		}

		assert!(bab.is_extractable());
		assert!(bab.is_top());
		assert_eq!(assignment(&bab.optimum()), expected_best);

		let mut sol = VStore::new(0, 3);
		assert!(bab.extract(&mut sol));
		assert_eq!(assignment(&sol), expected_best);
		iterations
	}

	#[test]
	fn test_constrained_minimization() {
		let iterations = constrained_bab(Formula::minimize(Formula::lvar("c")), "0, 0, 0");
		assert_eq!(iterations, 5);
	}

	#[test]
	fn test_constrained_maximization() {
		let iterations = constrained_bab(Formula::maximize(Formula::lvar("c")), "0, 2, 2");
		assert_eq!(iterations, 7);
	}

	#[test]
	#[traced_test]
	fn test_satisfaction_mode_records_latest_solution() {
		let (store, env) = store_with_env(0, &["a"]);
		let split = Rc::new(RefCell::new(SplitStrategy::new(1, 0, Rc::clone(&store))));
		let st = Rc::new(RefCell::new(SearchTree::new(2, Rc::clone(&store), split)));
		let best = Rc::new(RefCell::new(VStore::new(0, 1)));
		let mut bab = Bab::new(3, Rc::clone(&st), Rc::clone(&best));

		// A constant objective downgrades to satisfaction with a warning.
		let mut formulas = bounds_atoms(&["a"], 0, 1);
		formulas.push(Formula::search("input_order", "indomain_min", [Formula::lvar("a")]));
		formulas.push(Formula::minimize(Formula::z(5)));
		for f in formulas {
			let t = bab.interpret_tell(&f, &env).unwrap();
			let _ = bab.tell(&t);
		}
		assert_eq!(bab.objective(), None);
		assert!(logs_contain("objective is a constant"));

		let _ = st.borrow_mut().refine();
		assert!(bab.refine());
		assert_eq!(bab.solutions_count(), 1);
		assert_eq!(assignment(&bab.optimum()), "0");
		// No bound was posted: the search continues to the next solution.
		assert!(st.borrow_mut().refine());
		assert!(bab.refine());
		assert_eq!(bab.solutions_count(), 2);
		assert_eq!(assignment(&bab.optimum()), "1");
	}

	#[test]
	#[should_panic(expected = "multi-objective")]
	fn test_multi_objective_is_rejected() {
		let (store, env) = store_with_env(0, &["a", "b"]);
		let split = Rc::new(RefCell::new(SplitStrategy::new(1, 0, Rc::clone(&store))));
		let st = Rc::new(RefCell::new(SearchTree::new(2, Rc::clone(&store), split)));
		let best = Rc::new(RefCell::new(VStore::new(0, 2)));
		let mut bab = Bab::new(3, st, best);

		let t = bab
			.interpret_tell(&Formula::minimize(Formula::lvar("a")), &env)
			.unwrap();
		let _ = bab.tell(&t);
		let t = bab
			.interpret_tell(&Formula::maximize(Formula::lvar("b")), &env)
			.unwrap();
		let _ = bab.tell(&t);
	}

	#[test]
	fn test_objective_expression_is_rejected() {
		let (store, env) = store_with_env(0, &["a"]);
		let split = Rc::new(RefCell::new(SplitStrategy::new(1, 0, Rc::clone(&store))));
		let st = Rc::new(RefCell::new(SearchTree::new(2, Rc::clone(&store), split)));
		let best = Rc::new(RefCell::new(VStore::new(0, 1)));
		let bab = Bab::new(3, st, best);

		let f = Formula::minimize(Formula::binary(
			Formula::lvar("a"),
			Sig::Add,
			Formula::z(1),
		));
		assert!(bab.interpret_tell(&f, &env).is_err());
	}

	#[test]
	fn test_compare_bound() {
		let (store, env) = store_with_env(0, &["a"]);
		let split = Rc::new(RefCell::new(SplitStrategy::new(1, 0, Rc::clone(&store))));
		let st = Rc::new(RefCell::new(SearchTree::new(2, Rc::clone(&store), split)));
		let best = Rc::new(RefCell::new(VStore::new(0, 1)));
		let mut bab = Bab::new(3, st, best);
		let t = bab
			.interpret_tell(&Formula::minimize(Formula::lvar("a")), &env)
			.unwrap();
		let _ = bab.tell(&t);
		assert_eq!(bab.objective().unwrap().goal, Goal::Minimize);

		let x = AVar::new(0, 0);
		let mut s1 = VStore::new(0, 1);
		let mut s2 = VStore::new(0, 1);
		let _ = s1.tell_var(x, Interval::singleton(1));
		let _ = s2.tell_var(x, Interval::singleton(3));
		assert!(bab.compare_bound(&s1, &s2));
		assert!(!bab.compare_bound(&s2, &s1));
	}
}
