//! Splitting strategies: selecting the next unassigned variable and the value
//! split producing the branches explored by the search tree.

use std::{cell::RefCell, rc::Rc};

use tracing::warn;

use crate::{
	domain::Domain,
	interval::{Interval, NEG_INF, POS_INF},
	logic::{Formula, InterpretationError, Sig, VarEnv},
	search::branch::Branch,
	AType, AVar, IntVal,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Strategy of selecting the next decision variable from a list to make a
/// search decision.
pub enum VariableOrder {
	/// Select the unfixed decision variable with the widest remaining domain,
	/// using the order of the variables in case of a tie.
	AntiFirstFail,
	/// Select the unfixed decision variable with the narrowest remaining
	/// domain, using the order of the variables in case of a tie.
	FirstFail,
	/// Select the first unfixed decision variable in the list.
	InputOrder,
	/// Select the unfixed decision variable with the largest upper bound,
	/// using the order of the variables in case of a tie.
	Largest,
	/// Select the unfixed decision variable with the smallest lower bound,
	/// using the order of the variables in case of a tie.
	Smallest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Strategy of splitting the domain of the selected decision variable into
/// the children of a branch.
pub enum ValueOrder {
	/// Try the upper bound value, otherwise exclude it.
	Max,
	/// Try the median value, otherwise exclude it.
	Median,
	/// Try the lower bound value, otherwise exclude it.
	Min,
	/// Try the half above the median first, then the half below.
	ReverseSplit,
	/// Try the half below the median first, then the half above.
	Split,
}

impl VariableOrder {
	/// The variable order named `name` in the `search` predicate, if any.
	pub fn from_name(name: &str) -> Option<Self> {
		match name {
			"anti_first_fail" => Some(VariableOrder::AntiFirstFail),
			"first_fail" => Some(VariableOrder::FirstFail),
			"input_order" => Some(VariableOrder::InputOrder),
			"largest" => Some(VariableOrder::Largest),
			"smallest" => Some(VariableOrder::Smallest),
			_ => None,
		}
	}
}

impl ValueOrder {
	/// The value order named `name` in the `search` predicate, if any.
	pub fn from_name(name: &str) -> Option<Self> {
		match name {
			"indomain_max" => Some(ValueOrder::Max),
			"indomain_median" => Some(ValueOrder::Median),
			"indomain_min" => Some(ValueOrder::Min),
			"indomain_reverse_split" => Some(ValueOrder::ReverseSplit),
			"indomain_split" => Some(ValueOrder::Split),
			_ => None,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A splitting strategy: a variable order and a value order over a subset of
/// the variables.
pub struct Strategy {
	/// Order in which the next decision variable is selected.
	pub var_order: VariableOrder,
	/// Order in which the values of the selected variable are tried.
	pub val_order: ValueOrder,
	/// Variables the strategy branches over; an empty list means every
	/// variable of the subdomain.
	pub vars: Vec<AVar>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Snapshot of a [`SplitStrategy`].
pub struct SplitSnapshot {
	/// Number of registered strategies at capture time.
	num_strategies: usize,
	/// Strategy the cursor was positioned on.
	current_strategy: usize,
	/// Variable position within the current strategy.
	next_var: usize,
}

/// Queue of splitting strategies over a shared subdomain, producing the
/// two-child branches explored by the search tree.
///
/// Strategies are consumed in order along any branch of the search tree: a
/// strategy is used until all its variables are assigned, after which the
/// next one takes over.
pub struct SplitStrategy<A: Domain> {
	/// The abstract type identifying this component.
	aty: AType,
	/// The abstract type under which plain store variables are addressed when
	/// a strategy has an empty variable list.
	var_aty: AType,
	/// The subdomain whose variables are split.
	a: Rc<RefCell<A>>,
	/// The registered strategies, in posting order.
	strategies: Vec<Strategy>,
	/// Index of the strategy currently in use.
	current_strategy: usize,
	/// Position of the next candidate variable within the current strategy.
	next_var: usize,
}

impl<A: Domain> SplitStrategy<A> {
	/// Name of the component in diagnostics.
	const NAME: &'static str = "SplitStrategy";

	/// Create a splitting component over the subdomain `a`, identified by the
	/// abstract type `aty`. Strategies with an empty variable list split
	/// every variable of the store identified by `var_aty`.
	pub fn new(aty: AType, var_aty: AType, a: Rc<RefCell<A>>) -> Self {
		Self {
			aty,
			var_aty,
			a,
			strategies: Vec::new(),
			current_strategy: 0,
			next_var: 0,
		}
	}

	/// The abstract type identifying this component.
	pub fn aty(&self) -> AType {
		self.aty
	}

	/// The number of registered strategies.
	pub fn num_strategies(&self) -> usize {
		self.strategies.len()
	}

	/// Interpret a `search(<var-order>, <val-order>, v1, ..., vn)` predicate
	/// as a strategy to append to the queue.
	pub fn interpret_tell(
		&self,
		f: &Formula,
		env: &VarEnv,
	) -> Result<Vec<Strategy>, InterpretationError> {
		let ident_of = |f: &Formula| match f {
			Formula::ESeq(name, children) if children.is_empty() => Some(name.clone()),
			_ => None,
		};
		let args = match f {
			Formula::ESeq(name, args) if name == "search" && args.len() >= 2 => args,
			_ => {
				return Err(InterpretationError::new(
					Self::NAME,
					"only predicates of the form `search(<var-order>, <val-order>, x1, ..., xN)` are supported",
					f,
				));
			}
		};
		let var_order = ident_of(&args[0])
			.and_then(|name| VariableOrder::from_name(&name))
			.ok_or_else(|| {
				InterpretationError::new(Self::NAME, "unsupported variable order strategy", f)
			})?;
		let val_order = ident_of(&args[1])
			.and_then(|name| ValueOrder::from_name(&name))
			.ok_or_else(|| {
				InterpretationError::new(Self::NAME, "unsupported value order strategy", f)
			})?;
		let val_order = if val_order == ValueOrder::Median {
			warn!("indomain_median is not supported on interval domains; using indomain_split instead");
			ValueOrder::Split
		} else {
			val_order
		};
		let mut vars = Vec::new();
		for arg in &args[2..] {
			match arg {
				Formula::LVar(name) => match env.get(name) {
					Some(x) => vars.push(x),
					None => {
						return Err(InterpretationError::new(
							Self::NAME,
							format!("undeclared variable `{name}'"),
							f,
						));
					}
				},
				Formula::AVar(x) => vars.push(*x),
				_ if arg.num_vars() > 0 => {
					return Err(InterpretationError::new(
						Self::NAME,
						"the `search` predicate only supports variables or constants",
						f,
					));
				}
				// Constant expressions are ignored.
				_ => {}
			}
		}
		Ok(vec![Strategy {
			var_order,
			val_order,
			vars,
		}])
	}

	/// Append strategies to the queue. Returns whether any strategy was
	/// added.
	pub fn tell(&mut self, t: &[Strategy]) -> bool {
		self.strategies.extend(t.iter().cloned());
		!t.is_empty()
	}

	/// Capture the strategy queue length and the cursor position.
	pub fn snapshot(&self) -> SplitSnapshot {
		SplitSnapshot {
			num_strategies: self.strategies.len(),
			current_strategy: self.current_strategy,
			next_var: self.next_var,
		}
	}

	/// Restore the state captured in `snap`, dropping strategies added since.
	pub fn restore(&mut self, snap: &SplitSnapshot) {
		self.strategies.truncate(snap.num_strategies);
		self.current_strategy = snap.current_strategy;
		self.next_var = snap.next_var;
	}

	/// Restart the variable selection from the first strategy.
	pub fn reset(&mut self) {
		self.current_strategy = 0;
		self.next_var = 0;
	}

	/// The variable at position `i` of the current strategy.
	fn var_at(&self, i: usize) -> AVar {
		let vars = &self.strategies[self.current_strategy].vars;
		if vars.is_empty() {
			AVar::new(self.var_aty, i)
		} else {
			vars[i]
		}
	}

	/// The number of variables covered by the current strategy.
	fn strategy_len(&self) -> usize {
		let vars = &self.strategies[self.current_strategy].vars;
		if vars.is_empty() {
			self.a.borrow().vars()
		} else {
			vars.len()
		}
	}

	/// Advance the cursor past every assigned variable, moving to the next
	/// strategy whenever the current one is exhausted.
	fn move_to_next_unassigned(&mut self) {
		while self.current_strategy < self.strategies.len() {
			let n = self.strategy_len();
			while self.next_var < n {
				let u = self.a.borrow().project(self.var_at(self.next_var));
				if !u.is_singleton() {
					return;
				}
				self.next_var += 1;
			}
			self.current_strategy += 1;
			self.next_var = 0;
		}
	}

	/// Select the next decision variable according to the variable order of
	/// the current strategy. The cursor must already be positioned on an
	/// unassigned variable.
	fn select_var(&self) -> AVar {
		let strat = &self.strategies[self.current_strategy];
		if strat.var_order == VariableOrder::InputOrder {
			return self.var_at(self.next_var);
		}

		let score = |u: &Interval| match strat.var_order {
			VariableOrder::AntiFirstFail | VariableOrder::FirstFail => u.width(),
			VariableOrder::Largest => u.ub(),
			VariableOrder::Smallest => u.lb(),
			VariableOrder::InputOrder => unreachable!(),
		};
		let is_better = |incumbent: IntVal, candidate: IntVal| match strat.var_order {
			VariableOrder::AntiFirstFail | VariableOrder::Largest => candidate > incumbent,
			VariableOrder::FirstFail | VariableOrder::Smallest => candidate < incumbent,
			VariableOrder::InputOrder => unreachable!(),
		};

		let a = self.a.borrow();
		let mut best_i = self.next_var;
		let mut best = score(&a.project(self.var_at(best_i)));
		for i in (self.next_var + 1)..self.strategy_len() {
			let u = a.project(self.var_at(i));
			if u.is_singleton() {
				continue;
			}
			let candidate = score(&u);
			if is_better(best, candidate) {
				best = candidate;
				best_i = i;
			}
		}
		self.var_at(best_i)
	}

	/// Split the next unassigned variable according to the current strategy.
	///
	/// Returns an empty branch when the subdomain is infeasible, when no
	/// strategy remains, or when the selected variable cannot be split (for
	/// instance because its domain is unbounded). An empty branch therefore
	/// does not imply that the subdomain is at *top*.
	///
	/// Without any change to the subdomain in between, two consecutive calls
	/// produce equal branches.
	pub fn split(&mut self) -> Branch<A::Tell> {
		if self.a.borrow().is_top() {
			return Branch::empty();
		}
		self.move_to_next_unassigned();
		if self.current_strategy >= self.strategies.len() {
			return Branch::empty();
		}
		let x = self.select_var();
		let u = self.a.borrow().project(x);
		if u.is_top() {
			return Branch::empty();
		}
		let val_order = self.strategies[self.current_strategy].val_order;
		let pivot = match val_order {
			ValueOrder::Min => (u.lb() != NEG_INF).then(|| u.lb()),
			ValueOrder::Max => (u.ub() != POS_INF).then(|| u.ub()),
			ValueOrder::Median | ValueOrder::ReverseSplit | ValueOrder::Split => {
				(u.lb() != NEG_INF && u.ub() != POS_INF).then(|| u.median())
			}
		};
		let Some(k) = pivot else {
			warn!(var = %x, domain = %u, "cannot branch on a variable with an unbounded domain");
			return Branch::empty();
		};
		let (left_op, right_op) = match val_order {
			ValueOrder::Min => (Sig::Eq, Sig::Gt),
			ValueOrder::Max => (Sig::Eq, Sig::Lt),
			ValueOrder::Median => (Sig::Eq, Sig::Neq),
			ValueOrder::Split => (Sig::Leq, Sig::Gt),
			ValueOrder::ReverseSplit => (Sig::Gt, Sig::Leq),
		};
		self.make_branch(x, left_op, right_op, k)
	}

	/// Build the two-child branch `{x <left-op> k, x <right-op> k}` by
	/// interpreting both formulas in the subdomain. When either
	/// interpretation fails, retry with the canonical `<=`/`>` domain split
	/// before giving up with an empty branch.
	fn make_branch(
		&self,
		x: AVar,
		mut left_op: Sig,
		mut right_op: Sig,
		k: IntVal,
	) -> Branch<A::Tell> {
		let env = VarEnv::default();
		loop {
			let left = Formula::binary(Formula::avar(x), left_op, Formula::z(k));
			let right = Formula::binary(Formula::avar(x), right_op, Formula::z(k));
			let a = self.a.borrow();
			match (a.interpret_tell(&left, &env), a.interpret_tell(&right, &env)) {
				(Ok(l), Ok(r)) => return Branch::new(vec![l, r]),
				_ if (left_op, right_op) != (Sig::Leq, Sig::Gt) => {
					(left_op, right_op) = (Sig::Leq, Sig::Gt);
				}
				(l, r) => {
					let err = l.err().or_else(|| r.err()).unwrap();
					warn!(%err, "the subdomain does not support the underlying search strategy");
					return Branch::empty();
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{cell::RefCell, rc::Rc};

	use tracing_test::traced_test;

	use crate::{
		domain::{Domain, TellVar},
		interval::Interval,
		logic::{Formula, Sig, VarEnv},
		search::split::{SplitStrategy, Strategy, ValueOrder, VariableOrder},
		store::VStore,
		AVar,
	};

	fn fresh(
		vars: usize,
		dom: Interval,
	) -> (Rc<RefCell<VStore>>, SplitStrategy<VStore>, VarEnv) {
		let store = Rc::new(RefCell::new(VStore::new(0, vars)));
		let mut env = VarEnv::default();
		for i in 0..vars {
			let x = AVar::new(0, i);
			let _ = store.borrow_mut().tell_var(x, dom);
			env.bind(&format!("x{}", i + 1), x);
		}
		let split = SplitStrategy::new(1, 0, Rc::clone(&store));
		(store, split, env)
	}

	fn search_all(var_order: &str, val_order: &str) -> Formula {
		Formula::search(var_order, val_order, [])
	}

	#[test]
	fn test_interpret_search() {
		let (_, mut split, env) = fresh(3, Interval::new(0, 9));
		let f = Formula::search(
			"first_fail",
			"indomain_max",
			[Formula::lvar("x1"), Formula::lvar("x3"), Formula::z(5)],
		);
		let t = split.interpret_tell(&f, &env).unwrap();
		assert_eq!(
			t,
			vec![Strategy {
				var_order: VariableOrder::FirstFail,
				val_order: ValueOrder::Max,
				vars: vec![AVar::new(0, 0), AVar::new(0, 2)],
			}]
		);
		assert!(split.tell(&t));
		assert_eq!(split.num_strategies(), 1);

		assert!(split
			.interpret_tell(&search_all("by_magic", "indomain_min"), &env)
			.is_err());
		assert!(split
			.interpret_tell(&search_all("input_order", "outdomain_banana"), &env)
			.is_err());
		let with_expr = Formula::search(
			"input_order",
			"indomain_min",
			[Formula::binary(Formula::lvar("x1"), Sig::Add, Formula::z(1))],
		);
		assert!(split.interpret_tell(&with_expr, &env).is_err());
	}

	#[test]
	#[traced_test]
	fn test_median_degrades_to_split() {
		let (_, split, env) = fresh(1, Interval::new(0, 9));
		let t = split
			.interpret_tell(&search_all("input_order", "indomain_median"), &env)
			.unwrap();
		assert_eq!(t[0].val_order, ValueOrder::Split);
		assert!(logs_contain("indomain_median is not supported"));
	}

	#[test]
	fn test_strategies_consumed_in_order() {
		let (store, mut split, env) = fresh(2, Interval::new(0, 3));
		let first = Formula::search("input_order", "indomain_min", [Formula::lvar("x1")]);
		let second = Formula::search("input_order", "indomain_max", [Formula::lvar("x2")]);
		for f in [first, second] {
			let t = split.interpret_tell(&f, &env).unwrap();
			let _ = split.tell(&t);
		}
		assert_eq!(split.num_strategies(), 2);

		// The first strategy drives the split while x1 is unassigned.
		let mut branch = split.split();
		let _ = store.borrow_mut().tell(branch.next());
		assert_eq!(store.borrow().project(AVar::new(0, 0)), Interval::singleton(0));

		// Once x1 is assigned the second strategy takes over, assigning the
		// upper bound of x2.
		let mut branch = split.split();
		let _ = store.borrow_mut().tell(branch.next());
		assert_eq!(store.borrow().project(AVar::new(0, 1)), Interval::singleton(3));
	}

	#[test]
	fn test_empty_strategy_queue() {
		let (_, mut split, _) = fresh(2, Interval::new(0, 9));
		assert_eq!(split.split().size(), 0);
	}

	#[test]
	fn test_split_determinism() {
		let (store, mut split, env) = fresh(3, Interval::new(0, 9));
		let t = split
			.interpret_tell(&search_all("input_order", "indomain_min"), &env)
			.unwrap();
		let _ = split.tell(&t);
		let first = split.split();
		let second = split.split();
		assert_eq!(first, second);
		assert_eq!(first.size(), 2);

		// The branch splits the first variable on its lower bound.
		let mut branch = first;
		let _ = store.borrow_mut().tell(branch.next());
		assert_eq!(store.borrow().project(AVar::new(0, 0)), Interval::singleton(0));
	}

	#[test]
	fn test_split_skips_assigned() {
		let (store, mut split, env) = fresh(3, Interval::new(0, 9));
		let t = split
			.interpret_tell(&search_all("input_order", "indomain_min"), &env)
			.unwrap();
		let _ = split.tell(&t);
		let _ = store
			.borrow_mut()
			.tell_var(AVar::new(0, 0), Interval::singleton(4));
		let mut branch = split.split();
		let _ = store.borrow_mut().tell(branch.next());
		assert_eq!(store.borrow().project(AVar::new(0, 1)), Interval::singleton(0));
	}

	#[test]
	fn test_first_fail_and_smallest() {
		let (store, mut split, env) = fresh(3, Interval::new(0, 9));
		{
			let mut store = store.borrow_mut();
			let _ = store.tell_var(AVar::new(0, 1), Interval::new(2, 5));
			let _ = store.tell_var(AVar::new(0, 2), Interval::new(-3, 9));
		}
		let t = split
			.interpret_tell(&search_all("first_fail", "indomain_min"), &env)
			.unwrap();
		let _ = split.tell(&t);
		// x2 has the narrowest domain.
		let mut branch = split.split();
		let _ = store.borrow_mut().tell(branch.next());
		assert_eq!(store.borrow().project(AVar::new(0, 1)), Interval::singleton(2));

		let mut smallest = SplitStrategy::new(1, 0, Rc::clone(&store));
		let t = smallest
			.interpret_tell(&search_all("smallest", "indomain_max"), &env)
			.unwrap();
		let _ = smallest.tell(&t);
		// x3 has the smallest lower bound; indomain_max assigns its upper bound.
		let mut branch = smallest.split();
		let _ = store.borrow_mut().tell(branch.next());
		assert_eq!(store.borrow().project(AVar::new(0, 2)), Interval::singleton(9));
	}

	#[test]
	fn test_split_exhaustiveness() {
		let (store, mut split, env) = fresh(2, Interval::new(0, 1));
		let t = split
			.interpret_tell(&search_all("input_order", "indomain_min"), &env)
			.unwrap();
		let _ = split.tell(&t);
		{
			let mut store = store.borrow_mut();
			let _ = store.tell_var(AVar::new(0, 0), Interval::singleton(0));
			let _ = store.tell_var(AVar::new(0, 1), Interval::singleton(1));
		}
		assert_eq!(split.split().size(), 0);
	}

	#[test]
	fn test_unbounded_domain_is_not_split() {
		let (_, mut split, env) = fresh(1, Interval::bot());
		let t = split
			.interpret_tell(&search_all("input_order", "indomain_min"), &env)
			.unwrap();
		let _ = split.tell(&t);
		assert_eq!(split.split().size(), 0);
	}

	#[test]
	fn test_snapshot_restore() {
		let (_, mut split, env) = fresh(2, Interval::new(0, 3));
		let t = split
			.interpret_tell(&search_all("input_order", "indomain_min"), &env)
			.unwrap();
		let _ = split.tell(&t);
		let snap = split.snapshot();
		let t = split
			.interpret_tell(&search_all("largest", "indomain_max"), &env)
			.unwrap();
		let _ = split.tell(&t);
		assert_eq!(split.num_strategies(), 2);
		split.restore(&snap);
		assert_eq!(split.num_strategies(), 1);
	}
}
