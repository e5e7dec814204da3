//! Propagator completion over the variable store: interprets arithmetic
//! constraints into bounds-consistent linear propagators, while unary
//! interval-representable atoms are forwarded to the store directly.

use std::{cell::RefCell, rc::Rc};

use delegate::delegate;

use crate::{
	domain::{Deinterpret, Domain, Refinable, TellVar},
	interval::{Interval, NEG_INF, POS_INF},
	logic::{Formula, InterpretationError, Sig, VarEnv},
	store::{StoreAsk, StoreTell, VStore},
	AType, AVar, IntVal,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Relational operator of a [`Linear`] constraint.
pub enum LinOperator {
	/// The sum is equal to the constant.
	Eq,
	/// The sum is less than or equal to the constant.
	LessEq,
	/// The sum is different from the constant.
	NotEq,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A linear constraint `Σ coeffs[i] · vars[i] <op> k` propagated to bounds
/// consistency.
pub struct Linear {
	/// Coefficient of each variable of the sum.
	coeffs: Vec<IntVal>,
	/// Variables of the sum.
	vars: Vec<AVar>,
	/// Relational operator between the sum and `k`.
	op: LinOperator,
	/// Right-hand side constant.
	k: IntVal,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Tell delta of a [`Propagation`] domain: direct variable narrowings plus
/// new propagators.
pub struct PropagationTell {
	/// Narrowings forwarded to the store.
	store: StoreTell,
	/// Propagators to register.
	props: Vec<Linear>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Ask delta of a [`Propagation`] domain: store entailment checks plus linear
/// constraints that must be entailed.
pub struct PropagationAsk {
	/// Entailment checks forwarded to the store.
	store: StoreAsk,
	/// Linear constraints that must be entailed.
	props: Vec<Linear>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Snapshot of a [`Propagation`] domain.
pub struct PropagationSnapshot {
	/// Snapshot of the underlying store.
	sub: <VStore as Domain>::Snapshot,
	/// Number of registered propagators at capture time.
	num_props: usize,
}

#[derive(Clone, Debug)]
/// Abstract domain refining the store with linear propagators.
pub struct Propagation {
	/// The abstract type identifying this domain.
	aty: AType,
	/// The store narrowed by the propagators.
	sub: Rc<RefCell<VStore>>,
	/// The registered propagators.
	props: Vec<Linear>,
}

/// Floor division used when dividing a slack by a positive coefficient, and
/// ceiling division when the coefficient is negative; `div_euclid` provides
/// exactly this rounding for either sign of the divisor.
fn div_bound(slack: IntVal, coeff: IntVal) -> IntVal {
	slack.div_euclid(coeff)
}

impl Linear {
	/// Create the linear constraint `Σ coeffs[i] · vars[i] <op> k`.
	pub fn new(coeffs: Vec<IntVal>, vars: Vec<AVar>, op: LinOperator, k: IntVal) -> Self {
		debug_assert_eq!(coeffs.len(), vars.len());
		debug_assert!(coeffs.iter().all(|&c| c != 0));
		Self {
			coeffs,
			vars,
			op,
			k,
		}
	}

	/// The minimal value `coeff · x` can take, or `None` when unbounded
	/// below or not representable.
	fn min_contrib(coeff: IntVal, u: Interval) -> Option<IntVal> {
		let bound = if coeff > 0 { u.lb() } else { u.ub() };
		if bound == NEG_INF || bound == POS_INF {
			None
		} else {
			coeff.checked_mul(bound)
		}
	}

	/// The maximal value `coeff · x` can take, or `None` when unbounded
	/// above or not representable.
	fn max_contrib(coeff: IntVal, u: Interval) -> Option<IntVal> {
		Self::min_contrib(-coeff, u).map(|v| -v)
	}

	/// Sum of an iterator of optional contributions; `None` as soon as any
	/// term is unbounded or the sum overflows.
	fn sum(contribs: impl Iterator<Item = Option<IntVal>>) -> Option<IntVal> {
		contribs.fold(Some(0), |acc, c| acc?.checked_add(c?))
	}

	/// Propagation rule of `Σ coeffs[i] · vars[i] ≤ k` with the given sign
	/// applied to both sides: every variable is bounded by the slack left by
	/// the minimal contributions of the others.
	fn propagate_leq(&self, sign: IntVal, k: IntVal, store: &mut VStore) -> bool {
		let doms: Vec<Interval> = self.vars.iter().map(|&x| store.project(x)).collect();
		let mins: Vec<Option<IntVal>> = self
			.coeffs
			.iter()
			.zip(&doms)
			.map(|(&c, &u)| Self::min_contrib(sign * c, u))
			.collect();
		let mut has_changed = false;
		for j in 0..self.vars.len() {
			let rest = Self::sum(
				mins.iter()
					.enumerate()
					.filter(|&(i, _)| i != j)
					.map(|(_, &m)| m),
			);
			let Some(rest) = rest else { continue };
			let Some(slack) = k.checked_sub(rest) else {
				continue;
			};
			let coeff = sign * self.coeffs[j];
			let bound = div_bound(slack, coeff);
			let narrowed = if coeff > 0 {
				Interval::new(NEG_INF, bound)
			} else {
				Interval::new(bound, POS_INF)
			};
			has_changed |= store.tell_var(self.vars[j], narrowed);
		}
		has_changed
	}

	/// Propagation rule of `Σ coeffs[i] · vars[i] ≠ k`: once a single
	/// variable remains unfixed, the forbidden value is trimmed when it sits
	/// on one of its bounds.
	fn propagate_neq(&self, store: &mut VStore) -> bool {
		let doms: Vec<Interval> = self.vars.iter().map(|&x| store.project(x)).collect();
		let mut unfixed = None;
		for (i, u) in doms.iter().enumerate() {
			if !u.is_singleton() {
				if unfixed.is_some() {
					return false;
				}
				unfixed = Some(i);
			}
		}
		let fixed_sum = Self::sum(
			doms.iter()
				.enumerate()
				.filter(|&(i, _)| Some(i) != unfixed)
				.map(|(i, u)| self.coeffs[i].checked_mul(u.lb())),
		);
		let Some(fixed_sum) = fixed_sum else {
			return false;
		};
		let Some(j) = unfixed else {
			// Every variable is fixed; the constraint fails when the sum hits `k`.
			if fixed_sum == self.k {
				return store.tell_var(self.vars[0], Interval::top());
			}
			return false;
		};
		let Some(residual) = self.k.checked_sub(fixed_sum) else {
			return false;
		};
		if residual % self.coeffs[j] != 0 {
			return false;
		}
		let forbidden = residual / self.coeffs[j];
		let u = doms[j];
		if u.lb() == forbidden {
			store.tell_var(self.vars[j], Interval::new(forbidden.saturating_add(1), POS_INF))
		} else if u.ub() == forbidden {
			store.tell_var(self.vars[j], Interval::new(NEG_INF, forbidden.saturating_sub(1)))
		} else {
			false
		}
	}

	/// Narrow the store with the consequences of this constraint. Returns
	/// whether the store changed.
	pub fn propagate(&self, store: &mut VStore) -> bool {
		if store.is_top() || self.vars.iter().any(|&x| store.project(x).is_top()) {
			return false;
		}
		match self.op {
			LinOperator::LessEq => self.propagate_leq(1, self.k, store),
			LinOperator::Eq => {
				let mut has_changed = self.propagate_leq(1, self.k, store);
				if let Some(neg_k) = self.k.checked_neg() {
					has_changed |= self.propagate_leq(-1, neg_k, store);
				}
				has_changed
			}
			LinOperator::NotEq => self.propagate_neq(store),
		}
	}

	/// Whether this constraint holds for every assignment within the current
	/// domains of its variables.
	pub fn entailed(&self, store: &VStore) -> bool {
		let doms: Vec<Interval> = self.vars.iter().map(|&x| store.project(x)).collect();
		let sum_min = Self::sum(
			self.coeffs
				.iter()
				.zip(&doms)
				.map(|(&c, &u)| Self::min_contrib(c, u)),
		);
		let sum_max = Self::sum(
			self.coeffs
				.iter()
				.zip(&doms)
				.map(|(&c, &u)| Self::max_contrib(c, u)),
		);
		match self.op {
			LinOperator::LessEq => sum_max.is_some_and(|s| s <= self.k),
			LinOperator::Eq => {
				sum_min.is_some_and(|s| s == self.k) && sum_max.is_some_and(|s| s == self.k)
			}
			LinOperator::NotEq => {
				sum_max.is_some_and(|s| s < self.k) || sum_min.is_some_and(|s| s > self.k)
			}
		}
	}

	/// Reconstruct a formula describing this constraint, moving the
	/// negatively-signed terms to the right-hand side.
	fn deinterpret(&self) -> Formula {
		let mut lhs = Vec::new();
		let mut rhs = Vec::new();
		for (&c, &x) in self.coeffs.iter().zip(&self.vars) {
			let side = if c > 0 { &mut lhs } else { &mut rhs };
			for _ in 0..c.unsigned_abs() {
				side.push(Formula::avar(x));
			}
		}
		rhs.push(Formula::z(self.k));
		let sig = match self.op {
			LinOperator::Eq => Sig::Eq,
			LinOperator::LessEq => Sig::Leq,
			LinOperator::NotEq => Sig::Neq,
		};
		let side = |mut terms: Vec<Formula>| {
			if terms.len() == 1 {
				terms.pop().unwrap()
			} else {
				Formula::Seq(Sig::Add, terms)
			}
		};
		Formula::binary(side(lhs), sig, side(rhs))
	}
}

impl Propagation {
	/// Name of the component in diagnostics.
	const NAME: &'static str = "Propagation";

	/// Create a propagation domain on top of `sub`, identified by the
	/// abstract type `aty`.
	pub fn new(aty: AType, sub: Rc<RefCell<VStore>>) -> Self {
		Self {
			aty,
			sub,
			props: Vec::new(),
		}
	}

	/// The abstract type identifying this domain.
	pub fn aty(&self) -> AType {
		self.aty
	}

	/// The store narrowed by this domain.
	pub fn subdomain(&self) -> Rc<RefCell<VStore>> {
		Rc::clone(&self.sub)
	}

	/// Collect the linear terms of `f` into `coeffs`/`vars`/`k`, where `sign`
	/// is the sign of the side of the relation `f` appears on.
	fn collect_terms(
		f: &Formula,
		env: &VarEnv,
		sign: IntVal,
		coeffs: &mut Vec<IntVal>,
		vars: &mut Vec<AVar>,
		k: &mut IntVal,
	) -> bool {
		match f {
			Formula::AVar(x) => {
				Self::add_term(sign, *x, coeffs, vars);
				true
			}
			Formula::LVar(name) => match env.get(name) {
				Some(x) => {
					Self::add_term(sign, x, coeffs, vars);
					true
				}
				None => false,
			},
			Formula::Z(value) => {
				// Constants move to the right-hand side.
				*k -= sign * value;
				true
			}
			Formula::Seq(Sig::Add, children) => children
				.iter()
				.all(|c| Self::collect_terms(c, env, sign, coeffs, vars, k)),
			_ => false,
		}
	}

	/// Add `sign · x` to the terms, merging with an existing term over `x`.
	fn add_term(sign: IntVal, x: AVar, coeffs: &mut Vec<IntVal>, vars: &mut Vec<AVar>) {
		if let Some(i) = vars.iter().position(|&v| v == x) {
			coeffs[i] += sign;
			if coeffs[i] == 0 {
				let _ = coeffs.swap_remove(i);
				let _ = vars.swap_remove(i);
			}
		} else {
			coeffs.push(sign);
			vars.push(x);
		}
	}

	/// Normalize a relational formula into a [`Linear`] constraint.
	fn normalize(&self, f: &Formula, env: &VarEnv) -> Result<Option<Linear>, InterpretationError> {
		let Formula::Seq(sig, children) = f else {
			return Err(self.unsupported(f));
		};
		let [lhs, rhs] = children.as_slice() else {
			return Err(self.unsupported(f));
		};
		let mut coeffs = Vec::new();
		let mut vars = Vec::new();
		let mut k = 0;
		if !Self::collect_terms(lhs, env, 1, &mut coeffs, &mut vars, &mut k)
			|| !Self::collect_terms(rhs, env, -1, &mut coeffs, &mut vars, &mut k)
		{
			return Err(self.unsupported(f));
		}
		let (coeffs, vars, op, k) = match sig {
			Sig::Eq => (coeffs, vars, LinOperator::Eq, k),
			Sig::Neq => (coeffs, vars, LinOperator::NotEq, k),
			Sig::Leq => (coeffs, vars, LinOperator::LessEq, k),
			Sig::Lt => (coeffs, vars, LinOperator::LessEq, k - 1),
			Sig::Geq => (
				coeffs.iter().map(|&c| -c).collect(),
				vars,
				LinOperator::LessEq,
				-k,
			),
			Sig::Gt => (
				coeffs.iter().map(|&c| -c).collect(),
				vars,
				LinOperator::LessEq,
				-k - 1,
			),
			_ => return Err(self.unsupported(f)),
		};
		if vars.is_empty() {
			let holds = match op {
				LinOperator::Eq => k == 0,
				LinOperator::LessEq => k >= 0,
				LinOperator::NotEq => k != 0,
			};
			return if holds {
				Ok(None)
			} else {
				Err(InterpretationError::new(
					Self::NAME,
					"the constraint is trivially false",
					f,
				))
			};
		}
		Ok(Some(Linear::new(coeffs, vars, op, k)))
	}

	/// Diagnostic for formulas outside the linear fragment.
	fn unsupported(&self, f: &Formula) -> InterpretationError {
		InterpretationError::new(
			Self::NAME,
			"only linear constraints over declared variables are supported",
			f,
		)
	}

	/// Interpret a single conjunct: a store atom when the store can represent
	/// it exactly, a linear propagator otherwise.
	fn interpret_conjunct(
		&self,
		f: &Formula,
		env: &VarEnv,
		store: &mut StoreTell,
		props: &mut Vec<Linear>,
	) -> Result<(), InterpretationError> {
		if let Ok(atoms) = self.sub.borrow().interpret_tell(f, env) {
			store.extend(atoms);
			return Ok(());
		}
		if let Some(linear) = self.normalize(f, env)? {
			props.push(linear);
		}
		Ok(())
	}

	/// Interpret `f`, flattening conjunctions.
	fn interpret(
		&self,
		f: &Formula,
		env: &VarEnv,
		store: &mut StoreTell,
		props: &mut Vec<Linear>,
	) -> Result<(), InterpretationError> {
		match f {
			Formula::Seq(Sig::And, children) => {
				for c in children {
					self.interpret(c, env, store, props)?;
				}
				Ok(())
			}
			_ => self.interpret_conjunct(f, env, store, props),
		}
	}
}

impl Domain for Propagation {
	type Ask = PropagationAsk;
	type Snapshot = PropagationSnapshot;
	type Tell = PropagationTell;

	fn interpret_tell(
		&self,
		f: &Formula,
		env: &VarEnv,
	) -> Result<PropagationTell, InterpretationError> {
		let mut tell = PropagationTell::default();
		self.interpret(f, env, &mut tell.store, &mut tell.props)?;
		Ok(tell)
	}

	fn interpret_ask(
		&self,
		f: &Formula,
		env: &VarEnv,
	) -> Result<PropagationAsk, InterpretationError> {
		let mut ask = PropagationAsk::default();
		self.interpret(f, env, &mut ask.store, &mut ask.props)?;
		Ok(ask)
	}

	fn tell(&mut self, t: &PropagationTell) -> bool {
		let mut has_changed = self.sub.borrow_mut().tell(&t.store);
		has_changed |= !t.props.is_empty();
		self.props.extend(t.props.iter().cloned());
		has_changed
	}

	fn ask(&self, a: &PropagationAsk) -> bool {
		let sub = self.sub.borrow();
		sub.ask(&a.store) && a.props.iter().all(|p| p.entailed(&sub))
	}

	delegate! {
		to self.sub.borrow() {
			fn project(&self, x: AVar) -> Interval;
			fn vars(&self) -> usize;
			fn is_top(&self) -> bool;
		}
	}

	fn is_bot(&self) -> bool {
		self.props.is_empty() && self.sub.borrow().is_bot()
	}

	fn is_extractable(&self) -> bool {
		let sub = self.sub.borrow();
		sub.is_extractable() && self.props.iter().all(|p| p.entailed(&sub))
	}

	fn extract(&self, target: &mut VStore) {
		self.sub.borrow().extract(target);
	}

	fn snapshot(&self) -> PropagationSnapshot {
		PropagationSnapshot {
			sub: self.sub.borrow().snapshot(),
			num_props: self.props.len(),
		}
	}

	fn restore(&mut self, snap: &PropagationSnapshot) {
		self.sub.borrow_mut().restore(&snap.sub);
		self.props.truncate(snap.num_props);
	}
}

impl Refinable for Propagation {
	fn num_refinements(&self) -> usize {
		self.props.len()
	}

	fn refine(&mut self, i: usize) -> bool {
		debug_assert!(i < self.props.len());
		let store = &mut *self.sub.borrow_mut();
		self.props[i].propagate(store)
	}
}

impl TellVar for Propagation {
	fn tell_var(&mut self, x: AVar, u: Interval) -> bool {
		self.sub.borrow_mut().tell_var(x, u)
	}
}

impl Deinterpret for Propagation {
	fn deinterpret(&self, env: &VarEnv) -> Formula {
		let sub = self.sub.borrow().deinterpret(env);
		let mut conjuncts = match sub {
			Formula::Seq(Sig::And, children) => children,
			other => vec![other],
		};
		conjuncts.extend(self.props.iter().map(Linear::deinterpret));
		Formula::Seq(Sig::And, conjuncts)
	}
}
