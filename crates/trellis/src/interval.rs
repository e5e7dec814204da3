//! The interval universe: the lattice value attached to each variable of the
//! store. An interval is described by an integer lower and upper bound, with
//! [`IntVal::MIN`] and [`IntVal::MAX`] acting as the unbounded sentinels.

use std::fmt;

use crate::{
	logic::{Formula, Sig},
	AVar, IntVal,
};

/// Sentinel value of a lower bound that is unbounded below.
pub const NEG_INF: IntVal = IntVal::MIN;

/// Sentinel value of an upper bound that is unbounded above.
pub const POS_INF: IntVal = IntVal::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// An integer interval `[lb, ub]`, ordered by information: the unconstrained
/// interval is *bot* and the empty interval is *top*.
///
/// Empty intervals are canonicalized so that all of them compare equal.
pub struct Interval {
	/// Lower bound of the interval.
	lb: IntVal,
	/// Upper bound of the interval.
	ub: IntVal,
}

impl Interval {
	/// Create the interval `[lb, ub]`; any empty interval collapses to
	/// [`Interval::top`].
	pub fn new(lb: IntVal, ub: IntVal) -> Self {
		if lb > ub {
			Self::top()
		} else {
			Self { lb, ub }
		}
	}

	/// Create the singleton interval `[value, value]`.
	pub fn singleton(value: IntVal) -> Self {
		Self {
			lb: value,
			ub: value,
		}
	}

	/// The unconstrained interval, containing every integer.
	pub const fn bot() -> Self {
		Self {
			lb: NEG_INF,
			ub: POS_INF,
		}
	}

	/// The empty interval, containing no integer.
	pub const fn top() -> Self {
		Self {
			lb: POS_INF,
			ub: NEG_INF,
		}
	}

	/// The lower bound of the interval.
	pub fn lb(&self) -> IntVal {
		self.lb
	}

	/// The upper bound of the interval.
	pub fn ub(&self) -> IntVal {
		self.ub
	}

	/// Whether the interval is unconstrained.
	pub fn is_bot(&self) -> bool {
		self.lb == NEG_INF && self.ub == POS_INF
	}

	/// Whether the interval is empty.
	pub fn is_top(&self) -> bool {
		self.lb > self.ub
	}

	/// Whether the interval contains exactly one value.
	pub fn is_singleton(&self) -> bool {
		self.lb == self.ub
	}

	/// The difference between the upper and lower bound, saturating at the
	/// unbounded sentinels. The width of an empty interval is 0.
	pub fn width(&self) -> IntVal {
		if self.is_top() {
			0
		} else {
			self.ub.saturating_sub(self.lb)
		}
	}

	/// The midpoint of the interval, rounding towards the lower bound.
	///
	/// Only meaningful on non-empty intervals with finite bounds.
	pub fn median(&self) -> IntVal {
		self.lb + (self.ub - self.lb) / 2
	}

	/// The intersection of two intervals; adds information, moving up the
	/// lattice.
	pub fn join(self, other: Interval) -> Interval {
		Interval::new(self.lb.max(other.lb), self.ub.min(other.ub))
	}

	/// The convex hull of two intervals; loses information, moving down the
	/// lattice. The hull with an empty interval is the other interval.
	pub fn meet(self, other: Interval) -> Interval {
		if self.is_top() {
			other
		} else if other.is_top() {
			self
		} else {
			Interval {
				lb: self.lb.min(other.lb),
				ub: self.ub.max(other.ub),
			}
		}
	}

	/// Whether every value of `other` is also a value of `self`.
	pub fn contains(&self, other: &Interval) -> bool {
		other.is_top() || (self.lb <= other.lb && other.ub <= self.ub)
	}

	/// Interpret the unary atom `x <sig> value` as the interval of values of
	/// `x` satisfying it. Returns `None` for operators that intervals cannot
	/// represent exactly, such as [`Sig::Neq`].
	pub fn interpret_atom(sig: Sig, value: IntVal) -> Option<Interval> {
		match sig {
			Sig::Eq => Some(Interval::singleton(value)),
			Sig::Leq => Some(Interval::new(NEG_INF, value)),
			Sig::Lt => Some(Interval::new(NEG_INF, value.saturating_sub(1))),
			Sig::Geq => Some(Interval::new(value, POS_INF)),
			Sig::Gt => Some(Interval::new(value.saturating_add(1), POS_INF)),
			_ => None,
		}
	}

	/// Reconstruct a formula describing this interval as the domain of `x`.
	pub fn deinterpret(&self, x: AVar) -> Formula {
		if self.is_top() {
			Formula::Seq(Sig::Or, Vec::new())
		} else if self.is_singleton() {
			Formula::binary(Formula::avar(x), Sig::Eq, Formula::z(self.lb))
		} else {
			let mut conjuncts = Vec::new();
			if self.lb != NEG_INF {
				conjuncts.push(Formula::binary(Formula::avar(x), Sig::Geq, Formula::z(self.lb)));
			}
			if self.ub != POS_INF {
				conjuncts.push(Formula::binary(Formula::avar(x), Sig::Leq, Formula::z(self.ub)));
			}
			match conjuncts.len() {
				0 => Formula::truth(),
				1 => conjuncts.pop().unwrap(),
				_ => Formula::Seq(Sig::And, conjuncts),
			}
		}
	}
}

impl fmt::Display for Interval {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_top() {
			return write!(f, "[]");
		}
		match (self.lb, self.ub) {
			(NEG_INF, POS_INF) => write!(f, "[..]"),
			(NEG_INF, ub) => write!(f, "[..{ub}]"),
			(lb, POS_INF) => write!(f, "[{lb}..]"),
			(lb, ub) => write!(f, "[{lb}..{ub}]"),
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::{
		interval::{Interval, NEG_INF, POS_INF},
		logic::Sig,
	};

	#[test]
	fn test_lattice_ops() {
		let a = Interval::new(0, 5);
		let b = Interval::new(3, 8);
		assert_eq!(a.join(b), Interval::new(3, 5));
		assert_eq!(a.meet(b), Interval::new(0, 8));
		assert!(Interval::new(4, 2).is_top());
		assert_eq!(Interval::new(6, 8).join(a), Interval::top());
		assert_eq!(Interval::top().meet(a), a);
		assert!(Interval::bot().contains(&a));
		assert!(!a.contains(&b));
	}

	#[test]
	fn test_width_and_median() {
		assert_eq!(Interval::new(0, 2).width(), 2);
		assert_eq!(Interval::singleton(7).width(), 0);
		assert_eq!(Interval::top().width(), 0);
		assert_eq!(Interval::bot().width(), POS_INF);
		assert_eq!(Interval::new(0, 2).median(), 1);
		assert_eq!(Interval::new(1, 2).median(), 1);
		assert_eq!(Interval::new(-5, 5).median(), 0);
	}

	#[test]
	fn test_atom_interpretation() {
		assert_eq!(
			Interval::interpret_atom(Sig::Eq, 3),
			Some(Interval::singleton(3))
		);
		assert_eq!(
			Interval::interpret_atom(Sig::Lt, 3),
			Some(Interval::new(NEG_INF, 2))
		);
		assert_eq!(
			Interval::interpret_atom(Sig::Gt, 3),
			Some(Interval::new(4, POS_INF))
		);
		assert_eq!(Interval::interpret_atom(Sig::Neq, 3), None);
	}
}
