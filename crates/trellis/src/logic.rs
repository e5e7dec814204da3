//! Definitions of the logic formulas exchanged between abstract domains, the
//! environment mapping declared variable names to abstract variables, and the
//! diagnostics produced when a domain cannot interpret a formula.

use std::fmt;

use itertools::Itertools;
use thiserror::Error;

use crate::{AVar, IntVal};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Operator combining the children of an n-ary formula sequence.
pub enum Sig {
	/// Integer addition of the children.
	Add,
	/// Conjunction of the children; an empty conjunction is `true`.
	And,
	/// Equality between two children.
	Eq,
	/// Greater-or-equal comparison between two children.
	Geq,
	/// Strictly-greater comparison between two children.
	Gt,
	/// Less-or-equal comparison between two children.
	Leq,
	/// Strictly-less comparison between two children.
	Lt,
	/// Declares the single child as an objective to maximize.
	Maximize,
	/// Declares the single child as an objective to minimize.
	Minimize,
	/// Disequality between two children.
	Neq,
	/// Disjunction of the children; an empty disjunction is `false`.
	Or,
}

impl Sig {
	/// The name of the operator as it appears in printed formulas.
	pub fn name(&self) -> &'static str {
		match self {
			Sig::Add => "+",
			Sig::And => "and",
			Sig::Eq => "=",
			Sig::Geq => ">=",
			Sig::Gt => ">",
			Sig::Leq => "<=",
			Sig::Lt => "<",
			Sig::Maximize => "maximize",
			Sig::Minimize => "minimize",
			Sig::Neq => "!=",
			Sig::Or => "or",
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
/// A logic formula exchanged between the abstract domains of a solving stack.
///
/// Formulas are immutable values. They are not evaluated directly: every
/// domain re-interprets the formulas it receives into its own tell or ask
/// representation, and delegates the formulas it does not recognise to its
/// subdomain.
pub enum Formula {
	/// A declared logical variable, referenced by name.
	LVar(String),
	/// An abstract variable constant.
	AVar(AVar),
	/// An integer constant.
	Z(IntVal),
	/// An n-ary sequence of sub-formulas combined by an operator.
	Seq(Sig, Vec<Formula>),
	/// An extended sequence tagged by a name, for instance the `search(...)`
	/// predicate. A name with an empty sequence acts as a plain identifier.
	ESeq(String, Vec<Formula>),
}

impl Formula {
	/// Create a binary sequence `lhs <sig> rhs`.
	pub fn binary(lhs: Formula, sig: Sig, rhs: Formula) -> Self {
		Formula::Seq(sig, vec![lhs, rhs])
	}

	/// Create an abstract variable constant.
	pub fn avar(x: AVar) -> Self {
		Formula::AVar(x)
	}

	/// Create a reference to the declared logical variable `name`.
	pub fn lvar(name: &str) -> Self {
		Formula::LVar(name.to_owned())
	}

	/// Create an integer constant.
	pub fn z(value: IntVal) -> Self {
		Formula::Z(value)
	}

	/// Create a plain identifier, represented as an extended sequence without
	/// children.
	pub fn ident(name: &str) -> Self {
		Formula::ESeq(name.to_owned(), Vec::new())
	}

	/// The formula that always holds, represented as an empty conjunction.
	pub fn truth() -> Self {
		Formula::Seq(Sig::And, Vec::new())
	}

	/// Create a `search(<var-order>, <val-order>, v1, ..., vn)` predicate
	/// posting a branching strategy.
	pub fn search<I: IntoIterator<Item = Formula>>(
		var_order: &str,
		val_order: &str,
		vars: I,
	) -> Self {
		let mut children = vec![Formula::ident(var_order), Formula::ident(val_order)];
		children.extend(vars);
		Formula::ESeq("search".to_owned(), children)
	}

	/// Create a `minimize(v)` objective predicate.
	pub fn minimize(objective: Formula) -> Self {
		Formula::Seq(Sig::Minimize, vec![objective])
	}

	/// Create a `maximize(v)` objective predicate.
	pub fn maximize(objective: Formula) -> Self {
		Formula::Seq(Sig::Maximize, vec![objective])
	}

	/// Whether this formula is the identifier `name`.
	pub fn is_ident(&self, name: &str) -> bool {
		matches!(self, Formula::ESeq(n, children) if n == name && children.is_empty())
	}

	/// The number of variable occurrences in this formula.
	pub fn num_vars(&self) -> usize {
		match self {
			Formula::LVar(_) | Formula::AVar(_) => 1,
			Formula::Z(_) => 0,
			Formula::Seq(_, children) | Formula::ESeq(_, children) => {
				children.iter().map(Formula::num_vars).sum()
			}
		}
	}

	/// The first variable occurring in this formula, resolved against `env`
	/// when it is a named variable. Returns `None` if the formula contains no
	/// variable, or a named variable that is not declared in `env`.
	pub fn var_in(&self, env: &VarEnv) -> Option<AVar> {
		match self {
			Formula::AVar(x) => Some(*x),
			Formula::LVar(name) => env.get(name),
			Formula::Z(_) => None,
			Formula::Seq(_, children) | Formula::ESeq(_, children) => {
				children.iter().find_map(|c| c.var_in(env))
			}
		}
	}
}

impl fmt::Display for Formula {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Formula::LVar(name) => write!(f, "{name}"),
			Formula::AVar(x) => write!(f, "{x}"),
			Formula::Z(value) => write!(f, "{value}"),
			Formula::Seq(Sig::And, children) if children.is_empty() => write!(f, "true"),
			Formula::Seq(Sig::Or, children) if children.is_empty() => write!(f, "false"),
			Formula::Seq(sig, children) if children.len() == 2 => {
				write!(f, "({} {} {})", children[0], sig.name(), children[1])
			}
			Formula::Seq(sig, children) => {
				write!(f, "{}({})", sig.name(), children.iter().format(", "))
			}
			Formula::ESeq(name, children) if children.is_empty() => write!(f, "{name}"),
			Formula::ESeq(name, children) => {
				write!(f, "{name}({})", children.iter().format(", "))
			}
		}
	}
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{component}: {message} (in `{formula}`)")]
/// Diagnostic produced when a domain cannot turn a formula into one of its
/// tell or ask representations.
///
/// Interpretation errors never mutate the state of the domain that produced
/// them.
pub struct InterpretationError {
	/// Name of the component that rejected the formula.
	pub component: &'static str,
	/// Human readable description of why the formula was rejected.
	pub message: String,
	/// The formula that could not be interpreted.
	pub formula: Formula,
}

impl InterpretationError {
	/// Create a diagnostic for `component` rejecting `formula`.
	pub fn new(component: &'static str, message: impl Into<String>, formula: &Formula) -> Self {
		Self {
			component,
			message: message.into(),
			formula: formula.clone(),
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Environment mapping declared logical variable names to the abstract
/// variables hosting them.
pub struct VarEnv {
	/// Declared variables in declaration order.
	bindings: Vec<(String, AVar)>,
}

impl VarEnv {
	/// Declare `name` as referring to the abstract variable `x`.
	pub fn bind(&mut self, name: &str, x: AVar) {
		debug_assert!(self.get(name).is_none(), "variable `{name}' declared twice");
		self.bindings.push((name.to_owned(), x));
	}

	/// The abstract variable declared under `name`, if any.
	pub fn get(&self, name: &str) -> Option<AVar> {
		self.bindings
			.iter()
			.find(|(n, _)| n == name)
			.map(|(_, x)| *x)
	}

	/// The name under which `x` was declared, if any.
	pub fn name_of(&self, x: AVar) -> Option<&str> {
		self.bindings
			.iter()
			.find(|(_, v)| *v == x)
			.map(|(n, _)| n.as_str())
	}
}
