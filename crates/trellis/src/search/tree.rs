//! The search tree abstract domain: manages the depth-first traversal of the
//! branches produced by a splitting strategy over a shared subdomain.
//!
//! Observed from the outside, the subdomain backtracks and therefore does not
//! evolve monotonically; the search tree itself, understood as the set of
//! explored nodes, grows monotonically with every [`SearchTree::refine`].

use std::{cell::RefCell, rc::Rc};

use tracing::trace;

use crate::{
	domain::Domain,
	interval::Interval,
	logic::{Formula, InterpretationError, VarEnv},
	search::{
		branch::Branch,
		split::{SplitSnapshot, SplitStrategy, Strategy},
	},
	store::VStore,
	AType, AVar,
};

#[derive(Clone, Debug)]
/// Update interpreted by a [`SearchTree`]: either a narrowing of the
/// subdomain or new splitting strategies.
pub enum TreeTell<T> {
	/// Narrowing forwarded to the subdomain.
	Sub(T),
	/// Strategies forwarded to the splitting component.
	Strategies(Vec<Strategy>),
}

/// Snapshot of a [`SearchTree`], capturing the subdomain, the splitting
/// strategies, and the handle through which the subdomain is shared.
pub struct TreeSnapshot<A: Domain> {
	/// Snapshot of the subdomain.
	sub_snap: A::Snapshot,
	/// Snapshot of the splitting component.
	split_snap: SplitSnapshot,
	/// Handle on the subdomain, so that an exhausted tree can be revived.
	sub: Rc<RefCell<A>>,
}

impl<A: Domain> Clone for TreeSnapshot<A> {
	fn clone(&self) -> Self {
		Self {
			sub_snap: self.sub_snap.clone(),
			split_snap: self.split_snap,
			sub: Rc::clone(&self.sub),
		}
	}
}

/// The search tree abstract domain.
///
/// The domain is in one of three states:
/// - **Empty** (*top*): the whole tree has been explored; the subdomain
///   handle is dropped and every operation but state queries is a no-op.
/// - **Singleton** (root): the path is empty and the subdomain reflects the
///   root node.
/// - **Internal**: the path is non-empty and the subdomain reflects the meet
///   of the root with the current child of every branch on the path.
///
/// Updates told while the tree sits in an internal node cannot reach the
/// root immediately; they are queued and applied to the root on the next
/// backtrack, so that the remaining subtrees observe them as well.
pub struct SearchTree<A: Domain> {
	/// The abstract type identifying this domain.
	aty: AType,
	/// The subdomain reflecting the node currently being explored, or `None`
	/// once the tree is exhausted.
	a: Option<Rc<RefCell<A>>>,
	/// The splitting component producing the branches of the tree.
	split: Rc<RefCell<SplitStrategy<A>>>,
	/// The branches from the root to the current node.
	path: Vec<Branch<A::Tell>>,
	/// Snapshots of the subdomain and splitting component at the root.
	root: (A::Snapshot, SplitSnapshot),
	/// Subdomain updates awaiting the next backtrack to the root.
	root_sub_tells: Vec<A::Tell>,
	/// Strategies awaiting the next backtrack to the root.
	root_split_tells: Vec<Strategy>,
}

impl<A: Domain> SearchTree<A> {
	/// Name of the component in diagnostics.
	const NAME: &'static str = "SearchTree";

	/// Create a search tree exploring the subdomain `a` with the branches
	/// produced by `split`, identified by the abstract type `aty`.
	pub fn new(aty: AType, a: Rc<RefCell<A>>, split: Rc<RefCell<SplitStrategy<A>>>) -> Self {
		let root = (a.borrow().snapshot(), split.borrow().snapshot());
		Self {
			aty,
			a: Some(a),
			split,
			path: Vec::new(),
			root,
			root_sub_tells: Vec::new(),
			root_split_tells: Vec::new(),
		}
	}

	/// The abstract type identifying this domain.
	pub fn aty(&self) -> AType {
		self.aty
	}

	/// Whether the tree consists of the root node only.
	pub fn is_singleton(&self) -> bool {
		self.path.is_empty() && self.a.is_some()
	}

	/// The depth of the node currently being explored; the root has depth 0.
	pub fn depth(&self) -> usize {
		self.path.len()
	}

	/// Move to the next node of the search tree.
	///
	/// One call performs one step of *split*, *push* and *pop*: the splitting
	/// strategy proposes a branch, the branch is pushed on the path (or the
	/// current node is recognised as pruned), and the subdomain is committed
	/// to the next child, backtracking first when necessary. Returns whether
	/// anything changed; once the tree is exhausted this is a no-op.
	pub fn refine(&mut self) -> bool {
		if self.a.is_none() {
			return false;
		}
		let branch = self.split.borrow_mut().split();
		let pruned = self.push(branch);
		self.pop(pruned)
	}

	/// The shared handle on the subdomain.
	///
	/// # Panics
	///
	/// Panics when the tree is exhausted.
	fn sub(&self) -> Rc<RefCell<A>> {
		Rc::clone(self.a.as_ref().expect("the search tree is exhausted"))
	}

	/// Capture the subdomain and splitting component for the root.
	fn root_snapshots(&self) -> (A::Snapshot, SplitSnapshot) {
		(self.sub().borrow().snapshot(), self.split.borrow().snapshot())
	}

	/// Push `branch` on the path. Returns `true` when the branch is empty,
	/// meaning the current node is pruned.
	fn push(&mut self, branch: Branch<A::Tell>) -> bool {
		if branch.size() == 0 {
			return true;
		}
		if self.is_singleton() {
			// Leaving the root: capture it so backtracking can return here.
			self.root = self.root_snapshots();
		}
		self.path.push(branch);
		false
	}

	/// Commit to the next node: the first child of the branch just pushed, or
	/// the next child further up after backtracking from a pruned node.
	fn pop(&mut self, pruned: bool) -> bool {
		if !pruned {
			self.commit_left()
		} else {
			let mut has_changed = self.backtrack();
			has_changed |= self.commit_right();
			has_changed
		}
	}

	/// Commit to the first child of the branch at the top of the path.
	fn commit_left(&mut self) -> bool {
		let a = self.sub();
		let branch = self.path.last_mut().expect("commit on an empty path");
		let result = a.borrow_mut().tell(branch.next());
		result
	}

	/// Backtrack to the root: drop exhausted branches, restore the root
	/// state and flush the deferred root updates. When no branch is left the
	/// tree becomes exhausted.
	fn backtrack(&mut self) -> bool {
		while self.path.last().is_some_and(|b| !b.has_next()) {
			let _ = self.path.pop();
		}
		if !self.path.is_empty() {
			let a = self.sub();
			a.borrow_mut().restore(&self.root.0);
			self.split.borrow_mut().restore(&self.root.1);
			self.tell_root()
		} else if self.a.take().is_some() {
			trace!("search tree exhausted");
			true
		} else {
			false
		}
	}

	/// Advance the traversal at the top of the path and replay the current
	/// children from the root down to the new node.
	fn commit_right(&mut self) -> bool {
		if self.path.is_empty() {
			return false;
		}
		let _ = self.path.last_mut().expect("commit on an empty path").next();
		self.replay()
	}

	/// Re-apply the current child of every branch on the path to the freshly
	/// restored root.
	fn replay(&mut self) -> bool {
		let a = self.sub();
		let mut has_changed = false;
		for branch in &self.path {
			has_changed |= a.borrow_mut().tell(branch.current());
		}
		has_changed
	}

	/// Flush the deferred updates into the root and refresh the root
	/// snapshots so the updates survive later backtracks.
	fn tell_root(&mut self) -> bool {
		if self.root_sub_tells.is_empty() && self.root_split_tells.is_empty() {
			return false;
		}
		let a = self.sub();
		let mut has_changed = false;
		for t in self.root_sub_tells.drain(..) {
			has_changed |= a.borrow_mut().tell(&t);
		}
		let strategies = std::mem::take(&mut self.root_split_tells);
		has_changed |= self.split.borrow_mut().tell(&strategies);
		self.root = (a.borrow().snapshot(), self.split.borrow().snapshot());
		has_changed
	}
}

impl<A: Domain> Domain for SearchTree<A> {
	type Ask = A::Ask;
	type Snapshot = TreeSnapshot<A>;
	type Tell = TreeTell<A::Tell>;

	fn interpret_tell(
		&self,
		f: &Formula,
		env: &VarEnv,
	) -> Result<TreeTell<A::Tell>, InterpretationError> {
		if self.is_top() {
			return Err(InterpretationError::new(
				Self::NAME,
				"the search tree is exhausted",
				f,
			));
		}
		if matches!(f, Formula::ESeq(name, _) if name == "search") {
			Ok(TreeTell::Strategies(
				self.split.borrow().interpret_tell(f, env)?,
			))
		} else {
			Ok(TreeTell::Sub(self.sub().borrow().interpret_tell(f, env)?))
		}
	}

	fn interpret_ask(&self, f: &Formula, env: &VarEnv) -> Result<A::Ask, InterpretationError> {
		if self.is_top() {
			return Err(InterpretationError::new(
				Self::NAME,
				"the search tree is exhausted",
				f,
			));
		}
		self.sub().borrow().interpret_ask(f, env)
	}

	fn tell(&mut self, t: &TreeTell<A::Tell>) -> bool {
		if self.is_top() {
			return false;
		}
		if !self.is_singleton() {
			// The root is unreachable right now; the update is queued for the
			// next backtrack, and still applied to the subtree being explored.
			match t {
				TreeTell::Sub(sub) => self.root_sub_tells.push(sub.clone()),
				TreeTell::Strategies(s) => self.root_split_tells.extend(s.iter().cloned()),
			}
		}
		match t {
			TreeTell::Sub(sub) => self.sub().borrow_mut().tell(sub),
			TreeTell::Strategies(s) => self.split.borrow_mut().tell(s),
		}
	}

	fn ask(&self, a: &A::Ask) -> bool {
		match &self.a {
			Some(sub) => sub.borrow().ask(a),
			None => false,
		}
	}

	fn project(&self, x: AVar) -> Interval {
		match &self.a {
			None => Interval::top(),
			Some(a) => {
				assert!(
					self.is_singleton(),
					"projection on a search tree with multiple nodes is not supported"
				);
				a.borrow().project(x)
			}
		}
	}

	fn vars(&self) -> usize {
		self.a.as_ref().map_or(0, |a| a.borrow().vars())
	}

	fn is_bot(&self) -> bool {
		self.is_singleton() && self.sub().borrow().is_bot()
	}

	fn is_top(&self) -> bool {
		self.a.is_none()
	}

	fn is_extractable(&self) -> bool {
		self.a.as_ref().is_some_and(|a| a.borrow().is_extractable())
	}

	fn extract(&self, target: &mut VStore) {
		if let Some(a) = &self.a {
			a.borrow().extract(target);
		}
	}

	fn snapshot(&self) -> TreeSnapshot<A> {
		assert!(
			self.is_singleton(),
			"a search tree can only be captured at its root"
		);
		TreeSnapshot {
			sub_snap: self.sub().borrow().snapshot(),
			split_snap: self.split.borrow().snapshot(),
			sub: self.sub(),
		}
	}

	fn restore(&mut self, snap: &TreeSnapshot<A>) {
		self.a = Some(Rc::clone(&snap.sub));
		snap.sub.borrow_mut().restore(&snap.sub_snap);
		self.split.borrow_mut().restore(&snap.split_snap);
		self.path.clear();
		self.root_sub_tells.clear();
		self.root_split_tells.clear();
		self.root = self.root_snapshots();
	}
}

#[cfg(test)]
mod tests {
	use std::{cell::RefCell, rc::Rc};

	use expect_test::expect;

	use crate::{
		domain::Domain,
		fixpoint::GaussSeidel,
		interval::Interval,
		logic::{Formula, Sig, VarEnv},
		propagation::Propagation,
		search::{split::SplitStrategy, tree::SearchTree},
		store::VStore,
		tests::{all_assigned, assignment, bounds_atoms, store_with_env},
		AVar,
	};

	/// A search tree enumerating the store directly, with domains and a
	/// search strategy told through the tree.
	fn enumeration_tree(
		names: &[&str],
		lb: i64,
		ub: i64,
	) -> (Rc<RefCell<VStore>>, SearchTree<VStore>, VarEnv) {
		let (store, env) = store_with_env(0, names);
		let split = Rc::new(RefCell::new(SplitStrategy::new(1, 0, Rc::clone(&store))));
		let mut st = SearchTree::new(2, Rc::clone(&store), split);

		assert!(st.is_bot());
		assert!(!st.is_top());

		let mut formulas = bounds_atoms(names, lb, ub);
		formulas.push(Formula::search(
			"input_order",
			"indomain_min",
			names.iter().map(|n| Formula::lvar(n)),
		));
		for f in formulas {
			let t = st.interpret_tell(&f, &env).unwrap();
			assert!(st.tell(&t));
		}
		assert!(!st.is_bot());
		(store, st, env)
	}

	#[test]
	fn test_unconstrained_enumeration() {
		let (store, mut st, _) = enumeration_tree(&["a", "b", "c"], 0, 2);

		let mut solutions = Vec::new();
		for _ in 0..27 {
			// Go down a branch until every variable is assigned.
			loop {
				assert!(st.refine());
				if all_assigned(&store.borrow()) {
					break;
				}
			}
			assert!(st.is_extractable());
			let mut sol = VStore::new(0, 3);
			st.extract(&mut sol);
			solutions.push(assignment(&sol));
		}
		assert!(!st.is_top());
		assert!(!st.is_bot());

		// The next refinement exhausts the tree, after which refining is a
		// no-op.
		assert!(st.refine());
		assert!(st.is_top());
		assert!(!st.refine());
		assert!(st.is_top());

		expect![[r#"
    0, 0, 0
    0, 0, 1
    0, 0, 2
    0, 1, 0
    0, 1, 1
    0, 1, 2
    0, 2, 0
    0, 2, 1
    0, 2, 2
    1, 0, 0
    1, 0, 1
    1, 0, 2
    1, 1, 0
    1, 1, 1
    1, 1, 2
    1, 2, 0
    1, 2, 1
    1, 2, 2
    2, 0, 0
    2, 0, 1
    2, 0, 2
    2, 1, 0
    2, 1, 1
    2, 1, 2
    2, 2, 0
    2, 2, 1
    2, 2, 2"#]]
		.assert_eq(&solutions.join("\n"));
	}

	#[test]
	fn test_constrained_enumeration() {
		let names = ["a", "b", "c"];
		let (store, env) = store_with_env(0, &names);
		let prop = Rc::new(RefCell::new(Propagation::new(1, Rc::clone(&store))));
		let split = Rc::new(RefCell::new(SplitStrategy::new(2, 0, Rc::clone(&prop))));
		let mut st = SearchTree::new(3, Rc::clone(&prop), split);

		let mut formulas = bounds_atoms(&names, 0, 2);
		formulas.push(Formula::binary(
			Formula::Seq(Sig::Add, vec![Formula::lvar("a"), Formula::lvar("b")]),
			Sig::Eq,
			Formula::lvar("c"),
		));
		formulas.push(Formula::search(
			"input_order",
			"indomain_min",
			names.iter().map(|n| Formula::lvar(n)),
		));
		for f in formulas {
			let t = st.interpret_tell(&f, &env).unwrap();
			assert!(st.tell(&t));
		}

		let mut solutions = Vec::new();
		let mut iterations = 0;
		let mut has_changed = true;
		while has_changed {
			iterations += 1;
			has_changed = false;
			has_changed |= GaussSeidel.fixpoint(&mut *prop.borrow_mut());
			if all_assigned(&store.borrow()) && st.is_extractable() {
				let mut sol = VStore::new(0, 3);
				st.extract(&mut sol);
				solutions.push(assignment(&sol));
			}
			has_changed |= st.refine();
		}

		assert_eq!(iterations, 12);
		assert!(st.is_top());
		expect![[r#"
    0, 0, 0
    0, 1, 1
    0, 2, 2
    1, 0, 1
    1, 1, 2
    2, 0, 2"#]]
		.assert_eq(&solutions.join("\n"));

		// One more fixpoint plus refinement to check idempotence.
		let mut has_changed = GaussSeidel.fixpoint(&mut *prop.borrow_mut());
		has_changed |= st.refine();
		assert!(!has_changed);
	}

	#[test]
	fn test_root_deferred_updates() {
		let (store, mut st, env) = enumeration_tree(&["a", "b"], 0, 1);
		let a = AVar::new(0, 0);
		let b = AVar::new(0, 1);

		// Commit to the left branch `a = 0`.
		assert!(st.refine());
		assert_eq!(st.depth(), 1);

		// Told in an internal node, the update narrows the current subtree
		// and is queued for the root.
		let f = Formula::binary(Formula::lvar("b"), Sig::Eq, Formula::z(1));
		let t = st.interpret_tell(&f, &env).unwrap();
		assert!(st.tell(&t));
		assert_eq!(store.borrow().project(b), Interval::singleton(1));

		// Both variables are assigned, so the next refinement backtracks and
		// commits to `a > 0`; the deferred update must hold there as well.
		assert!(st.refine());
		assert_eq!(store.borrow().project(a), Interval::singleton(1));
		assert_eq!(store.borrow().project(b), Interval::singleton(1));
	}

	#[test]
	fn test_tell_on_exhausted_tree_is_noop() {
		let (_, mut st, env) = enumeration_tree(&["a"], 0, 0);
		let f = Formula::binary(Formula::lvar("a"), Sig::Eq, Formula::z(0));
		let t = st.interpret_tell(&f, &env).unwrap();

		// A single already-assigned variable: the first refinement exhausts
		// the tree.
		assert!(st.refine());
		assert!(st.is_top());

		assert!(!st.tell(&t));
		assert!(st.interpret_tell(&f, &env).is_err());
		assert_eq!(st.project(AVar::new(0, 0)), Interval::top());
	}

	#[test]
	fn test_snapshot_restore_revives_the_tree() {
		let (store, mut st, _) = enumeration_tree(&["a", "b"], 0, 1);
		let snap = st.snapshot();

		let mut solutions = 0;
		loop {
			if !st.refine() {
				break;
			}
			if all_assigned(&store.borrow()) && !st.is_top() {
				solutions += 1;
			}
		}
		assert_eq!(solutions, 4);
		assert!(st.is_top());

		st.restore(&snap);
		assert!(st.is_singleton());
		assert!(!st.is_top());
		assert_eq!(st.project(AVar::new(0, 0)), Interval::new(0, 1));

		// The search can run to completion again.
		let mut solutions = 0;
		loop {
			if !st.refine() {
				break;
			}
			if all_assigned(&store.borrow()) && !st.is_top() {
				solutions += 1;
			}
		}
		assert_eq!(solutions, 4);
	}

	#[test]
	#[should_panic(expected = "captured at its root")]
	fn test_snapshot_outside_root() {
		let (_, mut st, _) = enumeration_tree(&["a", "b"], 0, 1);
		let _ = st.refine();
		let _ = st.snapshot();
	}

	#[test]
	#[should_panic(expected = "multiple nodes")]
	fn test_project_on_internal_node() {
		let (_, mut st, _) = enumeration_tree(&["a", "b"], 0, 1);
		let _ = st.refine();
		let _ = st.project(AVar::new(0, 0));
	}
}
