//! The table abstract domain: represents predicates in extension by listing
//! their solutions as rows of lattice values, one column per variable.
//!
//! It generalizes the classical `table` constraint by lifting every cell to a
//! universe value, so a row can cover a set of assignments rather than a
//! single tuple. Propagation alternates two refinements: *column tightening*
//! narrows a variable to the hull of the surviving rows of its column, and
//! *row elimination* discards rows whose ask value became incompatible with
//! the store. Eliminated rows are never re-activated.

use std::{cell::RefCell, rc::Rc};

use delegate::delegate;
use fixedbitset::FixedBitSet;

use crate::{
	domain::{Deinterpret, Domain, Refinable, TellVar},
	interval::Interval,
	logic::{Formula, InterpretationError, Sig, VarEnv},
	store::VStore,
	AType, AVar,
};

/// Cell values of one table, row major.
type Table = Vec<Vec<Interval>>;

#[derive(Clone, Debug)]
/// Tell delta of a [`Tables`] domain: new tables and updates forwarded to
/// the subdomain.
pub struct TablesTell<T> {
	/// Updates forwarded to the subdomain.
	sub: Vec<T>,
	/// The variables forming the columns of each new table.
	headers: Vec<Vec<AVar>>,
	/// The tell interpretation of the cells of each new table.
	tell_tables: Vec<Table>,
	/// The ask interpretation of the cells of each new table.
	ask_tables: Vec<Table>,
}

impl<T> Default for TablesTell<T> {
	fn default() -> Self {
		Self {
			sub: Vec::new(),
			headers: Vec::new(),
			tell_tables: Vec::new(),
			ask_tables: Vec::new(),
		}
	}
}

#[derive(Clone, Debug)]
/// Ask delta of a [`Tables`] domain.
pub struct TablesAsk<T> {
	/// Queries forwarded to the subdomain.
	sub: Vec<T>,
	/// The variables forming the columns of each queried table.
	headers: Vec<Vec<AVar>>,
	/// The ask interpretation of the cells of each queried table.
	ask_tables: Vec<Table>,
}

impl<T> Default for TablesAsk<T> {
	fn default() -> Self {
		Self {
			sub: Vec::new(),
			headers: Vec::new(),
			ask_tables: Vec::new(),
		}
	}
}

#[derive(Clone, Debug)]
/// Snapshot of a [`Tables`] domain.
pub struct TablesSnapshot<S> {
	/// Snapshot of the subdomain.
	sub: S,
	/// Number of tables at capture time.
	num_tables: usize,
	/// Number of cells across all tables at capture time.
	total_cells: usize,
}

/// Abstract domain holding extensional constraints as tables of universe
/// values over the variables of a shared store-backed subdomain.
pub struct Tables<A> {
	/// The abstract type identifying this domain.
	aty: AType,
	/// The abstract type of the store hosting the column variables.
	store_aty: AType,
	/// The subdomain narrowed by the tables.
	sub: Rc<RefCell<A>>,
	/// The variables forming the columns of each table.
	headers: Vec<Vec<AVar>>,
	/// The tell interpretation of the cells of each table.
	tell_tables: Vec<Table>,
	/// The ask interpretation of the cells of each table.
	ask_tables: Vec<Table>,
	/// Rows proven incompatible with the current store, per table.
	eliminated: Vec<FixedBitSet>,
	/// Table owning each global column index.
	table_of_column: Vec<usize>,
	/// First global column index of each table; one trailing entry holds the
	/// total number of columns.
	first_column: Vec<usize>,
	/// Number of cells across all tables.
	total_cells: usize,
}

impl<A: Domain + Refinable + TellVar> Tables<A> {
	/// Name of the component in diagnostics.
	const NAME: &'static str = "Tables";

	/// Create a table domain on top of `sub`, identified by the abstract type
	/// `aty`; column variables belong to the store identified by `store_aty`.
	pub fn new(aty: AType, store_aty: AType, sub: Rc<RefCell<A>>) -> Self {
		Self {
			aty,
			store_aty,
			sub,
			headers: Vec::new(),
			tell_tables: Vec::new(),
			ask_tables: Vec::new(),
			eliminated: Vec::new(),
			table_of_column: Vec::new(),
			first_column: vec![0],
			total_cells: 0,
		}
	}

	/// The abstract type identifying this domain.
	pub fn aty(&self) -> AType {
		self.aty
	}

	/// The subdomain narrowed by this domain.
	pub fn subdomain(&self) -> Rc<RefCell<A>> {
		Rc::clone(&self.sub)
	}

	/// The number of tables currently registered.
	pub fn num_tables(&self) -> usize {
		self.headers.len()
	}

	/// Flatten nested conjunctions into `out`.
	fn flatten_and(f: &Formula, out: &mut Vec<Formula>) {
		if let Formula::Seq(Sig::And, children) = f {
			for c in children {
				Self::flatten_and(c, out);
			}
		} else {
			out.push(f.clone());
		}
	}

	/// Flatten nested disjunctions, normalizing each disjunct into either a
	/// flat conjunction or a single atom.
	fn flatten_or(f: &Formula, out: &mut Vec<Formula>) {
		if let Formula::Seq(Sig::Or, children) = f {
			for c in children {
				Self::flatten_or(c, out);
			}
		} else {
			let mut conjuncts = Vec::new();
			Self::flatten_and(f, &mut conjuncts);
			match conjuncts.len() {
				0 => out.push(Formula::truth()),
				1 => out.push(conjuncts.pop().unwrap()),
				_ => out.push(Formula::Seq(Sig::And, conjuncts)),
			}
		}
	}

	/// Normalize `f` into a disjunction of flat conjunctions.
	fn flatten(f: &Formula) -> Formula {
		let mut disjuncts = Vec::new();
		Self::flatten_or(f, &mut disjuncts);
		if disjuncts.len() > 1 {
			Formula::Seq(Sig::Or, disjuncts)
		} else {
			disjuncts.pop().unwrap()
		}
	}

	/// Interpret one cell atom into the last row of the table, adding a new
	/// column when the atom constrains a variable not seen in earlier rows.
	fn interpret_atom(
		&self,
		header: &mut Vec<AVar>,
		tell_rows: &mut Table,
		ask_rows: &mut Table,
		f: &Formula,
		env: &VarEnv,
	) -> Result<(), InterpretationError> {
		if f.num_vars() != 1 {
			return Err(InterpretationError::new(
				Self::NAME,
				"only unary formulas are supported in the cells of a table",
				f,
			));
		}
		let x = f
			.var_in(env)
			.filter(|x| x.aty() == self.store_aty)
			.ok_or_else(|| InterpretationError::new(Self::NAME, "undeclared variable", f))?;
		let u = match f {
			Formula::Seq(sig, children) => match children.as_slice() {
				[Formula::AVar(_) | Formula::LVar(_), Formula::Z(k)] => {
					Interval::interpret_atom(*sig, *k)
				}
				_ => None,
			},
			_ => None,
		}
		.ok_or_else(|| {
			InterpretationError::new(
				Self::NAME,
				"the cell atom is not representable in the universe",
				f,
			)
		})?;
		let col = match header.iter().position(|&v| v == x) {
			Some(col) => col,
			None => {
				// A variable absent from the previous rows: its column starts
				// unconstrained everywhere.
				header.push(x);
				for row in tell_rows.iter_mut() {
					row.push(Interval::bot());
				}
				for row in ask_rows.iter_mut() {
					row.push(Interval::bot());
				}
				header.len() - 1
			}
		};
		let last = tell_rows.len() - 1;
		tell_rows[last][col] = tell_rows[last][col].join(u);
		ask_rows[last][col] = ask_rows[last][col].join(u);
		Ok(())
	}

	/// Interpret a flat disjunction as one table.
	fn interpret_table(
		&self,
		disjuncts: &[Formula],
		env: &VarEnv,
	) -> Result<(Vec<AVar>, Table, Table), InterpretationError> {
		let mut header = Vec::new();
		let mut tell_rows: Table = Vec::new();
		let mut ask_rows: Table = Vec::new();
		for disjunct in disjuncts {
			tell_rows.push(vec![Interval::bot(); header.len()]);
			ask_rows.push(vec![Interval::bot(); header.len()]);
			match disjunct {
				Formula::Seq(Sig::And, atoms) => {
					for atom in atoms {
						self.interpret_atom(&mut header, &mut tell_rows, &mut ask_rows, atom, env)?;
					}
				}
				atom => {
					self.interpret_atom(&mut header, &mut tell_rows, &mut ask_rows, atom, env)?;
				}
			}
		}
		Ok((header, tell_rows, ask_rows))
	}

	/// Whether every queried table has at least one row whose ask cells are
	/// all entailed by the subdomain.
	fn tables_entailed(&self, headers: &[Vec<AVar>], ask_tables: &[Table]) -> bool {
		let sub = self.sub.borrow();
		ask_tables.iter().zip(headers).all(|(rows, header)| {
			rows.iter().any(|row| {
				row.iter()
					.zip(header)
					.all(|(cell, &x)| cell.contains(&sub.project(x)))
			})
		})
	}

	/// Column tightening: narrow the variable of column `c` of table `t` to
	/// the hull of the surviving rows.
	fn crefine(&mut self, t: usize, c: usize) -> bool {
		let mut u = Interval::top();
		for (r, row) in self.tell_tables[t].iter().enumerate() {
			if !self.eliminated[t].contains(r) {
				u = u.meet(row[c]);
			}
		}
		self.sub.borrow_mut().tell_var(self.headers[t][c], u)
	}

	/// Row elimination: discard row `r` of table `t` when the ask value of
	/// its cell in column `c` is incompatible with the current store.
	fn lrefine(&mut self, t: usize, r: usize, c: usize) -> bool {
		if self.eliminated[t].contains(r) {
			return false;
		}
		let dom = self.sub.borrow().project(self.headers[t][c]);
		if self.ask_tables[t][r][c].join(dom).is_top() {
			self.eliminated[t].insert(r);
			true
		} else {
			false
		}
	}
}

impl<A: Domain + Refinable + TellVar> Domain for Tables<A> {
	type Ask = TablesAsk<A::Ask>;
	type Snapshot = TablesSnapshot<A::Snapshot>;
	type Tell = TablesTell<A::Tell>;

	fn interpret_tell(
		&self,
		f: &Formula,
		env: &VarEnv,
	) -> Result<TablesTell<A::Tell>, InterpretationError> {
		let mut tell = TablesTell::default();
		let flat = Self::flatten(f);
		if let Formula::Seq(Sig::Or, disjuncts) = &flat {
			match self.interpret_table(disjuncts, env) {
				Ok((header, tell_rows, ask_rows)) => {
					tell.headers.push(header);
					tell.tell_tables.push(tell_rows);
					tell.ask_tables.push(ask_rows);
					return Ok(tell);
				}
				// A disjunct the table cannot represent: the whole formula
				// falls back to the subdomain.
				Err(table_err) => {
					let sub = self
						.sub
						.borrow()
						.interpret_tell(f, env)
						.map_err(|_| table_err)?;
					tell.sub.push(sub);
					return Ok(tell);
				}
			}
		}
		tell.sub.push(self.sub.borrow().interpret_tell(f, env)?);
		Ok(tell)
	}

	fn interpret_ask(
		&self,
		f: &Formula,
		env: &VarEnv,
	) -> Result<TablesAsk<A::Ask>, InterpretationError> {
		let mut ask = TablesAsk::default();
		let flat = Self::flatten(f);
		if let Formula::Seq(Sig::Or, disjuncts) = &flat {
			match self.interpret_table(disjuncts, env) {
				Ok((header, _, ask_rows)) => {
					ask.headers.push(header);
					ask.ask_tables.push(ask_rows);
					return Ok(ask);
				}
				Err(table_err) => {
					let sub = self
						.sub
						.borrow()
						.interpret_ask(f, env)
						.map_err(|_| table_err)?;
					ask.sub.push(sub);
					return Ok(ask);
				}
			}
		}
		ask.sub.push(self.sub.borrow().interpret_ask(f, env)?);
		Ok(ask)
	}

	fn tell(&mut self, t: &TablesTell<A::Tell>) -> bool {
		let mut has_changed = !t.headers.is_empty();
		for sub_tell in &t.sub {
			has_changed |= self.sub.borrow_mut().tell(sub_tell);
		}
		for i in 0..t.headers.len() {
			let header = t.headers[i].clone();
			let tell_rows = t.tell_tables[i].clone();
			let ask_rows = t.ask_tables[i].clone();
			let table_idx = self.headers.len();
			for _ in 0..header.len() {
				self.table_of_column.push(table_idx);
			}
			self.first_column
				.push(self.first_column.last().unwrap() + header.len());
			self.total_cells += tell_rows.len() * header.len();
			self.eliminated.push(FixedBitSet::with_capacity(tell_rows.len()));
			self.headers.push(header);
			self.tell_tables.push(tell_rows);
			self.ask_tables.push(ask_rows);
		}
		has_changed
	}

	fn ask(&self, a: &TablesAsk<A::Ask>) -> bool {
		self.tables_entailed(&a.headers, &a.ask_tables)
			&& a.sub.iter().all(|q| self.sub.borrow().ask(q))
	}

	delegate! {
		to self.sub.borrow() {
			fn project(&self, x: AVar) -> Interval;
			fn vars(&self) -> usize;
		}
	}

	fn is_bot(&self) -> bool {
		self.tell_tables.is_empty() && self.sub.borrow().is_bot()
	}

	fn is_top(&self) -> bool {
		self.eliminated
			.iter()
			.zip(&self.tell_tables)
			.any(|(eliminated, rows)| eliminated.count_ones(..) == rows.len())
			|| self.sub.borrow().is_top()
	}

	fn is_extractable(&self) -> bool {
		self.tables_entailed(&self.headers, &self.ask_tables)
			&& self.sub.borrow().is_extractable()
	}

	fn extract(&self, target: &mut VStore) {
		self.sub.borrow().extract(target);
	}

	fn snapshot(&self) -> TablesSnapshot<A::Snapshot> {
		TablesSnapshot {
			sub: self.sub.borrow().snapshot(),
			num_tables: self.headers.len(),
			total_cells: self.total_cells,
		}
	}

	fn restore(&mut self, snap: &TablesSnapshot<A::Snapshot>) {
		self.sub.borrow_mut().restore(&snap.sub);
		self.total_cells = snap.total_cells;
		self.first_column.truncate(snap.num_tables + 1);
		self.headers.truncate(snap.num_tables);
		self.table_of_column.truncate(*self.first_column.last().unwrap());
		self.tell_tables.truncate(snap.num_tables);
		self.ask_tables.truncate(snap.num_tables);
		self.eliminated.truncate(snap.num_tables);
		// Eliminations are not trailed; propagation recomputes them.
		for eliminated in &mut self.eliminated {
			eliminated.clear();
		}
	}
}

impl<A: Domain + Refinable + TellVar> Refinable for Tables<A> {
	fn num_refinements(&self) -> usize {
		self.sub.borrow().num_refinements() + self.table_of_column.len() + self.total_cells
	}

	fn refine(&mut self, i: usize) -> bool {
		debug_assert!(i < self.num_refinements());
		let sub_refinements = self.sub.borrow().num_refinements();
		if i < sub_refinements {
			return self.sub.borrow_mut().refine(i);
		}
		let mut i = i - sub_refinements;
		if i < self.table_of_column.len() {
			let t = self.table_of_column[i];
			return self.crefine(t, i - self.first_column[t]);
		}
		i -= self.table_of_column.len();
		for t in 0..self.tell_tables.len() {
			let cols = self.headers[t].len();
			let dim = self.tell_tables[t].len() * cols;
			if i < dim {
				return self.lrefine(t, i / cols, i % cols);
			}
			i -= dim;
		}
		false
	}
}

impl<A: Domain + Refinable + TellVar> TellVar for Tables<A> {
	fn tell_var(&mut self, x: AVar, u: Interval) -> bool {
		self.sub.borrow_mut().tell_var(x, u)
	}
}

impl<A: Domain + Refinable + TellVar + Deinterpret> Deinterpret for Tables<A> {
	fn deinterpret(&self, env: &VarEnv) -> Formula {
		let sub = self.sub.borrow().deinterpret(env);
		let mut conjuncts = match sub {
			Formula::Seq(Sig::And, children) => children,
			other => vec![other],
		};
		let store = self.sub.borrow();
		for t in 0..self.headers.len() {
			let mut disjuncts = Vec::new();
			for (r, row) in self.tell_tables[t].iter().enumerate() {
				if self.eliminated[t].contains(r) {
					continue;
				}
				let cells = row
					.iter()
					.enumerate()
					.filter(|&(c, cell)| {
						// Entailed cells carry no information anymore.
						!cell.contains(&store.project(self.headers[t][c]))
					})
					.map(|(c, cell)| cell.deinterpret(self.headers[t][c]))
					.collect::<Vec<_>>();
				disjuncts.push(Formula::Seq(Sig::And, cells));
			}
			conjuncts.push(Formula::Seq(Sig::Or, disjuncts));
		}
		Formula::Seq(Sig::And, conjuncts)
	}
}
