//! Module containing the search and optimization core: the branch container,
//! the splitting strategies, the depth-first search tree domain, and the
//! branch-and-bound wrapper.

pub mod bab;
pub mod branch;
pub mod split;
pub mod tree;
