// Arena-based storage for nested reactive records
//
// Each ReactiveTree owns its own slab of nodes. There is no global registry:
// two trees never share ids, and dropping a tree drops every node in it.

mod tree;

pub use tree::{NodeId, ReactiveTree};
