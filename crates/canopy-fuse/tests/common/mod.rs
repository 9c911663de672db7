pub mod harness;

pub use harness::{build_tree, test_hash, TestMount, TreeSpec};
