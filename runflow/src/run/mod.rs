//! Runs: the unit of pipeline execution and its argument tree.

mod arguments;
mod lifecycle;

pub use arguments::{
    as_arguments, merge_into_map, remove_value_at_path, set_value_at_path, split_path,
    value_at_path, Arguments,
};
pub use lifecycle::{CancelHook, Run};
