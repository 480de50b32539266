// Data model for the eval/exec pipeline: recipes in, plans out, state kept.

pub mod plan;
pub mod recipe;
pub mod state_file;
