// Core pipeline modules: configuration, recipe loading, evaluation,
// execution, state, verification, and the shared utilities underneath.

pub mod cancel;
pub mod config;
pub mod dependency_resolver;
pub mod plan_executor;
pub mod plan_generator;
pub mod predownload;
pub mod recipe_loading;
pub mod state_management;
pub mod utilities;
pub mod verifier;
