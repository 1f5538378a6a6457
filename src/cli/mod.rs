//! Command-line interface for running and checking flows

pub mod check;
pub mod run;

pub use check::CheckArgs;
pub use run::RunArgs;
