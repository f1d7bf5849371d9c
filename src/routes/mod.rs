pub mod evaluations;
pub mod health;
pub mod logs;
pub mod runs;
pub mod settings;
