pub mod generation;
pub mod models;
