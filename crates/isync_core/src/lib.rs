pub mod audit;
pub mod db;
pub mod dedup;
pub mod domain;
pub mod engine;
pub mod error;
pub mod graph;
pub mod repo;
pub mod state;
pub mod sync;
pub mod tracker;
