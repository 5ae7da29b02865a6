pub mod config;
pub mod engine;
pub mod persist;
pub mod runtime;
pub mod sampler;
pub mod tracker;
pub mod web;
