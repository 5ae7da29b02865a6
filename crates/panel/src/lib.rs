pub mod config;
pub mod db;
pub mod monitors;
pub mod services;
pub mod sync;
pub mod web;
