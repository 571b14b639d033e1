pub mod adapters;
pub mod config;
pub mod error;
pub mod report;
pub mod sync;
pub mod web;
