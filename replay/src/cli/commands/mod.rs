pub mod audit;
pub mod config;
pub mod patterns;
pub mod requests;
pub mod workflow;
