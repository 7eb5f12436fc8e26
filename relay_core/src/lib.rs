pub mod config;
pub mod error;
pub mod llm;
pub mod relay;
pub mod utils;
pub mod web;
