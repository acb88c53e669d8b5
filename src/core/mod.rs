//! Core translation engine module

pub mod cache;
pub mod client;
pub mod config;
pub mod errors;
pub mod generation;
pub mod lazy;
pub mod lora;
pub mod models;
pub mod service;
