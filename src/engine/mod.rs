//! Core engine components

pub mod arena;
pub mod value;
pub mod expr;
pub mod interface;
pub mod state_cache;
pub mod queue;
pub mod plan;
pub mod listener;
pub mod node;
pub mod config;
pub mod messages;
pub mod builder;
pub mod exec;
pub mod runner;
pub mod scripted;
