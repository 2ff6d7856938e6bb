//! Dockling CLI - Docker-like front end for the container engine.

pub mod commands;
pub mod output;
