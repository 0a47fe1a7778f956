//! Nodeboot CLI - stages the runtime image for a node.

pub mod commands;
