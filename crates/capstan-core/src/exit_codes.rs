//! Standard exit codes for CLI wrappers around the engine

#![allow(dead_code)]

/// Success - the plan executed (or there was nothing to do)
pub const SUCCESS: i32 = 0;

/// Plan failure - plan construction or execution failed
pub const PLAN_FAILURE: i32 = 1;

/// Configuration error - bad inputs, unknown cluster, invalid options
pub const CONFIG_ERROR: i32 = 2;
