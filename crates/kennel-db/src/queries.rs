//! Database query functions.

pub mod contracts;
pub mod kv;
