//! Integration tests for the relaybus client core.
//!
//! Scenarios live under `tests/` and drive the public API against the
//! in-memory broker.
