//! Shared functionality used in unit and integration tests.

#![allow(dead_code)]

mod pe;

pub use pe::*;
