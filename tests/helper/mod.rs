//! Shared test utilities
#![allow(dead_code, unused_imports)]

mod fakes;
mod server;

pub use fakes::*;
pub use server::*;
