//! Shared test utilities.

#![allow(dead_code)]

mod server;

pub use server::{eventually, TestServer};
