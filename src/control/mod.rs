mod client;

pub use client::ControlClient;

#[cfg(test)]
#[path = "client_tests.rs"]
mod client_tests;
