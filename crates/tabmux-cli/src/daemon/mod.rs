//! Daemon process owning the PTYs, and the client used to reach it.

pub mod client;
pub mod config;
pub mod connection;
pub mod feed;
pub mod layout_store;
pub mod paths;
pub mod pty;
pub mod server;
pub mod session;

pub use client::DaemonClient;
pub use server::DaemonServer;
