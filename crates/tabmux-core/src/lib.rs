//! Core types and logic for tabmux.
//!
//! This crate holds the I/O-free pieces of the terminal multiplexer: the
//! sequence-addressed scrollback buffer, replay planning for reattaching
//! clients, the panel layout tree and the wire protocol. The daemon in
//! `tabmux-cli` wires them to real PTYs and sockets.
//!
//! # Modules
//!
//! - [`scrollback`]: bounded output history with head/tail sequence cursors
//! - [`replay`]: what to resend to a client that (re)attaches
//! - [`layout`]: split tree of panels, persisted per session
//! - [`protocol`]: JSON-line request/response and push messages
//! - [`error`]: API error types with actionable suggestions
//!
//! # Sequence accounting
//!
//! Every byte a shell writes gets the next sequence number. Clients report
//! the last sequence they rendered; on reattach they receive exactly the
//! bytes after it. A client that already shows the current prompt therefore
//! gets an empty replay instead of a second copy of the prompt.

pub mod error;
pub mod layout;
pub mod protocol;
pub mod replay;
pub mod scrollback;
