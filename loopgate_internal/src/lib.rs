//! Internal implementation details for the loopgate bridge.
//!
//! This crate provides the types and the binary wire protocol shared by the loopgate
//! server and the URL handler that hands requests off to it.
//! It is not intended for direct use; users should depend on the `loopgate` crate instead.

/// Command request payload carried by the binary protocol.
pub mod request;
/// Parsing of the custom URL scheme that launches the handler.
pub mod url;
/// Wire protocol for the companion-process binary channel.
pub mod wire;
