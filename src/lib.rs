//! acmg-mcp-engine: JSON-RPC 2.0 protocol engine for an MCP tool, resource
//! and prompt service
//!
//! The engine sits between a byte transport and the handlers that do the
//! actual work. It owns the parts with protocol-state semantics:
//!
//! - **Wire handling**: decoding, JSON-RPC 2.0 validation, error codes
//! - **Admission**: per-client token bucket, fixed window and blocking
//! - **Sessions**: per-client lifecycle, authentication state, counters
//! - **Negotiation**: protocol version and capability agreement
//! - **Routing**: built-in system methods and handler registries
//!
//! Tool, resource and prompt business logic lives in handlers registered by
//! the embedding application.
//!
//! # Modules
//!
//! - [`config`] — Configuration loading and validation
//! - [`error`] — Error types
//! - [`mcp`] — Protocol engine and stdio server

pub mod config;
pub mod error;
pub mod mcp;
