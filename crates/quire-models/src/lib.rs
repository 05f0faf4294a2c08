//! Upstream client implementations for Quire.
//!
//! This crate provides concrete implementations of the `UpstreamClient` trait.
//!
//! # Supported Providers
//!
//! - **Scripted**: deterministic in-process client for testing and offline use
//! - **OpenAI-compatible**: any server exposing `/chat/completions` (hosted or local)

pub mod compatible;
pub mod scripted;

pub use compatible::CompatibleClient;
pub use scripted::{ScriptStep, ScriptedClient};
