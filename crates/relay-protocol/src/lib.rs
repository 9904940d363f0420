//! Wire-level request/response/stream types for the three dialect families
//! (Claude, OpenAI, Gemini) accepted by the gateway, plus a shared SSE line parser.
//!
//! This crate is pure data: no transport, no transform logic. `relay-transform`
//! converts between these types; `relay-protocol` only describes their shape.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;

pub use sse::{SseEvent, SseParser};
