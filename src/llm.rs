//! Generation backends producing delta streams for the delivery engine.

pub mod gemini;

pub use gemini::GeminiClient;
