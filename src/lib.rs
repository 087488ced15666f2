//! Persona chat layer over a locally loaded causal language model.
//!
//! [`ModelProvisioner`] picks a device, resolves and loads a checkpoint
//! and fixes the sampling policy. [`ResponseEngine`] turns a user line plus
//! optional memory facts into one in-character reply, caching answers and
//! folding every generation failure into a fixed apology.

pub mod backend;
pub mod config;
pub mod error;
pub mod prompting;
pub mod provisioner;
pub mod remote;
pub mod responder;

pub use config::CompanionConfig;
pub use error::{ConfigError, GenerationError, ProvisionError, RemoteError};
pub use prompting::{GenerationPolicy, MemoryContext, PromptEnvelope, SamplingSettings};
pub use provisioner::{DeviceChoice, ModelProvisioner, QuantizationPolicy};
pub use responder::{EngineOptions, ResponseEngine, SharedResponder, TextGenerator, TurnOutcome};
