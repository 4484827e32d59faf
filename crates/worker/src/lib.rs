//! Short-lived signing worker.
//!
//! Runs once per batch in its own process so that a crash or a hung
//! hardware-token call never takes down the long-lived agent. All
//! communication with the parent goes through files in the working
//! directory; the worker never opens a socket back to the agent.

pub mod runner;
pub mod signer;

pub use runner::Worker;
pub use signer::{CommandSigner, PdfSigner, SignerError, open_backend};
