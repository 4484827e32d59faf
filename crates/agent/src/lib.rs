//! Local signing agent: accepts batch requests over HTTP, brokers
//! credentials interactively, and drives signing runs through an isolated
//! worker subprocess before reconciling results with the remote backend.

pub mod credentials;
pub mod error;
pub mod manager;
pub mod orchestrator;
pub mod remote;
pub mod server;

pub use credentials::{CredentialBroker, CredentialPrompt, CredentialRecord, Resolution};
pub use error::AgentError;
pub use manager::{DocumentSigning, ManagerConfig, ManagerError, SubprocessManager};
pub use orchestrator::{BatchOutcome, Orchestrator};
pub use remote::{
    BatchState, JsonRpcBackend, JsonRpcBackendFactory, RemoteBackend, RemoteBackendFactory,
    RemoteError, SignedDocument, UnsignedDocument,
};
pub use server::{AppState, SigningRequest, router, run};
