//! Credentials and tokens for hosted agents.
//!
//! Outbound: [`ConnectionManager`] picks the connection for a request and its
//! [`AccessTokenProvider`] mints (and caches) tokens for the relay, downstream
//! APIs and the agentic identity chain. Inbound: [`JwtVerifier`] turns the
//! `Authorization` header into a [`agents_core::ClaimsIdentity`].
mod agentic;
pub mod cache;
pub mod certificate;
pub mod config;
pub mod connections;
pub mod error;
pub mod jwks;
pub mod provider;
pub mod transport;
pub mod verifier;

pub use cache::TokenCache;
pub use certificate::CertificateCredential;
pub use config::{
    AgentsConfig, ConnectionMapEntry, ConnectionSettings, CredentialConfig, CredentialKind,
    Environment, HostSettings,
};
pub use connections::{ConnectionManager, Connections};
pub use error::AuthError;
pub use jwks::{HttpSigningKeySource, SigningKeySource, StaticKeySource};
pub use provider::{AccessTokenProvider, CredentialTokenProvider};
pub use transport::{
    ManagedIdentityEndpoint, MockTokenTransport, ReqwestTokenTransport, TokenTransport,
    TransportCall,
};
pub use verifier::{JwtVerifier, TokenVerifier};
