//! vault-client - authentication and session primitives for a Vault agent
//!
//! - [`auth`]: `AuthMethod` trait and the built-in providers
//!   (userpass, kubernetes, token file, kerberos, gcp, azure, aws, alicloud)
//! - [`SessionClient`]: login / renew / revoke / wrap against the server
//! - [`Credential`]: session token plus lease metadata

pub mod auth;
mod client;
mod error;
mod models;

pub use client::{HttpSessionClient, HttpSessionClientBuilder, SessionClient};
pub use error::{ErrorClass, FailureKind, VaultError};
pub use models::{AuthRequest, Credential, CredentialKind, Token};
