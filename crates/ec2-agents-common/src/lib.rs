//! ec2-agents-common - Shared types and utilities
//!
//! This crate provides the SDK-free pieces shared by the provisioning engine
//! and its tooling, without any AWS SDK dependencies to keep it lightweight.
//!
//! ## Modules
//!
//! - [`defaults`]: Default timings, caps and connection settings
//! - [`lifecycle`]: Instance lifecycle states and remote EC2 states
//! - [`private_key`]: PEM private keys, EC2 fingerprints and Windows password decryption
//! - [`tags`]: Reserved EC2 tag keys used for ownership and discovery

pub mod defaults;
pub mod lifecycle;
pub mod private_key;
pub mod tags;

pub use lifecycle::{LifecycleState, RemoteState};
pub use private_key::{KeyError, PrivateKey};
