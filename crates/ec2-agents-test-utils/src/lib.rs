//! Shared test utilities for ec2-agents
//!
//! - [`aws`]: region detection and unique run ids for tests against a real account
//! - [`keys`]: a fixed RSA key pair with known fingerprints and an encrypted
//!   Windows password blob

pub mod aws;
pub mod keys;
