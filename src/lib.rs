//! SealedSecret Re-Encryption Library
//!
//! Re-seals every `SealedSecret` in a cluster against the sealed-secrets
//! controller's current public key after a key rotation.
//!
//! A run lists SealedSecrets, fetches the controller certificate once, and
//! drives each object through the per-item state machine in
//! [`controller::engine`] under the bounded [`controller::scheduler`].
//! Outcomes are aggregated by [`controller::reporter`] into a
//! [`controller::reporter::RunReport`]. [`runtime::run_reencryption`] ties
//! these together; the `ssrctl` binary is a thin shell around it.

pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod keys;
pub mod observability;
pub mod runtime;
