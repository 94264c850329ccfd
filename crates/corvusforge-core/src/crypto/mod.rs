//! Cryptographic provider chain and trust-context primitives.
//!
//! Corvusforge never assumes a crypto backend. Providers are probed in
//! priority order at construction time and the selection is cached:
//!
//! 1. An externally registered SATL-compatible provider, when one has been
//!    supplied via [`ProviderChain::with_preferred`].
//! 2. The native Ed25519 provider.
//! 3. The fail-closed provider: `verify` always returns `false`, `sign`
//!    refuses.
//!
//! # Fail-closed verification
//!
//! [`ProviderChain::verify_data`] is the only site in the crate that can
//! produce a positive verification outcome. It returns `true` only when the
//! selected provider is real crypto, the signature is well-formed, and the
//! cryptographic check succeeds. Every error, absence, or malformation
//! yields `false`.

mod provider;
mod trust;

pub use provider::{
    CryptoError, CryptoProvider, FailClosedProvider, NativeEd25519Provider, ProviderChain,
    SIGNATURE_SIZE,
};
pub use trust::{
    FINGERPRINT_LEN, TRUST_CONTEXT_VERSION, TrustContext, compute_trust_context, hash_pin,
    key_fingerprint,
};
