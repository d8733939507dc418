#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

//! TLS certificate chain probe
//!
//! Connects to a target, captures the certificates it presents, verifies them
//! against the trust store and classifies what went wrong, if anything.

pub use certificate::{extract_chain, Chain, CertificateRecord};
pub use connector::{ConfigError, ConnectError, Connector, ProtocolRange, TlsVersion};
pub use outcome::{classify_connect_error, classify_verification, ProbeError};
pub use prober::{Prober, ProberBuilder, DEFAULT_TIMEOUT};
pub use request::ProbeRequest;
pub use result::ProbeResult;
pub use verifier::{ChainVerifier, VerifyError};

/// Re-exported so callers can hand certificates and timestamps to the verifier
pub use rustls::pki_types::{CertificateDer, UnixTime};

mod certificate;
mod connector;
mod outcome;
mod prober;
mod request;
mod result;
mod verifier;
