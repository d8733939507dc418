use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

use crate::certificate::CertificateRecord;
use crate::connector::ConnectError;
use crate::verifier::VerifyError;

/// Classified failure of one probe, identified by a stable code
#[derive(Clone, Debug, Eq, Error, PartialEq, strum::IntoStaticStr)]
pub enum ProbeError {
    /// Dial or handshake exceeded the timeout
    #[error("IO timeout")]
    #[strum(serialize = "ETIMEOUT")]
    Timeout,
    /// Any other connection failure
    #[error("{0}")]
    #[strum(serialize = "CONNECTERROR")]
    Connect(String),
    /// Handshake completed without a certificate
    #[error("no cert found")]
    #[strum(serialize = "NOCERT")]
    NoCertificate,
    /// Single certificate issued by itself
    #[error("self signed certificate")]
    #[strum(serialize = "SELFSIGNED")]
    SelfSigned,
    /// Single certificate whose issuer was not presented
    #[error("incomplete certificate chain")]
    #[strum(serialize = "INCOMPLETECERTCHAIN")]
    IncompleteChain,
    /// Certificate names do not include the requested hostname
    #[error("certificate is not valid for the requested hostname")]
    #[strum(serialize = "INVALIDHOSTNAME")]
    InvalidHostname,
    /// Any other verification failure
    #[error("{0}")]
    #[strum(serialize = "CERTERROR")]
    Certificate(String),
}

impl ProbeError {
    /// Stable code of this error
    ///
    /// ```
    /// # use certprobe::ProbeError;
    /// assert_eq!("ETIMEOUT", ProbeError::Timeout.code());
    /// assert_eq!("CERTERROR", ProbeError::Certificate("expired".to_string()).code());
    /// ```
    pub fn code(&self) -> &'static str {
        self.into()
    }
}

impl Serialize for ProbeError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ProbeError", 2)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Classify a failure to reach the certificates
pub fn classify_connect_error(e: &ConnectError) -> ProbeError {
    match e {
        ConnectError::Timeout => ProbeError::Timeout,
        ConnectError::Connect(message) => ProbeError::Connect(message.clone()),
    }
}

/// Classify a failed verification of the `presented` certificates.
///
/// A lone certificate is diagnosed by its issuer before the reason reported
/// by the verifier is considered.
///
/// ```
/// # use certprobe::{classify_verification, CertificateRecord, ProbeError, VerifyError};
/// let record = CertificateRecord {
///     subject: "mail.example.com".to_string(),
///     issuer: "mail.example.com".to_string(),
///     ..Default::default()
/// };
/// let e = VerifyError::NameMismatch("www.example.com".to_string());
/// assert_eq!(ProbeError::SelfSigned, classify_verification(&[record], &e));
/// ```
pub fn classify_verification(presented: &[CertificateRecord], e: &VerifyError) -> ProbeError {
    match presented {
        [] => ProbeError::NoCertificate,
        [leaf] if leaf.is_self_issued() => ProbeError::SelfSigned,
        [_] => ProbeError::IncompleteChain,
        _ => match e {
            VerifyError::NameMismatch(_) => ProbeError::InvalidHostname,
            e => ProbeError::Certificate(e.to_string()),
        },
    }
}
