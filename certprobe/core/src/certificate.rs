use chrono::{DateTime, Utc};
use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::extensions::GeneralName;
use x509_parser::nom;
use x509_parser::parse_x509_certificate;
use x509_parser::signature_algorithm::SignatureAlgorithm;
use x509_parser::x509::{AlgorithmIdentifier, X509Name};

/// Certificates ordered leaf first, each followed by its issuer
pub type Chain = Vec<CertificateRecord>;

/// RFC 1123 with a numeric zone
const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

const RSASSA_PSS: &str = "1.2.840.113549.1.1.10";

/// Portable summary of one X.509 certificate
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    /// Subject common name
    pub subject: String,
    /// Issuer common name
    pub issuer: String,
    /// DNS names the certificate is valid for, never empty
    pub alt_names: Vec<String>,
    /// Signature algorithm e.g. `SHA256-RSA`
    pub signature_algorithm: String,
    /// Start of the validity window
    pub not_before: String,
    /// End of the validity window
    pub not_after: String,
    /// SHA-1 fingerprint of the DER encoding in hex
    pub sha1: String,
    /// Serial number in hex
    pub serial: String,
}

impl CertificateRecord {
    /// Parse a DER encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, X509Error> {
        let cert = parse(der)?;

        let subject = common_name(cert.subject());
        let mut alt_names = dns_names(&cert);
        if alt_names.is_empty() {
            alt_names.push(subject.clone());
        }

        Ok(CertificateRecord {
            issuer: common_name(cert.issuer()),
            subject,
            alt_names,
            signature_algorithm: describe_signature_algorithm(&cert.signature_algorithm),
            not_before: format_timestamp(cert.validity().not_before.timestamp()),
            not_after: format_timestamp(cert.validity().not_after.timestamp()),
            sha1: hex::encode(digest(&SHA1_FOR_LEGACY_USE_ONLY, der)),
            serial: hex::encode(cert.tbs_certificate.raw_serial()),
        })
    }

    /// Issued by itself, judged by common names
    pub fn is_self_issued(&self) -> bool {
        self.issuer == self.subject
    }
}

/// Convert every presented certificate, keeping their order
pub fn extract_chain(certificates: &[CertificateDer<'_>]) -> Result<Chain, X509Error> {
    certificates
        .iter()
        .map(|c| CertificateRecord::from_der(c.as_ref()))
        .collect()
}

pub(crate) fn parse(der: &[u8]) -> Result<X509Certificate<'_>, X509Error> {
    match parse_x509_certificate(der) {
        Ok((_, cert)) => Ok(cert),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(e),
        Err(nom::Err::Incomplete(_)) => Err(X509Error::InvalidCertificate),
    }
}

fn common_name(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let san = match cert.subject_alternative_name() {
        Ok(Some(san)) => san,
        _ => return vec![],
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns_name) => Some(dns_name.to_string()),
            _ => None,
        })
        .collect()
}

fn format_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_default()
}

fn describe_signature_algorithm(algorithm: &AlgorithmIdentifier<'_>) -> String {
    let oid = algorithm.algorithm.to_id_string();
    let pss_hash = match SignatureAlgorithm::try_from(algorithm) {
        Ok(SignatureAlgorithm::RSASSA_PSS(params)) => {
            Some(params.hash_algorithm_oid().to_id_string())
        }
        _ => None,
    };
    signature_algorithm_name(&oid, pss_hash.as_deref())
}

/// RSASSA-PSS is named after the hash carried in its parameters
fn signature_algorithm_name(oid: &str, pss_hash: Option<&str>) -> String {
    let name = match (oid, pss_hash) {
        (RSASSA_PSS, Some("2.16.840.1.101.3.4.2.1")) => "SHA256-RSAPSS",
        (RSASSA_PSS, Some("2.16.840.1.101.3.4.2.2")) => "SHA384-RSAPSS",
        (RSASSA_PSS, Some("2.16.840.1.101.3.4.2.3")) => "SHA512-RSAPSS",
        (RSASSA_PSS, _) => "RSA-PSS",
        (oid, _) => return oid_name(oid),
    };
    name.to_string()
}

fn oid_name(oid: &str) -> String {
    let name = match oid {
        "1.2.840.113549.1.1.2" => "MD2-RSA",
        "1.2.840.113549.1.1.4" => "MD5-RSA",
        "1.2.840.113549.1.1.5" => "SHA1-RSA",
        "1.2.840.113549.1.1.11" => "SHA256-RSA",
        "1.2.840.113549.1.1.12" => "SHA384-RSA",
        "1.2.840.113549.1.1.13" => "SHA512-RSA",
        "1.2.840.10040.4.3" => "DSA-SHA1",
        "2.16.840.1.101.3.4.3.2" => "DSA-SHA256",
        "1.2.840.10045.4.1" => "ECDSA-SHA1",
        "1.2.840.10045.4.3.2" => "ECDSA-SHA256",
        "1.2.840.10045.4.3.3" => "ECDSA-SHA384",
        "1.2.840.10045.4.3.4" => "ECDSA-SHA512",
        "1.3.101.112" => "Ed25519",
        "1.3.101.113" => "Ed448",
        _ => oid,
    };
    name.to_string()
}
