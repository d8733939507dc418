use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Target of one probe
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ProbeRequest {
    /// Name sent as SNI and matched against the certificate
    pub hostname: String,
    /// IP address or resolvable name to connect to
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Connect and handshake timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

impl ProbeRequest {
    /// Create a request without an explicit timeout
    ///
    /// ```
    /// # use certprobe::ProbeRequest;
    /// let request = ProbeRequest::new("sslping.com", "195.154.227.44", 443);
    /// assert_eq!(None, request.timeout);
    /// ```
    pub fn new<T, U>(hostname: T, host: U, port: u16) -> Self
    where
        T: Into<String>,
        U: Into<String>,
    {
        ProbeRequest {
            hostname: hostname.into(),
            host: host.into(),
            port,
            timeout: None,
        }
    }

    /// Same request with a timeout in seconds
    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Timeout of this request, or `default` when absent or not positive
    ///
    /// ```
    /// # use certprobe::ProbeRequest;
    /// use std::time::Duration;
    /// let default = Duration::from_secs(10);
    /// let request = ProbeRequest::new("a.com", "127.0.0.1", 443);
    /// assert_eq!(default, request.timeout_or(default));
    /// assert_eq!(default, request.clone().with_timeout(-1).timeout_or(default));
    /// assert_eq!(Duration::from_secs(2), request.with_timeout(2).timeout_or(default));
    /// ```
    pub fn timeout_or(&self, default: Duration) -> Duration {
        match self.timeout {
            Some(seconds) if seconds > 0 => Duration::from_secs(seconds.unsigned_abs()),
            _ => default,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn t_deserialize() {
        let json = r#"{"hostname":"sslping.com","host":"195.154.227.44","port":443,"timeout":2}"#;
        let request: ProbeRequest = serde_json::from_str(json).unwrap();
        assert_eq!("sslping.com", request.hostname);
        assert_eq!("195.154.227.44", request.host);
        assert_eq!(443, request.port);
        assert_eq!(Some(2), request.timeout);
    }

    #[test]
    fn t_deserialize_missing_fields() {
        let request: ProbeRequest = serde_json::from_str(r#"{"hostname":"a.com"}"#).unwrap();
        assert_eq!("a.com", request.hostname);
        assert_eq!("", request.host);
        assert_eq!(0, request.port);
        assert_eq!(None, request.timeout);
    }

    #[test]
    fn t_zero_timeout_falls_back() {
        let default = Duration::from_secs(15);
        let request = ProbeRequest::new("a.com", "127.0.0.1", 443).with_timeout(0);
        assert_eq!(default, request.timeout_or(default));
    }
}
