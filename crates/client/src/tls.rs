// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Certificate handling for SDK endpoints.
//!
//! The endpoint certificate is either ignored, pinned by its SHA-1
//! thumbprint, or verified against the system roots plus an optional
//! provider supplied CA bundle. In the last two cases a one-shot handshake
//! is made up front so the fingerprint can be checked or recorded.

use std::time::Duration;

use models::provider::Credentials;
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tracing::{debug, info};
use url::Url;

use crate::error::SdkError;

/// SHA-1 of a DER certificate as uppercase colon separated hex
pub fn thumbprint_of(der: &[u8]) -> String {
    let hex = base16ct::upper::encode_string(&Sha1::digest(der));

    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Compares thumbprints ignoring case and surrounding whitespace
pub fn same_thumbprint(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    Insecure,
    Pinned(String),
    Verified { cacert: Option<String> },
}

impl TlsMode {
    pub fn from_credentials(credentials: &Credentials) -> Self {
        if credentials.insecure_skip_verify {
            return Self::Insecure;
        }

        match &credentials.thumbprint {
            Some(t) => Self::Pinned(t.clone()),
            None => Self::Verified {
                cacert: credentials.cacert.clone(),
            },
        }
    }
}

/// What the HTTP client needs to talk to an endpoint that passed [`prepare`]
#[derive(Debug, Clone, Default)]
pub struct TlsPlan {
    pub accept_invalid: bool,
    pub cacert: Option<String>,
    /// Fingerprint observed during the up front handshake
    pub fingerprint: Option<String>,
}

impl TlsPlan {
    pub fn apply(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, SdkError> {
        if self.accept_invalid {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }

        if let Some(pem) = &self.cacert {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| SdkError::Configuration(format!("bad cacert: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(builder)
    }
}

fn host_port(url: &Url) -> Result<(String, u16), SdkError> {
    let host = url
        .host_str()
        .ok_or_else(|| SdkError::Configuration(format!("url {url} has no host")))?;
    let port = url.port_or_known_default().unwrap_or(443);

    Ok((host.to_owned(), port))
}

/// Connects once and returns the peer's leaf certificate thumbprint
pub async fn peer_thumbprint(
    url: &Url,
    accept_invalid: bool,
    cacert: Option<&str>,
    timeout: Duration,
) -> Result<String, SdkError> {
    let (host, port) = host_port(url)?;

    let mut builder = native_tls::TlsConnector::builder();
    if accept_invalid {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    if let Some(pem) = cacert {
        let cert = native_tls::Certificate::from_pem(pem.as_bytes())
            .map_err(|e| SdkError::Configuration(format!("bad cacert: {e}")))?;
        builder.add_root_certificate(cert);
    }
    let connector = tokio_native_tls::TlsConnector::from(
        builder
            .build()
            .map_err(|e| SdkError::Configuration(e.to_string()))?,
    );

    let handshake = async {
        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| SdkError::Transport(format!("connect to {host}:{port}: {e}")))?;

        connector.connect(&host, tcp).await.map_err(|e| {
            if accept_invalid {
                SdkError::Transport(format!("TLS handshake with {host}: {e}"))
            } else {
                SdkError::Configuration(format!("certificate of {host} not trusted: {e}"))
            }
        })
    };

    let stream = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| SdkError::Timeout(timeout))??;

    let der = stream
        .get_ref()
        .peer_certificate()
        .map_err(|e| SdkError::Transport(e.to_string()))?
        .ok_or_else(|| SdkError::Configuration(format!("{host} presented no certificate")))?
        .to_der()
        .map_err(|e| SdkError::Transport(e.to_string()))?;

    Ok(thumbprint_of(&der))
}

/// Runs the handshake `mode` calls for
pub async fn prepare(url: &Url, mode: &TlsMode, timeout: Duration) -> Result<TlsPlan, SdkError> {
    match mode {
        TlsMode::Insecure => {
            debug!("Skipping certificate verification for {url}");
            Ok(TlsPlan {
                accept_invalid: true,
                ..Default::default()
            })
        }
        TlsMode::Pinned(expected) => {
            let seen = peer_thumbprint(url, true, None, timeout).await?;
            if !same_thumbprint(&seen, expected) {
                return Err(SdkError::Configuration(format!(
                    "certificate thumbprint mismatch for {url}: expected {expected}, got {seen}"
                )));
            }

            Ok(TlsPlan {
                accept_invalid: true,
                cacert: None,
                fingerprint: Some(seen),
            })
        }
        TlsMode::Verified { cacert } => {
            let seen = peer_thumbprint(url, false, cacert.as_deref(), timeout).await?;
            info!("Verified certificate for {url}, fingerprint {seen}");

            Ok(TlsPlan {
                accept_invalid: false,
                cacert: cacert.clone(),
                fingerprint: Some(seen),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbprint_format() {
        assert_eq!(
            thumbprint_of(b"abc"),
            "A9:99:3E:36:47:06:81:6A:BA:3E:25:71:78:50:C2:6C:9C:D0:D8:9D"
        );
    }

    #[test]
    fn thumbprints_compare_case_insensitively() {
        assert!(same_thumbprint(" a9:99:3e ", "A9:99:3E"));
        assert!(!same_thumbprint("A9:99:3E", "A9:99:3F"));
    }

    #[test]
    fn insecure_wins_over_thumbprint() {
        let mut c = Credentials {
            user: "u".into(),
            password: "p".into(),
            thumbprint: Some("AA".into()),
            insecure_skip_verify: true,
            cacert: None,
        };
        assert_eq!(TlsMode::from_credentials(&c), TlsMode::Insecure);

        c.insecure_skip_verify = false;
        assert_eq!(TlsMode::from_credentials(&c), TlsMode::Pinned("AA".into()));

        c.thumbprint = None;
        assert_eq!(
            TlsMode::from_credentials(&c),
            TlsMode::Verified { cacert: None }
        );
    }
}
