// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;

use thiserror::Error;

pub use config::SdkEndpoint;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential secret is missing `{0}`")]
    Missing(&'static str),

    #[error("`insecureSkipVerify` must be a boolean, got `{0}`")]
    BadBool(String),
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    /// SHA-1 fingerprint of the endpoint certificate, colon separated hex
    pub thumbprint: Option<String>,
    pub insecure_skip_verify: bool,
    /// PEM bundle trusted in addition to the system roots
    pub cacert: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("thumbprint", &self.thumbprint)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("cacert", &self.cacert.as_ref().map(|_| "<pem>"))
            .finish()
    }
}

fn parse_bool(v: &str) -> Result<bool, CredentialError> {
    match v.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(CredentialError::BadBool(other.to_owned())),
    }
}

impl Credentials {
    /// Reads the `user`, `password`, `thumbprint`, `insecureSkipVerify` and `cacert` keys
    pub fn from_secret(secret: &BTreeMap<String, String>) -> Result<Self, CredentialError> {
        let non_empty = |k: &str| secret.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());

        let user = non_empty("user").ok_or(CredentialError::Missing("user"))?;
        let password = secret
            .get("password")
            .ok_or(CredentialError::Missing("password"))?;

        let insecure_skip_verify = match non_empty("insecureSkipVerify") {
            Some(v) => parse_bool(v)?,
            None => false,
        };

        Ok(Self {
            user: user.to_owned(),
            password: password.clone(),
            thumbprint: non_empty("thumbprint").map(str::to_owned),
            insecure_skip_verify,
            cacert: non_empty("cacert").map(str::to_owned),
        })
    }

    /// The inverse of [`Credentials::from_secret`], as stored on the destination
    pub fn to_secret(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert("user".to_owned(), self.user.clone());
        out.insert("password".to_owned(), self.password.clone());
        out.insert(
            "insecureSkipVerify".to_owned(),
            self.insecure_skip_verify.to_string(),
        );
        if let Some(t) = &self.thumbprint {
            out.insert("thumbprint".to_owned(), t.clone());
        }
        if let Some(c) = &self.cacert {
            out.insert("cacert".to_owned(), c.clone());
        }
        out
    }
}

/// A vSphere source endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Provider {
    pub name: String,
    pub url: String,
    pub sdk_endpoint: SdkEndpoint,
    pub credentials: Credentials,
    pub vddk_image: Option<String>,
}

impl Provider {
    pub fn from_settings(
        cfg: &config::ProviderConfig,
        secret: &BTreeMap<String, String>,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            name: cfg.name.clone(),
            url: cfg.url.clone(),
            sdk_endpoint: cfg.sdk_endpoint,
            credentials: Credentials::from_secret(secret)?,
            vddk_image: cfg.vddk_image.clone(),
        })
    }

    pub fn is_esxi(&self) -> bool {
        self.sdk_endpoint == SdkEndpoint::Esxi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_full_secret() {
        let c = Credentials::from_secret(&secret(&[
            ("user", "administrator@vsphere.local"),
            ("password", "hunter2"),
            ("thumbprint", "AA:BB"),
            ("insecureSkipVerify", "False"),
        ]))
        .unwrap();

        assert_eq!(c.user, "administrator@vsphere.local");
        assert_eq!(c.thumbprint.as_deref(), Some("AA:BB"));
        assert!(!c.insecure_skip_verify);
        assert!(c.cacert.is_none());
        assert!(!format!("{c:?}").contains("hunter2"));
    }

    #[test]
    fn missing_user_and_bad_bool_are_rejected() {
        assert_eq!(
            Credentials::from_secret(&secret(&[("password", "x")])),
            Err(CredentialError::Missing("user"))
        );
        assert_eq!(
            Credentials::from_secret(&secret(&[
                ("user", "u"),
                ("password", "p"),
                ("insecureSkipVerify", "yes")
            ])),
            Err(CredentialError::BadBool("yes".to_owned()))
        );
    }

    #[test]
    fn secret_round_trips() {
        let c = Credentials {
            user: "u".into(),
            password: "p".into(),
            thumbprint: Some("T".into()),
            insecure_skip_verify: true,
            cacert: None,
        };
        assert_eq!(Credentials::from_secret(&c.to_secret()).unwrap(), c);
    }
}
