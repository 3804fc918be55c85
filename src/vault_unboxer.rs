//! Unboxing of `VAULT[...]` environment values against an external
//! credential store.
//!
//! A boxed value carries the path read from the store and a selector into
//! the returned secret document. The client is created lazily, only when
//! the task environment actually contains boxed values.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::environment::Environment;
use crate::errors::{Error, Result};

pub const ENV_VAULT_URL: &str = "CIRRUS_VAULT_URL";
pub const ENV_VAULT_NAMESPACE: &str = "CIRRUS_VAULT_NAMESPACE";
pub const ENV_VAULT_ROLE: &str = "CIRRUS_VAULT_ROLE";
pub const ENV_OIDC_TOKEN: &str = "CIRRUS_OIDC_TOKEN";

lazy_static! {
    // VAULT[path selector] or VAULT[path#selector]
    static ref BOXED_VALUE_REGEX: Regex = Regex::new(r"^VAULT\[(.*)\]$").unwrap();
}

/// A parsed reference into the credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxedValue {
    vault_path: String,
    selector: String,
}

impl BoxedValue {
    /// `Ok(None)` is the definitive "not a boxed value" signal; `Err` means
    /// the value looks boxed but is malformed.
    pub fn parse(value: &str) -> Result<Option<BoxedValue>> {
        if !value.starts_with("VAULT[") {
            return Ok(None);
        }

        let captures = BOXED_VALUE_REGEX.captures(value).ok_or_else(|| {
            Error::secret_resolution(value, "missing closing bracket")
        })?;
        let inner = captures.get(1).map(|m| m.as_str()).unwrap_or_default();

        let tokens: Vec<&str> = inner.split_whitespace().collect();
        let (vault_path, selector) = match tokens.as_slice() {
            [single] => match single.rsplit_once('#') {
                Some((path, selector)) => (path, selector),
                None => {
                    return Err(Error::secret_resolution(
                        value,
                        "expected a path and a selector",
                    ));
                }
            },
            [path, selector] => (*path, *selector),
            _ => {
                return Err(Error::secret_resolution(
                    value,
                    "expected a path and a selector",
                ));
            }
        };

        if vault_path.is_empty() || selector.is_empty() {
            return Err(Error::secret_resolution(
                value,
                "path and selector must be non-empty",
            ));
        }

        Ok(Some(BoxedValue {
            vault_path: vault_path.to_string(),
            selector: selector.to_string(),
        }))
    }

    pub fn vault_path(&self) -> &str {
        &self.vault_path
    }

    /// Apply the dotted selector to a secret document. KV version 2 wraps
    /// the payload in a second `data` object; fall back into it when the
    /// top-level lookup misses.
    pub fn select(&self, data: &Value) -> Result<String> {
        if let Some(value) = Self::navigate(data, &self.selector) {
            return Ok(value);
        }
        if let Some(nested) = data.get("data") {
            if let Some(value) = Self::navigate(nested, &self.selector) {
                return Ok(value);
            }
        }
        Err(Error::secret_resolution(
            &self.selector,
            "selector did not match any field of the secret",
        ))
    }

    fn navigate(data: &Value, selector: &str) -> Option<String> {
        let mut current = data;
        for segment in selector.split('.') {
            current = current.get(segment)?;
        }
        match current {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

pub struct VaultUnboxer {
    http: reqwest::Client,
    address: String,
    namespace: Option<String>,
    token: Option<String>,
}

impl VaultUnboxer {
    /// Build a client from `CIRRUS_VAULT_*` variables, authenticating via
    /// JWT when `CIRRUS_OIDC_TOKEN` is present.
    pub async fn from_environment(env: &Environment) -> Result<Self> {
        let address = env.lookup(ENV_VAULT_URL).ok_or_else(|| {
            Error::secret_resolution(
                ENV_VAULT_URL,
                format!(
                    "found Vault-protected environment variables, \
                     but no {ENV_VAULT_URL} variable was provided"
                ),
            )
        })?;
        let address = address.trim_end_matches('/').to_string();

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let mut unboxer = Self {
            http,
            address,
            namespace: env.lookup(ENV_VAULT_NAMESPACE),
            token: None,
        };

        if let Some(jwt) = env.lookup(ENV_OIDC_TOKEN) {
            unboxer.login_via_jwt(&jwt, &env.get(ENV_VAULT_ROLE)).await?;
        }

        Ok(unboxer)
    }

    async fn login_via_jwt(&mut self, jwt: &str, role: &str) -> Result<()> {
        let url = format!("{}/v1/auth/jwt/login", self.address);
        let mut request = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "jwt": jwt, "role": role }));
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::secret_resolution(
                &url,
                format!("JWT authentication failed with status {}", response.status()),
            ));
        }

        let body: LoginResponse = response.json().await.map_err(|e| {
            Error::secret_resolution(&url, format!("login response carried no client token: {e}"))
        })?;
        self.token = Some(body.auth.client_token);

        Ok(())
    }

    /// Read the secret at the boxed path and extract the selected field.
    pub async fn unbox(&self, boxed: &BoxedValue) -> Result<String> {
        let url = format!("{}/v1/{}", self.address, boxed.vault_path());
        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.header("X-Vault-Token", token);
        }
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::secret_resolution(
                boxed.vault_path(),
                format!("secret read failed with status {}", response.status()),
            ));
        }

        let body: Value = response.json().await?;
        boxed.select(body.get("data").unwrap_or(&Value::Null))
    }
}
