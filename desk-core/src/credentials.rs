//! API credential handling
//!
//! Credentials are owned by the caller (decrypted per logical connection by
//! the credential provider) and passed by reference into each signed call.
//! They are never logged and never cached beyond request scope.

/// API key pair for a single exchange connection
#[derive(Clone)]
pub struct ExchangeCredential {
    pub api_key: String,
    pub api_secret: String,
}

impl ExchangeCredential {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }
}

impl std::fmt::Debug for ExchangeCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCredential")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_secrets() {
        let cred = ExchangeCredential::new("key-id", "super-secret");
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("key-id"));
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
