//! Bearer token sources for the channels.
//!
//! Channels never store tokens; they ask a [`CredentialProvider`] on every
//! `connect()`. Providers:
//!
//! - [`StaticCredentials`]: a fixed token (tests, embedding apps).
//! - [`EnvCredentials`]: `CHATWIRE_TOKEN`.
//! - [`KeyringCredentials`]: OS keychain entry `chatwire/<account>`.
//! - [`CredentialChain`]: first provider that yields a token wins.
//!
//! # Graceful Degradation
//!
//! Channels treat a provider error the same as "no token" (see
//! [`resolve_token`]): it is logged, and the connect attempt is skipped or
//! reported according to the channel's rules.

use std::sync::Arc;

use async_trait::async_trait;

/// Environment variable read by [`EnvCredentials`].
pub const TOKEN_ENV_VAR: &str = "CHATWIRE_TOKEN";

/// Keyring service name.
const KEYRING_SERVICE: &str = "chatwire";
/// Default keyring account.
const KEYRING_DEFAULT_ACCOUNT: &str = "default";

/// Errors from a credential source.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The OS keychain refused or failed the lookup.
    #[error("keyring error: {0}")]
    Keyring(String),
    /// The lookup task did not complete.
    #[error("credential lookup aborted: {0}")]
    Aborted(String),
}

/// Source of the bearer token used to authenticate a connection.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current token, or `None` if the user is signed out.
    async fn get_token(&self) -> Result<Option<String>, CredentialError>;
}

/// Ask `provider` for a token, folding errors and empty tokens into `None`.
pub async fn resolve_token(provider: &dyn CredentialProvider) -> Option<String> {
    match provider.get_token().await {
        Ok(Some(token)) if !token.is_empty() => Some(token),
        Ok(_) => None,
        Err(e) => {
            log::warn!("Credential lookup failed, treating as signed out: {}", e);
            None
        }
    }
}

/// A fixed token.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    /// Provider that always returns `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Provider that never has a token.
    #[must_use]
    pub fn none() -> Self {
        Self { token: None }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_token(&self) -> Result<Option<String>, CredentialError> {
        Ok(self.token.clone())
    }
}

/// Token from an environment variable (default `CHATWIRE_TOKEN`).
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    var: String,
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new(TOKEN_ENV_VAR)
    }
}

impl EnvCredentials {
    /// Read the token from `var`.
    #[must_use]
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn get_token(&self) -> Result<Option<String>, CredentialError> {
        Ok(std::env::var(&self.var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()))
    }
}

/// Token stored in the OS keychain.
#[derive(Debug, Clone)]
pub struct KeyringCredentials {
    account: String,
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self::new(KEYRING_DEFAULT_ACCOUNT)
    }
}

impl KeyringCredentials {
    /// Use the keychain entry `chatwire/<account>`.
    #[must_use]
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(KEYRING_SERVICE, &self.account)
            .map_err(|e| CredentialError::Keyring(e.to_string()))
    }

    /// Store `token`, replacing any previous one.
    pub fn store(&self, token: &str) -> Result<(), CredentialError> {
        self.entry()?
            .set_password(token)
            .map_err(|e| CredentialError::Keyring(e.to_string()))?;
        log::info!("Saved token to keyring entry '{}/{}'", KEYRING_SERVICE, self.account);
        Ok(())
    }

    /// Remove the stored token. A missing entry is not an error.
    pub fn clear(&self) -> Result<(), CredentialError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialError::Keyring(e.to_string())),
        }
    }

    fn load_blocking(&self) -> Result<Option<String>, CredentialError> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CredentialError::Keyring(e.to_string())),
        }
    }
}

#[async_trait]
impl CredentialProvider for KeyringCredentials {
    async fn get_token(&self) -> Result<Option<String>, CredentialError> {
        // Keychain access can block on a user prompt.
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.load_blocking())
            .await
            .map_err(|e| CredentialError::Aborted(e.to_string()))?
    }
}

/// Try providers in order; the first non-empty token wins.
///
/// A failing provider is logged and skipped.
#[derive(Clone, Default)]
pub struct CredentialChain {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl std::fmt::Debug for CredentialChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialChain")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl CredentialChain {
    /// Empty chain (never yields a token).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider.
    #[must_use]
    pub fn with(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }
}

#[async_trait]
impl CredentialProvider for CredentialChain {
    async fn get_token(&self) -> Result<Option<String>, CredentialError> {
        for provider in &self.providers {
            match provider.get_token().await {
                Ok(Some(token)) if !token.is_empty() => return Ok(Some(token)),
                Ok(_) => {}
                Err(e) => log::debug!("Credential provider failed, trying next: {}", e),
            }
        }
        Ok(None)
    }
}
