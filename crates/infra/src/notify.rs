//! Welcome-email notification.
//!
//! Notification is best effort: a sign-up commits whether or not the email
//! goes out, and failures are logged rather than surfaced to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use coffer_core::AccountId;

/// Well-known secret name for the mail provider's API key.
pub const NOTIFIER_CREDENTIAL_SECRET: &str = "mailgun-api-key";

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Missing or rejected credentials.
    #[error("notifier authentication failed: {0}")]
    Auth(String),

    /// Provider or network trouble; the send may be retried.
    #[error("notifier transient failure: {0}")]
    Transient(String),
}

/// A secret value. Debug never reveals the contents.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for Secret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Read access to named secrets.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Option<Secret>;
}

impl<S> SecretStore for Arc<S>
where
    S: SecretStore + ?Sized,
{
    fn get(&self, name: &str) -> Option<Secret> {
        (**self).get(name)
    }
}

/// In-memory secret store seeded at startup.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, Secret>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, secret: Secret) {
        self.secrets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), secret);
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, name: &str) -> Option<Secret> {
        self.secrets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

/// Mail provider settings.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub sender: String,
    pub domain: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            sender: "bank@example.com".to_string(),
            domain: "example.com".to_string(),
        }
    }
}

/// The welcome message sent after a successful sign-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeEmail {
    pub account_id: AccountId,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

impl WelcomeEmail {
    pub fn for_account(account_id: AccountId) -> Self {
        let subject = "Welcome!".to_string();
        let text_body = format!("Hello {account_id}, your account is ready.");
        let html_body = format!("<p>Hello <b>{account_id}</b>, your account is ready.</p>");
        Self { account_id, subject, html_body, text_body }
    }
}

/// Outbound notification channel.
pub trait Notifier: Send + Sync {
    fn send_welcome(&self, email: &WelcomeEmail) -> Result<(), NotifyError>;
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn send_welcome(&self, email: &WelcomeEmail) -> Result<(), NotifyError> {
        (**self).send_welcome(email)
    }
}

/// Notifier that records every send (tests; local runs).
///
/// Authenticates against the secret store the way a real provider client
/// would, so a missing API key surfaces as [`NotifyError::Auth`].
pub struct RecordingNotifier<S> {
    secrets: S,
    config: NotifierConfig,
    sent: Mutex<Vec<WelcomeEmail>>,
}

impl<S> RecordingNotifier<S> {
    pub fn new(secrets: S, config: NotifierConfig) -> Self {
        Self {
            secrets,
            config,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<WelcomeEmail> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl<S> Notifier for RecordingNotifier<S>
where
    S: SecretStore,
{
    fn send_welcome(&self, email: &WelcomeEmail) -> Result<(), NotifyError> {
        let key = self.secrets.get(NOTIFIER_CREDENTIAL_SECRET).ok_or_else(|| {
            NotifyError::Auth(format!("secret {NOTIFIER_CREDENTIAL_SECRET} not set"))
        })?;
        if key.expose().is_empty() {
            return Err(NotifyError::Auth(format!(
                "empty API key for domain {}",
                self.config.domain
            )));
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(email.clone());
        Ok(())
    }
}

/// Notifier that always fails (tests the best-effort path).
#[derive(Debug, Default)]
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn send_welcome(&self, _email: &WelcomeEmail) -> Result<(), NotifyError> {
        Err(NotifyError::Transient("provider unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
    }

    #[test]
    fn missing_api_key_is_an_auth_error() {
        let notifier = RecordingNotifier::new(
            Arc::new(InMemorySecretStore::new()),
            NotifierConfig::default(),
        );
        let email = WelcomeEmail::for_account(AccountId::new("alice").unwrap());

        let err = notifier.send_welcome(&email).unwrap_err();
        assert!(matches!(err, NotifyError::Auth(_)));
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn send_records_the_email() {
        let secrets = Arc::new(InMemorySecretStore::new());
        secrets.insert(NOTIFIER_CREDENTIAL_SECRET, Secret::new("key-123"));
        let notifier = RecordingNotifier::new(secrets, NotifierConfig::default());

        let email = WelcomeEmail::for_account(AccountId::new("alice").unwrap());
        notifier.send_welcome(&email).unwrap();

        assert_eq!(notifier.sent(), vec![email]);
    }
}
