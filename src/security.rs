//! Security providers
//!
//! The set of authentication mechanisms the servers advertise. It is built
//! once per process by `SecurityProviders::install()` and handed to the
//! components that need it.

use std::sync::{Arc, OnceLock};

static INSTALLED: OnceLock<Arc<SecurityProviders>> = OnceLock::new();

/// Authentication mechanisms offered by this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityProviders {
    sasl: Vec<String>,
    http: Vec<String>,
}

impl SecurityProviders {
    /// Install the built-in providers; later calls return the same instance
    pub fn install() -> Arc<Self> {
        Arc::clone(INSTALLED.get_or_init(|| {
            let providers = Self::builtin();
            tracing::debug!(
                "Installed security providers: sasl={:?} http={:?}",
                providers.sasl,
                providers.http
            );
            Arc::new(providers)
        }))
    }

    /// Whether `install` has run in this process
    pub fn is_installed() -> bool {
        INSTALLED.get().is_some()
    }

    /// A custom provider set, independent of the installed one
    pub fn new<S: Into<String>>(
        sasl: impl IntoIterator<Item = S>,
        http: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            sasl: sasl.into_iter().map(Into::into).collect(),
            http: http.into_iter().map(Into::into).collect(),
        }
    }

    fn builtin() -> Self {
        Self::new(
            ["SCRAM-SHA-512", "SCRAM-SHA-256", "DIGEST-MD5", "PLAIN"],
            ["BASIC", "DIGEST"],
        )
    }

    /// SASL mechanism names, in preference order
    pub fn sasl_mechanisms(&self) -> &[String] {
        &self.sasl
    }

    /// HTTP authentication scheme names
    pub fn http_mechanisms(&self) -> &[String] {
        &self.http
    }
}
