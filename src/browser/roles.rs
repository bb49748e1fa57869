use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::ListingBrowser;
use crate::cli::config::{AccountSettings, Credentials};

/// Identity currently held by the remote session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Unauthenticated,
    /// Account used to search
    Browsing,
    /// Account used to submit applications
    Applying,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionRole::Unauthenticated => "unauthenticated",
            SessionRole::Browsing => "browse",
            SessionRole::Applying => "apply",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no credentials configured for the {role} role")]
    MissingCredentials { role: SessionRole },

    #[error("login as {role} failed: {source:#}")]
    LoginFailed {
        role: SessionRole,
        #[source]
        source: anyhow::Error,
    },
}

/// Switches the browser between accounts, logging in only when the held
/// role differs from the one requested.
#[derive(Debug)]
pub struct SessionManager {
    current: SessionRole,
    accounts: AccountSettings,
}

impl SessionManager {
    pub fn new(accounts: AccountSettings) -> Self {
        Self {
            current: SessionRole::Unauthenticated,
            accounts,
        }
    }

    pub fn current(&self) -> SessionRole {
        self.current
    }

    fn credentials(&self, role: SessionRole) -> Option<&Credentials> {
        match role {
            SessionRole::Unauthenticated => None,
            SessionRole::Browsing => Some(&self.accounts.browse),
            SessionRole::Applying => Some(&self.accounts.apply),
        }
    }

    pub async fn ensure_role(
        &mut self,
        browser: &mut dyn ListingBrowser,
        target: SessionRole,
    ) -> Result<(), SessionError> {
        if self.current == target {
            return Ok(());
        }

        if let Err(e) = browser.clear_session().await {
            debug!("Clearing session state failed: {:#}", e);
        }
        self.current = SessionRole::Unauthenticated;

        let Some(credentials) = self.credentials(target) else {
            return Ok(());
        };
        if !credentials.is_complete() {
            warn!(role = %target, "No credentials configured");
            return Err(SessionError::MissingCredentials { role: target });
        }

        let credentials = credentials.clone();
        match browser.login(&credentials).await {
            Ok(()) => {
                info!(role = %target, "Logged in");
                self.current = target;
                Ok(())
            }
            Err(source) => {
                warn!(role = %target, "Login failed: {:#}", source);
                Err(SessionError::LoginFailed { role: target, source })
            }
        }
    }
}
