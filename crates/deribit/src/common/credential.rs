//! Deribit API credential storage.
//!
//! Deribit authenticates WebSocket sessions through OAuth-style
//! `client_credentials` grants, so no request signing is involved; the
//! credential only has to hold the key pair and keep the secret out of logs.
//! Secrets are zeroized on drop.

use std::fmt::Debug;

use ustr::Ustr;
use zeroize::ZeroizeOnDrop;

use crate::websocket::error::DeribitWsError;

/// Deribit API credentials for `public/auth` client-credential grants.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Credential {
    #[zeroize(skip)]
    pub client_id: Ustr,
    client_secret: Box<str>,
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(Credential))
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// Creates a new [`Credential`] instance.
    #[must_use]
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into_boxed_str(),
        }
    }

    /// Builds a credential from optional key material.
    ///
    /// `api_key` and `client_id` are accepted interchangeably; `api_key` wins
    /// when both are supplied.
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::MissingApiKey`] or
    /// [`DeribitWsError::MissingApiSecret`] when the respective field is
    /// absent.
    pub fn from_parts(
        api_key: Option<String>,
        client_id: Option<String>,
        secret: Option<String>,
    ) -> Result<Self, DeribitWsError> {
        let key = api_key.or(client_id).ok_or(DeribitWsError::MissingApiKey)?;
        let secret = secret.ok_or(DeribitWsError::MissingApiSecret)?;
        Ok(Self::new(key, secret))
    }

    /// Returns the secret for grant payload construction.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.client_secret
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
