//! Server side of the credential handshake.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;

use crate::{
    creds::{self, UserClaims},
    error::{Error, Result},
    proto::ConnectInfo,
};

const NONCE_LEN: usize = 16;

/// How the broker authenticates connecting clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthPolicy {
    /// anyone may connect
    #[default]
    None,
    /// clients must present a user JWT and sign the nonce with its key.
    /// An empty issuer list accepts any account whose signature checks out.
    Jwt { trusted_issuers: Vec<String> },
}

impl AuthPolicy {
    pub fn required(&self) -> bool {
        !matches!(self, AuthPolicy::None)
    }

    /// Fresh challenge for one connection.
    pub fn nonce(&self) -> Option<String> {
        self.required().then(|| {
            let mut raw = [0u8; NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut raw);
            URL_SAFE_NO_PAD.encode(raw)
        })
    }

    /// Check a connect request against the nonce handed out for it.
    pub fn authorize(
        &self,
        connect: &ConnectInfo,
        nonce: Option<&str>,
    ) -> Result<Option<UserClaims>> {
        let AuthPolicy::Jwt { trusted_issuers } = self else {
            return Ok(None);
        };
        let jwt = connect
            .jwt
            .as_deref()
            .ok_or_else(|| Error::Auth("user JWT required".into()))?;
        let sig = connect
            .sig
            .as_deref()
            .ok_or_else(|| Error::Auth("nonce signature required".into()))?;
        let nonce = nonce.ok_or_else(|| Error::Auth("no nonce issued".into()))?;

        let claims = creds::verify_jwt(jwt)?;
        if !trusted_issuers.is_empty() && !trusted_issuers.contains(&claims.iss) {
            return Err(Error::Auth(format!(
                "issuer {} is not trusted",
                claims.iss
            )));
        }
        creds::verify_challenge(&claims, nonce.as_bytes(), sig)?;
        Ok(Some(claims))
    }
}
