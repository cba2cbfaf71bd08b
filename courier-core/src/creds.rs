//! Credential handshake: NKey seed + user JWT.
//!
//! A credentials bundle is a text blob with a JWT block and a seed block:
//!
//! ```text
//! -----BEGIN NATS USER JWT-----
//! eyJ0eXAiOiJKV1QiLCJhbGciOiJlZDI1NTE5LW5rZXkifQ...
//! ------END NATS USER JWT------
//!
//! -----BEGIN USER NKEY SEED-----
//! SUAM...
//! ------END USER NKEY SEED------
//! ```
//!
//! On connect the server hands out a nonce; we sign it with the seed and send
//! the signature along with the JWT. The seed never leaves the process.

use std::{fmt, path::Path};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use nkeys::KeyPair;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

const JWT_BLOCK: &str = "NATS USER JWT";
const SEED_BLOCK: &str = "USER NKEY SEED";
const JWT_ALG: &str = "ed25519-nkey";

/// Publish/subscribe allow and deny lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

/// The `nats` section of a user JWT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPermissions {
    #[serde(default, rename = "pub")]
    pub publish: Permission,
    #[serde(default, rename = "sub")]
    pub subscribe: Permission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_account: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Identity claims carried by a user JWT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaims {
    #[serde(default)]
    pub jti: String,
    #[serde(default)]
    pub iat: i64,
    /// issuing account public key
    pub iss: String,
    #[serde(default)]
    pub name: String,
    /// user public key
    pub sub: String,
    #[serde(default)]
    pub nats: UserPermissions,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
    typ: String,
    alg: String,
}

/// Loaded credentials. Immutable once built.
#[derive(Clone)]
pub struct Credentials {
    key_pair: std::sync::Arc<KeyPair>,
    jwt: String,
    claims: UserClaims,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print the seed
        f.debug_struct("Credentials")
            .field("user", &self.claims.sub)
            .field("account", &self.claims.iss)
            .field("name", &self.claims.name)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Parse a credentials bundle.
    pub fn parse(bundle: &str) -> Result<Self> {
        let jwt = extract_block(bundle, JWT_BLOCK)
            .ok_or_else(|| Error::Parse("missing NATS USER JWT block".into()))?;
        let seed = extract_block(bundle, SEED_BLOCK)
            .ok_or_else(|| Error::Parse("missing USER NKEY SEED block".into()))?;
        Self::from_seed_and_jwt(&seed, &jwt)
    }

    /// Read and parse a credentials file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bundle = std::fs::read_to_string(path).map_err(|e| {
            Error::Parse(format!(
                "failed to read credentials file '{}': {e}",
                path.display()
            ))
        })?;
        let creds = Self::parse(&bundle)?;
        debug!(path = %path.display(), user = %creds.claims.sub, "loaded credentials");
        Ok(creds)
    }

    /// Build credentials from a raw seed and JWT.
    pub fn from_seed_and_jwt(seed: &str, jwt: &str) -> Result<Self> {
        let key_pair = KeyPair::from_seed(seed.trim())
            .map_err(|e| Error::Parse(format!("invalid nkey seed: {e}")))?;
        let jwt = jwt.trim().to_owned();
        let claims = decode_claims(&jwt)?;
        if claims.sub != key_pair.public_key() {
            return Err(Error::Parse(
                "seed public key does not match JWT subject".into(),
            ));
        }
        Ok(Self {
            key_pair: std::sync::Arc::new(key_pair),
            jwt,
            claims,
        })
    }

    pub fn jwt(&self) -> &str {
        &self.jwt
    }

    pub fn claims(&self) -> &UserClaims {
        &self.claims
    }

    /// user public key
    pub fn public_key(&self) -> String {
        self.key_pair.public_key()
    }

    /// Sign a server-issued nonce. Returns the base64url signature.
    pub fn sign_challenge(&self, nonce: &[u8]) -> Result<String> {
        let sig = self
            .key_pair
            .sign(nonce)
            .map_err(|e| Error::Auth(format!("failed to sign nonce: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(sig))
    }
}

/// Pull the body of a `-----BEGIN <name>-----` block out of a bundle.
/// End markers may use any number of dashes.
fn extract_block(bundle: &str, name: &str) -> Option<String> {
    let mut lines = bundle.lines().map(str::trim);
    lines.find(|l| l.starts_with("---") && l.contains("BEGIN") && l.contains(name))?;

    let mut body = String::new();
    for line in lines {
        if line.starts_with("---") && line.contains("END") {
            return (!body.is_empty()).then_some(body);
        }
        body.push_str(line);
    }
    None
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str, what: &str) -> Result<T> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| Error::Parse(format!("JWT {what} is not base64url: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| Error::Parse(format!("JWT {what} is not valid: {e}")))
}

/// Decode the claims of a JWT without checking its signature.
pub fn decode_claims(jwt: &str) -> Result<UserClaims> {
    let mut parts = jwt.split('.');
    let (Some(header), Some(claims), Some(_sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Parse("JWT must have three segments".into()));
    };
    let header: JwtHeader = decode_segment(header, "header")?;
    if header.alg != JWT_ALG {
        return Err(Error::Parse(format!(
            "unsupported JWT algorithm '{}'",
            header.alg
        )));
    }
    decode_segment(claims, "claims")
}

/// Decode a JWT and check that it was signed by the account in `iss`.
pub fn verify_jwt(jwt: &str) -> Result<UserClaims> {
    let claims = decode_claims(jwt).map_err(|e| Error::Auth(e.to_string()))?;
    let (signed, sig) = jwt
        .rsplit_once('.')
        .ok_or_else(|| Error::Auth("malformed JWT".into()))?;
    let sig = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|e| Error::Auth(format!("JWT signature is not base64url: {e}")))?;
    let issuer = KeyPair::from_public_key(&claims.iss)
        .map_err(|e| Error::Auth(format!("invalid JWT issuer: {e}")))?;
    issuer
        .verify(signed.as_bytes(), &sig)
        .map_err(|_| Error::Auth("JWT signature does not match issuer".into()))?;
    Ok(claims)
}

/// Check a nonce signature against the user public key in the JWT subject.
pub fn verify_challenge(claims: &UserClaims, nonce: &[u8], signature: &str) -> Result<()> {
    let sig = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| Error::Auth(format!("nonce signature is not base64url: {e}")))?;
    let user = KeyPair::from_public_key(&claims.sub)
        .map_err(|e| Error::Auth(format!("invalid JWT subject: {e}")))?;
    user.verify(nonce, &sig)
        .map_err(|_| Error::Auth("nonce signature verification failed".into()))
}

/// Encode and sign a user JWT with an account key.
pub fn encode_jwt(claims: &UserClaims, issuer: &KeyPair) -> Result<String> {
    let header = JwtHeader {
        typ: "JWT".into(),
        alg: JWT_ALG.into(),
    };
    let header = serde_json::to_vec(&header).map_err(|e| Error::Parse(e.to_string()))?;
    let body = serde_json::to_vec(claims).map_err(|e| Error::Parse(e.to_string()))?;
    let signed = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(body)
    );
    let sig = issuer
        .sign(signed.as_bytes())
        .map_err(|e| Error::Auth(format!("failed to sign JWT: {e}")))?;
    Ok(format!("{signed}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

/// Render a credentials bundle in the standard layout.
pub fn format_bundle(jwt: &str, seed: &str) -> String {
    format!(
        "-----BEGIN {JWT_BLOCK}-----\n{jwt}\n------END {JWT_BLOCK}------\n\n\
         ************************* IMPORTANT *************************\n\
         NKEY Seed printed below can be used to sign and prove identity.\n\
         NKEYs are sensitive and should be treated as secrets.\n\n\
         -----BEGIN {SEED_BLOCK}-----\n{seed}\n------END {SEED_BLOCK}------\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(name: &str) -> (KeyPair, KeyPair, String) {
        let account = KeyPair::new_account();
        let user = KeyPair::new_user();
        let claims = UserClaims {
            jti: "test".into(),
            iat: 1,
            iss: account.public_key(),
            name: name.into(),
            sub: user.public_key(),
            nats: UserPermissions::default(),
        };
        let jwt = encode_jwt(&claims, &account).unwrap();
        (account, user, jwt)
    }

    #[test]
    fn test_parse_bundle() {
        let (account, user, jwt) = issue("alice");
        let bundle = format_bundle(&jwt, &user.seed().unwrap());
        let creds = Credentials::parse(&bundle).unwrap();
        assert_eq!(creds.jwt(), jwt);
        assert_eq!(creds.claims().name, "alice");
        assert_eq!(creds.claims().iss, account.public_key());
        assert_eq!(creds.public_key(), user.public_key());
    }

    #[test]
    fn test_parse_ignores_surrounding_whitespace() {
        let (_, user, jwt) = issue("bob");
        let bundle = format!(
            "\n\n   -----BEGIN NATS USER JWT-----   \n\n   {jwt}   \n  ------END NATS USER JWT------\n\
             \t-----BEGIN USER NKEY SEED-----\n\t{}\n-----END USER NKEY SEED-----\n\n",
            user.seed().unwrap()
        );
        assert!(Credentials::parse(&bundle).is_ok());
    }

    #[test]
    fn test_missing_jwt_block() {
        let user = KeyPair::new_user();
        let bundle = format!(
            "-----BEGIN USER NKEY SEED-----\n{}\n------END USER NKEY SEED------\n",
            user.seed().unwrap()
        );
        let err = Credentials::parse(&bundle).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().contains("JWT"));
    }

    #[test]
    fn test_missing_seed_block() {
        let (_, _, jwt) = issue("carol");
        let bundle = format!("-----BEGIN NATS USER JWT-----\n{jwt}\n------END NATS USER JWT------\n");
        assert!(matches!(Credentials::parse(&bundle), Err(Error::Parse(_))));
    }

    #[test]
    fn test_unterminated_block() {
        let bundle = "-----BEGIN NATS USER JWT-----\nabc.def.ghi\n";
        assert!(matches!(Credentials::parse(bundle), Err(Error::Parse(_))));
    }

    #[test]
    fn test_seed_subject_mismatch() {
        let (_, _, jwt) = issue("dave");
        let other = KeyPair::new_user();
        let err = Credentials::from_seed_and_jwt(&other.seed().unwrap(), &jwt).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_garbage_jwt() {
        let user = KeyPair::new_user();
        let err = Credentials::from_seed_and_jwt(&user.seed().unwrap(), "not-a-jwt").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_sign_and_verify_challenge() {
        let (_, user, jwt) = issue("erin");
        let creds = Credentials::from_seed_and_jwt(&user.seed().unwrap(), &jwt).unwrap();
        let nonce = b"server-nonce-123";
        let sig = creds.sign_challenge(nonce).unwrap();

        let claims = verify_jwt(creds.jwt()).unwrap();
        assert!(verify_challenge(&claims, nonce, &sig).is_ok());
        assert!(verify_challenge(&claims, b"another-nonce", &sig).is_err());
    }

    #[test]
    fn test_verify_jwt_rejects_foreign_issuer() {
        let account = KeyPair::new_account();
        let forger = KeyPair::new_account();
        let user = KeyPair::new_user();
        let claims = UserClaims {
            iss: account.public_key(),
            sub: user.public_key(),
            ..Default::default()
        };
        // claims say `account` but `forger` signed
        let jwt = encode_jwt(&claims, &forger).unwrap();
        assert!(matches!(verify_jwt(&jwt), Err(Error::Auth(_))));
    }

    #[test]
    fn test_debug_hides_seed() {
        let (_, user, jwt) = issue("frank");
        let seed = user.seed().unwrap();
        let creds = Credentials::from_seed_and_jwt(&seed, &jwt).unwrap();
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains(&seed));
    }
}
