use base64::engine::general_purpose;
use base64::Engine;
use std::collections::HashMap;
use std::fmt;

/// Identity -> secret table loaded from the `auth` section of the config.
///
/// Read-only after startup, so it is shared between connections without locking.
#[derive(Clone, Default)]
pub struct CredentialTable {
    entries: HashMap<String, String>,
}

impl CredentialTable {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain string equality against the stored secret.
    ///
    /// Unknown identities never match, even against an empty secret.
    // TODO: switch to a constant-time comparison once deployments can take the behavior change.
    fn matches(&self, identity: &str, secret: &str) -> bool {
        self.entries
            .get(identity)
            .is_some_and(|stored| stored == secret)
    }
}

impl FromIterator<(String, String)> for CredentialTable {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// Secrets stay out of logs and panic messages.
impl fmt::Debug for CredentialTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut identities: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        identities.sort_unstable();
        f.debug_struct("CredentialTable")
            .field("identities", &identities)
            .finish()
    }
}

/// Identity/secret pair decoded from a single request header
pub struct Credential {
    pub identity: String,
    pub secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Why a presented credential was rejected. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnauthorizedReason {
    BadEncoding,
    BadPair,
    UnknownIdentity(String),
}

impl fmt::Display for UnauthorizedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnauthorizedReason::BadEncoding => f.write_str("bad encoding"),
            UnauthorizedReason::BadPair => f.write_str("bad pair"),
            UnauthorizedReason::UnknownIdentity(identity) => {
                write!(f, "unknown identity: {}", identity)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Authorized(String),
    Unauthorized(UnauthorizedReason),
    NoCredentialPresented,
}

impl AuthResult {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthResult::Authorized(_))
    }
}

/// Decode `<scheme> <base64(identity:secret)>` into a credential.
///
/// The scheme itself is not checked.
pub fn parse_credential(header_value: &str) -> Result<Option<Credential>, UnauthorizedReason> {
    let Some((_scheme, payload)) = header_value.split_once(' ') else {
        return Ok(None);
    };

    let decoded = general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| UnauthorizedReason::BadEncoding)?;
    let decoded = String::from_utf8(decoded).map_err(|_| UnauthorizedReason::BadEncoding)?;

    let (identity, secret) = decoded
        .split_once(':')
        .ok_or(UnauthorizedReason::BadPair)?;

    Ok(Some(Credential {
        identity: identity.to_string(),
        secret: secret.to_string(),
    }))
}

/// Validate a proxy authorization header value against the credential table
pub fn validate(header_value: &str, table: &CredentialTable) -> AuthResult {
    match parse_credential(header_value) {
        Ok(None) => AuthResult::NoCredentialPresented,
        Err(reason) => AuthResult::Unauthorized(reason),
        Ok(Some(credential)) => {
            if table.matches(&credential.identity, &credential.secret) {
                AuthResult::Authorized(credential.identity)
            } else {
                AuthResult::Unauthorized(UnauthorizedReason::UnknownIdentity(credential.identity))
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn basic_header(identity: &str, secret: &str) -> String {
    format!(
        "Basic {}",
        general_purpose::STANDARD.encode(format!("{}:{}", identity, secret))
    )
}
