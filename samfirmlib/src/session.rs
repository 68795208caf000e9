use crate::crypto::{CryptoError, FusCrypto};

use std::{fmt, sync::Arc};

use log::debug;
use reqwest::cookie::Jar;

/// FUS endpoints that consume a nonce signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endpoint {
    GenerateNonce,
    BinaryInform,
    BinaryInit,
    BinaryDownload,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Self::GenerateNonce => "/NF_DownloadGenerateNonce.do",
            Self::BinaryInform => "/NF_DownloadBinaryInform.do",
            Self::BinaryInit => "/NF_DownloadBinaryInitForMass.do",
            Self::BinaryDownload => "/NF_DownloadBinaryForMass.do",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path().trim_start_matches('/'))
    }
}

/// Mutable state of one FUS session: the server-issued nonce, its decrypted
/// form and the cookie jar. Each [`crate::fus::FusClient`] owns exactly one,
/// so independent sessions never share state.
pub struct Session {
    nonce: String,
    nonce_decrypted: String,
    /// Endpoint whose request was signed with the current nonce, if any
    consumed_by: Option<Endpoint>,
    cookies: Arc<Jar>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            nonce: String::new(),
            nonce_decrypted: String::new(),
            consumed_by: None,
            cookies: Arc::new(Jar::default()),
        }
    }

    /// Opaque nonce as issued by the server. Empty until the first rotation.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Decrypted nonce. Empty until the first rotation.
    pub fn nonce_decrypted(&self) -> &str {
        &self.nonce_decrypted
    }

    pub fn has_nonce(&self) -> bool {
        !self.nonce_decrypted.is_empty()
    }

    pub fn cookies(&self) -> Arc<Jar> {
        self.cookies.clone()
    }

    /// Replace both nonce fields with a freshly issued nonce. Nothing is
    /// modified if the nonce cannot be decrypted.
    pub fn rotate(&mut self, nonce: &str, crypto: &dyn FusCrypto) -> Result<(), CryptoError> {
        let decrypted = crypto.decrypt_nonce(nonce)?;
        debug!("Rotated nonce");

        self.nonce = nonce.to_owned();
        self.nonce_decrypted = decrypted;
        self.consumed_by = None;

        Ok(())
    }

    /// Whether the current nonce may sign a request to `endpoint`. A nonce
    /// already used for one endpoint may only be reused for that endpoint
    /// until the server issues a new one.
    pub fn can_sign_for(&self, endpoint: Endpoint) -> bool {
        self.has_nonce() && match self.consumed_by {
            None => true,
            Some(e) => e == endpoint,
        }
    }

    pub fn mark_consumed(&mut self, endpoint: Endpoint) {
        if self.has_nonce() {
            self.consumed_by = Some(endpoint);
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("has_nonce", &self.has_nonce())
            .field("consumed_by", &self.consumed_by)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    struct PlainCrypto;

    impl FusCrypto for PlainCrypto {
        fn decrypt_nonce(&self, nonce: &str) -> Result<String, CryptoError> {
            if nonce.len() == 16 {
                Ok(nonce.to_ascii_lowercase())
            } else {
                Err(CryptoError::NonceInvalidSize)
            }
        }

        fn signature(&self, decrypted_nonce: &str) -> String {
            format!("sig:{decrypted_nonce}")
        }
    }

    #[test]
    fn test_rotation() {
        let mut session = Session::new();
        assert!(!session.has_nonce());
        assert!(!session.can_sign_for(Endpoint::BinaryInform));

        session.rotate("AAAABBBBCCCCDDDD", &PlainCrypto).unwrap();
        assert_eq!(session.nonce(), "AAAABBBBCCCCDDDD");
        assert_eq!(session.nonce_decrypted(), "aaaabbbbccccdddd");

        // Failed rotation keeps both previous fields
        assert_matches!(session.rotate("bad", &PlainCrypto),
                        Err(CryptoError::NonceInvalidSize));
        assert_eq!(session.nonce(), "AAAABBBBCCCCDDDD");
        assert_eq!(session.nonce_decrypted(), "aaaabbbbccccdddd");
    }

    #[test]
    fn test_consumption() {
        let mut session = Session::new();
        session.rotate("AAAABBBBCCCCDDDD", &PlainCrypto).unwrap();

        session.mark_consumed(Endpoint::BinaryInform);
        assert!(session.can_sign_for(Endpoint::BinaryInform));
        assert!(!session.can_sign_for(Endpoint::BinaryInit));

        session.rotate("EEEEFFFFGGGGHHHH", &PlainCrypto).unwrap();
        assert!(session.can_sign_for(Endpoint::BinaryInit));
    }

    #[test]
    fn test_independent_sessions() {
        let mut a = Session::new();
        let b = Session::new();

        a.rotate("AAAABBBBCCCCDDDD", &PlainCrypto).unwrap();
        assert!(a.has_nonce());
        assert!(!b.has_nonce());
    }
}
