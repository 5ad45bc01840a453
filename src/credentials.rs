use std::{fmt, path::Path};

use rand::rngs::OsRng;
use rsa::{
    pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{SignatureEncoding, Signer, Verifier},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;

use crate::SamlError;

/// One party's key material. The private half is only present for our own credential.
#[derive(Clone)]
pub struct Credential {
    entity_id: String,
    public_key: RsaPublicKey,
    private_key: Option<RsaPrivateKey>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("entity_id", &self.entity_id)
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

impl Credential {
    /// Builds a full credential from a PKCS#8 PEM private key.
    pub fn from_private_pem(entity_id: &str, pem: &str) -> Result<Self, SamlError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| SamlError::Credential(format!("{entity_id}: {e}")))?;
        Ok(Credential {
            entity_id: entity_id.into(),
            public_key: RsaPublicKey::from(&private_key),
            private_key: Some(private_key),
        })
    }

    /// Builds a verification-only credential from an SPKI PEM public key.
    pub fn from_public_pem(entity_id: &str, pem: &str) -> Result<Self, SamlError> {
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| SamlError::Credential(format!("{entity_id}: {e}")))?;
        Ok(Credential {
            entity_id: entity_id.into(),
            public_key,
            private_key: None,
        })
    }

    pub fn load_private(entity_id: &str, path: impl AsRef<Path>) -> Result<Self, SamlError> {
        Self::from_private_pem(entity_id, &read_pem(path.as_ref())?)
    }

    pub fn load_public(entity_id: &str, path: impl AsRef<Path>) -> Result<Self, SamlError> {
        Self::from_public_pem(entity_id, &read_pem(path.as_ref())?)
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    fn private_key(&self) -> Result<&RsaPrivateKey, SamlError> {
        self.private_key.as_ref().ok_or_else(|| {
            SamlError::Credential(format!("{} has no private key", self.entity_id))
        })
    }

    /// RSA PKCS#1 v1.5 signature with SHA-256.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SamlError> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key()?.clone());
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| SamlError::Credential(e.to_string()))?;
        Ok(signature.to_vec())
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = RsaSignature::try_from(signature) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(self.public_key.clone())
            .verify(data, &signature)
            .is_ok()
    }

    /// Wraps a content-encryption key for this credential's owner (RSA-OAEP, SHA-256).
    pub fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>, SamlError> {
        self.public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)
            .map_err(|e| SamlError::Credential(e.to_string()))
    }

    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, SamlError> {
        self.private_key()?
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| SamlError::Decryption(e.to_string()))
    }
}

fn read_pem(path: &Path) -> Result<String, SamlError> {
    std::fs::read_to_string(path)
        .map_err(|e| SamlError::Configuration(format!("{}: {e}", path.display())))
}

/// Key material of one party: its own key pair and the peer's public key.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    own: Credential,
    peer: Credential,
}

impl CredentialStore {
    pub fn new(own: Credential, peer: Credential) -> Result<Self, SamlError> {
        if !own.has_private_key() {
            return Err(SamlError::Credential(format!(
                "{} needs a private key to sign and decrypt",
                own.entity_id
            )));
        }
        Ok(CredentialStore { own, peer })
    }

    pub fn load(
        own_entity_id: &str,
        own_private_key: impl AsRef<Path>,
        peer_entity_id: &str,
        peer_public_key: impl AsRef<Path>,
    ) -> Result<Self, SamlError> {
        let own = Credential::load_private(own_entity_id, own_private_key)?;
        let peer = Credential::load_public(peer_entity_id, peer_public_key)?;
        tracing::info!(own = own_entity_id, peer = peer_entity_id, "credentials loaded");
        Self::new(own, peer)
    }

    pub fn own(&self) -> &Credential {
        &self.own
    }

    pub fn peer(&self) -> &Credential {
        &self.peer
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn signature_verifies_only_with_matching_key() {
        let signature = idp().sign(b"payload").unwrap();
        assert!(idp().verify(b"payload", &signature));
        assert!(!idp().verify(b"other payload", &signature));
        assert!(!rogue().verify(b"payload", &signature));
    }

    #[test]
    fn public_only_credential_cannot_sign() {
        let public = Credential::from_public_pem(IDP_ENTITY_ID, IDP_PUB).unwrap();
        assert!(matches!(public.sign(b"x"), Err(SamlError::Credential(_))));
        assert!(CredentialStore::new(public, sp()).is_err());
    }

    #[test]
    fn wrapped_key_unwraps_with_private_half() {
        let recipient = Credential::from_public_pem(SP_ENTITY_ID, SP_PUB).unwrap();
        let wrapped = recipient.wrap_key(&[7u8; 32]).unwrap();
        assert_eq!(sp().unwrap_key(&wrapped).unwrap(), vec![7u8; 32]);
        assert!(idp().unwrap_key(&wrapped).is_err());
    }

    #[test]
    fn rejects_garbage_pem() {
        assert!(Credential::from_private_pem("x", "not a key").is_err());
    }
}
