//! SAML artifacts and the IDP's single-use store of responses awaiting resolution.

use std::time::{Duration, Instant};

use base64::{prelude::BASE64_STANDARD, Engine};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use sha1::{Digest, Sha1};

use crate::{artifact_response::Response, utils::decode_xml_base64, SamlError};

pub const ARTIFACT_TYPE_CODE: u16 = 0x0004;
const SOURCE_ID_LEN: usize = 20;
const MESSAGE_HANDLE_LEN: usize = 20;
const TYPE_0004_LEN: usize = 4 + SOURCE_ID_LEN + MESSAGE_HANDLE_LEN;

/// The opaque front-channel reference to a pending response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    value: String,
}

impl Artifact {
    /// Mints a type 0x0004 artifact: type code, endpoint index, SourceID and a random handle.
    pub fn new(issuer_entity_id: &str, endpoint_index: u16) -> Self {
        let mut handle = [0u8; MESSAGE_HANDLE_LEN];
        OsRng.fill_bytes(&mut handle);

        let mut bytes = Vec::with_capacity(TYPE_0004_LEN);
        bytes.extend_from_slice(&ARTIFACT_TYPE_CODE.to_be_bytes());
        bytes.extend_from_slice(&endpoint_index.to_be_bytes());
        bytes.extend_from_slice(&Sha1::digest(issuer_entity_id.as_bytes()));
        bytes.extend_from_slice(&handle);

        Artifact {
            value: BASE64_STANDARD.encode(bytes),
        }
    }

    /// Reads the artifact out of the `SAMLart` request parameter.
    pub fn from_value(value: Option<&str>) -> Result<Self, SamlError> {
        match value.map(str::trim) {
            Some(value) if !value.is_empty() => Ok(Artifact {
                value: value.to_string(),
            }),
            _ => Err(SamlError::MissingParameter("SAMLart")),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// SourceID of a well-formed type 0x0004 artifact; `None` for anything else.
    pub fn source_id(&self) -> Option<[u8; SOURCE_ID_LEN]> {
        let bytes = decode_xml_base64(&self.value).ok()?;
        if bytes.len() != TYPE_0004_LEN || bytes[..2] != ARTIFACT_TYPE_CODE.to_be_bytes() {
            return None;
        }
        bytes[4..4 + SOURCE_ID_LEN].try_into().ok()
    }

    /// Whether this artifact names `entity_id` as its issuer.
    pub fn issued_by(&self, entity_id: &str) -> bool {
        self.source_id()
            .map(|source_id| source_id[..] == Sha1::digest(entity_id.as_bytes())[..])
            .unwrap_or(false)
    }
}

/// A response parked at the IDP until its artifact is resolved.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    relying_party: String,
    response: Response,
    issued_at: Instant,
}

impl PendingResponse {
    pub fn new(relying_party: &str, response: Response) -> Self {
        PendingResponse {
            relying_party: relying_party.into(),
            response,
            issued_at: Instant::now(),
        }
    }

    pub fn relying_party(&self) -> &str {
        &self.relying_party
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() >= ttl
    }
}

#[derive(Debug)]
pub struct ArtifactStore {
    entries: DashMap<String, PendingResponse>,
    ttl: Duration,
}

impl ArtifactStore {
    pub fn new(ttl: Duration) -> Self {
        ArtifactStore {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, artifact: &Artifact, pending: PendingResponse) {
        tracing::debug!(
            artifact = artifact.value(),
            relying_party = pending.relying_party(),
            "artifact stored"
        );
        self.entries.insert(artifact.value.clone(), pending);
    }

    /// Removes and returns the response stored under `artifact`.
    ///
    /// The entry is gone after the first call whatever the outcome, so a
    /// second resolution of the same artifact always fails.
    pub fn take(&self, artifact: &str, requester: &str) -> Result<Response, SamlError> {
        let (_, pending) = self
            .entries
            .remove(artifact)
            .ok_or(SamlError::UnknownArtifact)?;

        if pending.is_expired(self.ttl) {
            tracing::warn!(artifact, "artifact expired before resolution");
            return Err(SamlError::ArtifactExpired);
        }
        if pending.relying_party != requester {
            tracing::warn!(
                artifact,
                requester,
                relying_party = pending.relying_party(),
                "artifact resolved by a party it was not issued to"
            );
            return Err(SamlError::UnknownArtifact);
        }
        Ok(pending.response)
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, pending| !pending.is_expired(self.ttl));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn response() -> Response {
        Response::new("TestIDP", "http://sp/consumer", "_req", Vec::new()).unwrap()
    }

    #[test]
    fn type_0004_layout() {
        let artifact = Artifact::new("TestIDP", 1);
        let bytes = decode_xml_base64(artifact.value()).unwrap();
        assert_eq!(bytes.len(), 44);
        assert_eq!(&bytes[..4], &[0, 4, 0, 1]);
        assert!(artifact.issued_by("TestIDP"));
        assert!(!artifact.issued_by("OtherIDP"));
        assert_ne!(artifact, Artifact::new("TestIDP", 1));
    }

    #[test]
    fn absent_parameter_is_an_error() {
        assert!(matches!(
            Artifact::from_value(None),
            Err(SamlError::MissingParameter("SAMLart"))
        ));
        assert!(Artifact::from_value(Some("  ")).is_err());
        let artifact = Artifact::from_value(Some("ART123")).unwrap();
        assert_eq!(artifact.value(), "ART123");
        assert_eq!(artifact.source_id(), None);
    }

    #[test]
    fn artifact_resolves_once() {
        let store = ArtifactStore::new(Duration::from_secs(60));
        let artifact = Artifact::new("TestIDP", 0);
        store.insert(&artifact, PendingResponse::new("TestSP", response()));

        assert!(store.take(artifact.value(), "TestSP").is_ok());
        assert!(matches!(
            store.take(artifact.value(), "TestSP"),
            Err(SamlError::UnknownArtifact)
        ));
    }

    #[test]
    fn other_relying_party_cannot_resolve() {
        let store = ArtifactStore::new(Duration::from_secs(60));
        let artifact = Artifact::new("TestIDP", 0);
        store.insert(&artifact, PendingResponse::new("TestSP", response()));

        assert!(matches!(
            store.take(artifact.value(), "EvilSP"),
            Err(SamlError::UnknownArtifact)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn expired_artifact_is_rejected() {
        let store = ArtifactStore::new(Duration::ZERO);
        let artifact = Artifact::new("TestIDP", 0);
        store.insert(&artifact, PendingResponse::new("TestSP", response()));
        assert!(matches!(
            store.take(artifact.value(), "TestSP"),
            Err(SamlError::ArtifactExpired)
        ));

        store.insert(&artifact, PendingResponse::new("TestSP", response()));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn concurrent_resolution_succeeds_once() {
        let store = Arc::new(ArtifactStore::new(Duration::from_secs(60)));
        let artifact = Artifact::new("TestIDP", 0);
        store.insert(&artifact, PendingResponse::new("TestSP", response()));

        let successes = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = Arc::clone(&store);
                    let value = artifact.value().to_string();
                    scope.spawn(move || store.take(&value, "TestSP").is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(successes, 1);
    }
}
