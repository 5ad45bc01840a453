//! The identity provider: login placeholder, artifact issuance and the artifact
//! resolution service.

mod issuer;
mod resolution;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::{artifact::ArtifactStore, config::IdpConfig, credentials::CredentialStore};

pub struct IdentityProvider {
    config: IdpConfig,
    credentials: CredentialStore,
    artifacts: ArtifactStore,
}

impl IdentityProvider {
    pub fn new(config: IdpConfig, credentials: CredentialStore) -> Self {
        let artifacts = ArtifactStore::new(config.artifact_ttl);
        IdentityProvider {
            config,
            credentials,
            artifacts,
        }
    }

    pub fn config(&self) -> &IdpConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }
}

pub fn router(idp: Arc<IdentityProvider>) -> Router {
    Router::new()
        .route(
            "/idp/sso",
            get(issuer::login_page).post(issuer::issue_artifact),
        )
        .route(
            "/idp/artifactResolutionService",
            post(resolution::artifact_resolution_service),
        )
        .with_state(idp)
}
