use std::sync::Arc;

use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use time::{format_description::well_known::Iso8601, OffsetDateTime};

use super::IdentityProvider;
use crate::{
    artifact_resolve::ArtifactResolveInfo,
    artifact_response::ArtifactResponse,
    signature::verify_signature,
    soap::{unwrap_soap_body, wrap_in_soap_envelope, SOAP_CONTENT_TYPE},
    utils::{parse_document, root_element, to_xml, xpath_context},
    SamlError,
};

impl IdentityProvider {
    /// Answers one SOAP-wrapped ArtifactResolve with a SOAP-wrapped ArtifactResponse.
    ///
    /// A request that fails verification is an error. A verified request for an
    /// artifact we cannot hand out gets an ArtifactResponse without a message.
    pub fn resolve_artifact(&self, envelope: &str) -> Result<String, SamlError> {
        let document = parse_document(envelope.as_bytes())?;
        let mut context = xpath_context(&document)?;
        let node = unwrap_soap_body(&mut context, &root_element(&document)?)?;
        let request = ArtifactResolveInfo::from_node(&mut context, &node)?;

        if !verify_signature(&document, &mut context, &node, self.credentials.peer())? {
            return Err(SamlError::InvalidSignature);
        }
        if request.issuer != self.config.sp_entity_id {
            return Err(SamlError::InvalidIssuer(request.issuer));
        }
        self.check_issue_instant(&request.issue_instant)?;
        if let Some(destination) = &request.destination {
            if destination != &self.config.artifact_resolution_url {
                return Err(SamlError::ConditionNotMet(format!(
                    "ArtifactResolve addressed to {destination}"
                )));
            }
        }

        let response = match self.artifacts.take(&request.artifact, &request.issuer) {
            Ok(response) => {
                tracing::info!(
                    artifact = %request.artifact,
                    request_id = %request.id,
                    "artifact resolved"
                );
                Some(response)
            }
            Err(error) => {
                tracing::warn!(
                    artifact = %request.artifact,
                    request_id = %request.id,
                    %error,
                    "artifact not resolvable"
                );
                None
            }
        };

        let reply = ArtifactResponse::new(&self.config.entity_id, &request.id, response)?;
        Ok(wrap_in_soap_envelope(&to_xml(&reply)?))
    }

    fn check_issue_instant(&self, issue_instant: &str) -> Result<(), SamlError> {
        let issued = OffsetDateTime::parse(issue_instant, &Iso8601::DEFAULT).map_err(|_| {
            SamlError::ConditionNotMet(format!("malformed IssueInstant {issue_instant:?}"))
        })?;
        let drift = (OffsetDateTime::now_utc() - issued).abs();
        if drift > self.config.clock_skew {
            return Err(SamlError::ConditionNotMet(format!(
                "ArtifactResolve issued {issue_instant}, outside the allowed clock skew"
            )));
        }
        Ok(())
    }
}

pub async fn artifact_resolution_service(
    State(idp): State<Arc<IdentityProvider>>,
    body: String,
) -> Response {
    match idp.resolve_artifact(&body) {
        Ok(envelope) => ([(CONTENT_TYPE, SOAP_CONTENT_TYPE)], envelope).into_response(),
        Err(error) => error.into_response(),
    }
}
