//! Turning a received artifact into a verified, decrypted assertion.

use std::time::Duration;

use time::OffsetDateTime;

use crate::{
    artifact::Artifact,
    artifact_resolve::ArtifactResolve,
    artifact_response::expect_success,
    assertion::{AssertionInfo, AssertionValidation},
    config::SpConfig,
    credentials::CredentialStore,
    encryption::decrypt,
    signature::{sign, verify_signature, Signable, Signed},
    soap::{unwrap_soap_body, wrap_in_soap_envelope},
    utils::{expect_element, find_nodes, parse_document, root_element, single_node, xpath_context},
    SamlError, SAMLP_NS,
};

use super::client::ArtifactResolutionClient;

/// Reads the artifact out of the `SAMLart` parameter.
pub fn build_artifact_from_request(value: Option<&str>) -> Result<Artifact, SamlError> {
    let artifact = Artifact::from_value(value)?;
    tracing::info!(artifact = artifact.value(), "artifact received");
    Ok(artifact)
}

pub fn build_artifact_resolve(
    config: &SpConfig,
    artifact: &Artifact,
) -> Result<ArtifactResolve, SamlError> {
    ArtifactResolve::new(
        &config.entity_id,
        &config.idp_artifact_resolution_url,
        artifact,
    )
}

/// Signs the finished resolve request with the SP key.
pub fn sign_artifact_resolve(
    artifact_resolve: ArtifactResolve,
    credentials: &CredentialStore,
) -> Result<Signed<ArtifactResolve>, SamlError> {
    sign(artifact_resolve, credentials.own())
}

/// A SOAP reply known to carry a single `samlp:ArtifactResponse` in its body.
#[derive(Debug, Clone)]
pub struct ArtifactResponseEnvelope {
    xml: String,
}

impl ArtifactResponseEnvelope {
    pub fn parse(xml: String) -> Result<Self, SamlError> {
        if xml.trim().is_empty() {
            return Err(SamlError::EmptyResponse);
        }
        {
            let document = parse_document(xml.as_bytes())?;
            let mut context = xpath_context(&document)?;
            let body = unwrap_soap_body(&mut context, &root_element(&document)?)?;
            expect_element(&body, SAMLP_NS, "ArtifactResponse")?;
        }
        Ok(ArtifactResponseEnvelope { xml })
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }
}

/// Sends the signed request over the back channel and waits at most `timeout`.
///
/// A timeout is final; the artifact may already be consumed at the IDP.
pub async fn resolve(
    client: &dyn ArtifactResolutionClient,
    endpoint: &str,
    artifact_resolve: &Signed<ArtifactResolve>,
    timeout: Duration,
) -> Result<ArtifactResponseEnvelope, SamlError> {
    let envelope = wrap_in_soap_envelope(artifact_resolve.xml());
    tracing::info!(
        request_id = artifact_resolve.message().id(),
        endpoint,
        "sending ArtifactResolve"
    );
    tracing::debug!(xml = %envelope, "ArtifactResolve");

    let reply = tokio::time::timeout(timeout, client.send(endpoint, envelope))
        .await
        .map_err(|_| SamlError::Timeout)??;

    tracing::info!(request_id = artifact_resolve.message().id(), "ArtifactResponse received");
    tracing::debug!(xml = %reply, "ArtifactResponse");
    ArtifactResponseEnvelope::parse(reply)
}

/// What the reply must match to be trusted.
#[derive(Debug, Clone)]
pub struct ResolutionExpectations<'a> {
    pub config: &'a SpConfig,
    pub credentials: &'a CredentialStore,
    pub artifact_resolve_id: &'a str,
    pub authn_request_id: &'a str,
    pub now: OffsetDateTime,
}

/// Extracts, decrypts and verifies the single assertion of the resolved response.
///
/// Nothing in the assertion is trusted until this returns `Ok`.
pub fn verify_and_decrypt(
    envelope: &ArtifactResponseEnvelope,
    expected: &ResolutionExpectations,
) -> Result<AssertionInfo, SamlError> {
    let document = parse_document(envelope.xml().as_bytes())?;
    let mut context = xpath_context(&document)?;
    let artifact_response = unwrap_soap_body(&mut context, &root_element(&document)?)?;
    expect_element(&artifact_response, SAMLP_NS, "ArtifactResponse")?;

    let in_response_to = artifact_response
        .get_attribute_no_ns("InResponseTo")
        .unwrap_or_default();
    if in_response_to != expected.artifact_resolve_id {
        return Err(SamlError::Correlation(format!(
            "ArtifactResponse answers {in_response_to:?}, sent {:?}",
            expected.artifact_resolve_id
        )));
    }
    expect_success(&mut context, &artifact_response)?;

    let response = single_node(
        find_nodes(&mut context, "samlp:Response", &artifact_response)?,
        "Response",
    )?;
    expect_success(&mut context, &response)?;
    let in_response_to = response.get_attribute_no_ns("InResponseTo").unwrap_or_default();
    if in_response_to != expected.authn_request_id {
        return Err(SamlError::Correlation(format!(
            "Response answers {in_response_to:?}, sent {:?}",
            expected.authn_request_id
        )));
    }

    if !find_nodes(&mut context, "saml:Assertion", &response)?.is_empty() {
        return Err(SamlError::UnexpectedMessage(
            "response carries a plaintext assertion".into(),
        ));
    }
    let encrypted = single_node(
        find_nodes(&mut context, "saml:EncryptedAssertion", &response)?,
        "EncryptedAssertion",
    )?;

    let plaintext = decrypt(&mut context, &encrypted, expected.credentials.own())?;
    tracing::info!("assertion decrypted");
    tracing::debug!(xml = %plaintext, "decrypted assertion");

    let assertion_document = parse_document(plaintext.as_bytes())?;
    let mut assertion_context = xpath_context(&assertion_document)?;
    let assertion = root_element(&assertion_document)?;

    if !verify_signature(
        &assertion_document,
        &mut assertion_context,
        &assertion,
        expected.credentials.peer(),
    )? {
        return Err(SamlError::InvalidSignature);
    }
    tracing::info!(
        issuer = expected.credentials.peer().entity_id(),
        "assertion signature verified"
    );

    AssertionValidation {
        idp_entity_id: expected.config.idp_entity_id.clone(),
        audience: expected.config.entity_id.clone(),
        recipient: expected.config.consumer_url.clone(),
        in_response_to: expected.authn_request_id.to_string(),
        clock_skew: expected.config.clock_skew,
        now: expected.now,
    }
    .validate(&mut assertion_context, &assertion)?;

    let info = AssertionInfo::from_node(&mut assertion_context, &assertion)?;
    for (name, values) in &info.attributes {
        tracing::info!(attribute = %name, ?values, "assertion attribute");
    }
    tracing::info!(
        authn_instant = info.authn_instant.as_deref().unwrap_or("-"),
        authn_method = info.authn_context_class.as_deref().unwrap_or("-"),
        "authentication statement"
    );
    Ok(info)
}
