use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::Html,
    Form,
};
use serde::Deserialize;

use super::IdentityProvider;
use crate::{
    artifact::{Artifact, PendingResponse},
    artifact_response::Response,
    assertion::AssertionBuilder,
    authn_request::{AuthnRequestInfo, ProtocolBinding},
    encryption::encrypt,
    signature::sign,
    utils::{html_escape, strip_xml_declaration},
    SamlError,
};

#[derive(Debug, Deserialize)]
pub struct SsoParams {
    /// Deflated, base64 AuthnRequest; URL decoding is done by the extractor.
    #[serde(rename = "SAMLRequest")]
    pub saml_request: Option<String>,
}

impl IdentityProvider {
    /// Decodes an incoming AuthnRequest and checks it was meant for us by our SP.
    pub fn accept_authn_request(&self, encoded: &str) -> Result<AuthnRequestInfo, SamlError> {
        let request = AuthnRequestInfo::decode(encoded)?;
        tracing::info!(
            request_id = %request.id,
            issuer = %request.issuer,
            "AuthnRequest received"
        );

        if request.issuer != self.config.sp_entity_id {
            return Err(SamlError::InvalidIssuer(request.issuer));
        }
        if let Some(destination) = &request.destination {
            if destination != &self.config.sso_url {
                return Err(SamlError::UnexpectedMessage(format!(
                    "AuthnRequest addressed to {destination}"
                )));
            }
        }
        if let Some(acs) = &request.assertion_consumer_service_url {
            if acs != &self.config.sp_consumer_url {
                return Err(SamlError::Configuration(format!(
                    "assertion consumer {acs} is not the registered {}",
                    self.config.sp_consumer_url
                )));
            }
        }
        if let Some(binding) = request.protocol_binding {
            if binding != ProtocolBinding::Artifact {
                return Err(SamlError::UnexpectedMessage(format!(
                    "unsupported response binding {binding}"
                )));
            }
        }
        Ok(request)
    }

    /// Builds the signed and encrypted response answering `request`.
    pub fn build_response(&self, request: &AuthnRequestInfo) -> Result<Response, SamlError> {
        let mut assertion = AssertionBuilder::new()
            .issuer(&self.config.entity_id)
            .transient_name_id()
            .recipient(&self.config.sp_consumer_url)
            .in_response_to(&request.id)
            .audience(&self.config.sp_entity_id)
            .lifetime(self.config.assertion_lifetime);
        for (name, value) in &self.config.attributes {
            assertion = assertion.attribute(name, value);
        }

        let signed = sign(assertion.build()?, self.credentials.own())?;
        tracing::debug!(xml = %signed.xml(), "signed assertion");
        let encrypted = encrypt(strip_xml_declaration(signed.xml()), self.credentials.peer())?;

        Response::new(
            &self.config.entity_id,
            &self.config.sp_consumer_url,
            &request.id,
            vec![encrypted],
        )
    }

    /// Issues a fresh artifact standing for the response to `encoded`.
    pub fn issue(&self, encoded: &str) -> Result<Artifact, SamlError> {
        let request = self.accept_authn_request(encoded)?;
        let response = self.build_response(&request)?;

        let artifact = Artifact::new(&self.config.entity_id, self.config.endpoint_index);
        self.artifacts.purge_expired();
        self.artifacts.insert(
            &artifact,
            PendingResponse::new(&self.config.sp_entity_id, response),
        );
        tracing::info!(
            artifact = artifact.value(),
            request_id = %request.id,
            "artifact issued"
        );
        Ok(artifact)
    }
}

fn login_form(saml_request: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Identity Provider</title>
</head>
<body>
    <h1>You are now at the IDP, click the button to authenticate</h1>
    <form method="post">
        <input type="hidden" name="SAMLRequest" value="{}"/>
        <input type="submit" value="Authenticate"/>
    </form>
</body>
</html>"#,
        html_escape(saml_request)
    )
}

fn artifact_form(consumer_url: &str, artifact: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Redirecting to SP</title>
</head>
<body onload="document.forms[0].submit()">
    <form method="post" action="{}">
        <input type="hidden" name="SAMLart" value="{}"/>
        <noscript>
            <input type="submit" value="Continue"/>
        </noscript>
    </form>
</body>
</html>"#,
        html_escape(consumer_url),
        html_escape(artifact)
    )
}

/// Placeholder for a real login page: any visitor counts as authenticated.
pub async fn login_page(
    State(idp): State<Arc<IdentityProvider>>,
    Query(params): Query<SsoParams>,
) -> Result<Html<String>, SamlError> {
    let encoded = params
        .saml_request
        .ok_or(SamlError::MissingParameter("SAMLRequest"))?;
    idp.accept_authn_request(&encoded)?;
    Ok(Html(login_form(&encoded)))
}

pub async fn issue_artifact(
    State(idp): State<Arc<IdentityProvider>>,
    Form(params): Form<SsoParams>,
) -> Result<Html<String>, SamlError> {
    let encoded = params
        .saml_request
        .ok_or(SamlError::MissingParameter("SAMLRequest"))?;
    let artifact = idp.issue(&encoded)?;
    Ok(Html(artifact_form(
        &idp.config.sp_consumer_url,
        artifact.value(),
    )))
}
