use axum::{
    http::{header::LOCATION, StatusCode},
    response::{IntoResponse, Response},
};

use crate::{
    authn_request::{AuthnRequestBuilder, ProtocolBinding},
    config::SpConfig,
    session::Session,
    SamlError,
};

/// Where to send the browser to authenticate.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectInstruction {
    pub location: String,
    pub authn_request_id: String,
}

impl IntoResponse for RedirectInstruction {
    fn into_response(self) -> Response {
        (StatusCode::FOUND, [(LOCATION, self.location)]).into_response()
    }
}

/// Remembers `requested_url` on the session and builds the redirect to the IDP.
pub fn initiate(
    config: &SpConfig,
    session: &mut Session,
    requested_url: &str,
) -> Result<RedirectInstruction, SamlError> {
    session.set_goto_url(requested_url);

    let request = AuthnRequestBuilder::new()
        .auto_id()
        .issued_now()
        .issuer(&config.entity_id)
        .destination(&config.idp_sso_url)
        .protocol_binding(ProtocolBinding::Artifact)
        .consumer_url(&config.consumer_url)
        .build()?;
    let location = request.redirect_url()?;
    session.set_authn_request_id(request.id());

    tracing::info!(
        request_id = request.id(),
        destination = request.destination(),
        goto_url = requested_url,
        "redirecting to IDP for authentication"
    );
    Ok(RedirectInstruction {
        location,
        authn_request_id: request.id().to_string(),
    })
}
