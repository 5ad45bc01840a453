use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use time::format_description::well_known::iso8601::{self, TimePrecision};

mod artifact;
mod artifact_resolve;
mod artifact_response;
mod assertion;
mod authn_request;
mod c14n;
pub mod config;
mod credentials;
mod elements;
mod encryption;
pub mod idp;
mod session;
mod signature;
mod soap;
pub mod sp;
mod utils;

pub use artifact::{Artifact, ArtifactStore, PendingResponse};
pub use artifact_resolve::ArtifactResolve;
pub use artifact_response::{ArtifactResponse, Response as SamlResponse};
pub use assertion::{check_conditions, AssertionBuilder, AssertionInfo, AssertionValidation};
pub use authn_request::{AuthnRequest, AuthnRequestBuilder, AuthnRequestInfo, ProtocolBinding};
pub use credentials::{Credential, CredentialStore};
pub use encryption::{decrypt, encrypt, EncryptedAssertion};
pub use session::{
    consume_goto_url, establish, mark_authenticated, Principal, Session, SessionStore,
};
pub use signature::{sign, validate_signature_profile, verify_signature, Signable, Signature, Signed};
pub use soap::{unwrap_soap_body, wrap_in_soap_envelope};

pub const NAME_ID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";
pub const NAME_ID_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";
pub const AUTHN_CONTEXT_PASSWORD: &str = "urn:oasis:names:tc:SAML:2.0:ac:classes:Password";
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const SUBJECT_CONFIRMATION_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

pub const SAMLP_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const SAML_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const SOAP11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;

/// The four failure classes of the protocol. Every one of them is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Trust,
    Protocol,
    Configuration,
}

#[derive(Debug, Error)]
pub enum SamlError {
    #[error("back-channel call failed: {0}")]
    Transport(String),
    #[error("back-channel call timed out")]
    Timeout,
    #[error("artifact resolution service returned an empty response")]
    EmptyResponse,

    #[error("assertion is not signed")]
    Unsigned,
    #[error("signature violates the SAML signature profile: {0}")]
    SignatureProfile(String),
    #[error("signature did not verify")]
    InvalidSignature,
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("unexpected issuer {0}")]
    InvalidIssuer(String),
    #[error("condition not met: {0}")]
    ConditionNotMet(String),
    #[error("message correlation failed: {0}")]
    Correlation(String),
    #[error("unknown or already consumed artifact")]
    UnknownArtifact,
    #[error("artifact expired")]
    ArtifactExpired,

    #[error("invalid XML: {0}")]
    InvalidXml(String),
    #[error("missing element {0}")]
    MissingElement(&'static str),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("missing request parameter {0}")]
    MissingParameter(&'static str),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("request status was not success: {0}")]
    StatusNotSuccess(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("unknown session")]
    UnknownSession,
    #[error("no goto URL stored on session")]
    MissingGotoUrl,

    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("credential error: {0}")]
    Credential(String),
}

impl SamlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SamlError::Transport(_) | SamlError::Timeout | SamlError::EmptyResponse => {
                ErrorKind::Transport
            }
            SamlError::Unsigned
            | SamlError::SignatureProfile(_)
            | SamlError::InvalidSignature
            | SamlError::Decryption(_)
            | SamlError::UnsupportedAlgorithm(_)
            | SamlError::InvalidIssuer(_)
            | SamlError::ConditionNotMet(_)
            | SamlError::Correlation(_)
            | SamlError::UnknownArtifact
            | SamlError::ArtifactExpired => ErrorKind::Trust,
            SamlError::Configuration(_) | SamlError::Credential(_) => ErrorKind::Configuration,
            _ => ErrorKind::Protocol,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            SamlError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SamlError::Transport(_) | SamlError::EmptyResponse => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SamlError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        tracing::error!(error = %self, ?kind, "SAML flow aborted");
        let body = match kind {
            ErrorKind::Trust => "authentication could not be verified".to_string(),
            _ => self.to_string(),
        };
        (self.http_status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_maps_to_server_error() {
        let errors = [
            SamlError::Timeout,
            SamlError::EmptyResponse,
            SamlError::InvalidSignature,
            SamlError::MissingParameter("SAMLart"),
            SamlError::Configuration("missing".into()),
        ];
        for error in errors {
            assert!(error.http_status().is_server_error(), "{error}");
        }
    }

    #[test]
    fn errors_are_classified() {
        assert_eq!(SamlError::Timeout.kind(), ErrorKind::Transport);
        assert_eq!(SamlError::Unsigned.kind(), ErrorKind::Trust);
        assert_eq!(SamlError::UnknownArtifact.kind(), ErrorKind::Trust);
        assert_eq!(SamlError::MissingElement("Response").kind(), ErrorKind::Protocol);
        assert_eq!(SamlError::Credential("x".into()).kind(), ErrorKind::Configuration);
    }
}
