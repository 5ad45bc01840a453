use std::{fmt::Display, io::Read, str::FromStr};

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use flate2::read::DeflateDecoder;
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    elements::Issuer,
    utils::{
        decode_xml_base64, expect_element, find_value, format_instant, parse_document,
        require_value, root_element, secure_random_id, to_xml, xpath_context,
    },
    SamlError, AUTHN_CONTEXT_PASSWORD, NAME_ID_FORMAT_TRANSIENT, SAMLP_NS,
};

// Upper bound for an inflated SAMLRequest.
const MAX_INFLATED_LEN: u64 = 128 * 1024;

#[derive(Debug, Clone, YaSerialize)]
#[yaserde(
  rename = "AuthnRequest",
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
pub struct AuthnRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: String,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "NameIDPolicy", prefix = "samlp")]
    name_id_policy: NameIdPolicy,
    #[yaserde(rename = "RequestedAuthnContext", prefix = "samlp")]
    requested_authn_context: RequestedAuthnContext,
}

#[derive(Debug, Clone, YaSerialize)]
struct NameIdPolicy {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
}

#[derive(Debug, Clone, YaSerialize)]
struct RequestedAuthnContext {
    #[yaserde(attribute = true, rename = "Comparison")]
    comparison: String,
    #[yaserde(rename = "AuthnContextClassRef", prefix = "saml")]
    class_refs: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolBinding {
    Post,
    Redirect,
    #[default]
    Artifact,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
            ProtocolBinding::Artifact => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Artifact")
            }
        }
    }
}

impl FromStr for ProtocolBinding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Artifact" => Ok(ProtocolBinding::Artifact),
            _ => Err(()),
        }
    }
}

#[derive(Default)]
pub struct AuthnRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    protocol_binding: ProtocolBinding,
    consumer_url: Option<String>,
}

impl AuthnRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_id(self) -> Self {
        AuthnRequestBuilder {
            id: Some(secure_random_id()),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issued_now(self) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(OffsetDateTime::now_utc()),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AuthnRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        AuthnRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn protocol_binding(self, binding: ProtocolBinding) -> Self {
        AuthnRequestBuilder {
            protocol_binding: binding,
            ..self
        }
    }

    pub fn consumer_url(self, url: &str) -> Self {
        AuthnRequestBuilder {
            consumer_url: Some(url.into()),
            ..self
        }
    }

    pub fn build(self) -> Result<AuthnRequest, SamlError> {
        Ok(AuthnRequest {
            id: self.id.ok_or(SamlError::MissingField("ID"))?,
            version: "2.0".to_string(),
            issue_instant: format_instant(
                self.issue_instant
                    .ok_or(SamlError::MissingField("IssueInstant"))?,
            )?,
            destination: self.destination.ok_or(SamlError::MissingField("Destination"))?,
            protocol_binding: self.protocol_binding.to_string(),
            assertion_consumer_service_url: self
                .consumer_url
                .ok_or(SamlError::MissingField("AssertionConsumerServiceURL"))?,
            issuer: Issuer::entity(&self.issuer.ok_or(SamlError::MissingField("Issuer"))?),
            name_id_policy: NameIdPolicy {
                format: NAME_ID_FORMAT_TRANSIENT.to_string(),
                allow_create: true,
            },
            requested_authn_context: RequestedAuthnContext {
                comparison: "minimum".to_string(),
                class_refs: vec![AUTHN_CONTEXT_PASSWORD.to_string()],
            },
        })
    }
}

impl AuthnRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn to_xml(&self) -> Result<String, SamlError> {
        to_xml(self)
    }

    /// Raw deflate, then base64: the value of the `SAMLRequest` parameter before URL encoding.
    pub fn encode(&self) -> Result<String, SamlError> {
        let xml = self.to_xml()?;
        let compressed = deflate_bytes(xml.as_bytes());
        Ok(BASE64_STANDARD.encode(compressed))
    }

    /// The destination URL carrying this request in its `SAMLRequest` query parameter.
    pub fn redirect_url(&self) -> Result<String, SamlError> {
        let separator = if self.destination.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}SAMLRequest={}",
            self.destination,
            separator,
            urlencoding::encode(&self.encode()?)
        ))
    }
}

/// What the IDP reads back out of a redirect-bound AuthnRequest.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthnRequestInfo {
    pub id: String,
    pub issuer: String,
    pub destination: Option<String>,
    pub assertion_consumer_service_url: Option<String>,
    pub protocol_binding: Option<ProtocolBinding>,
    pub issue_instant: String,
}

impl AuthnRequestInfo {
    /// Decodes a `SAMLRequest` value that the HTTP layer has already URL-decoded.
    pub fn decode(encoded: &str) -> Result<Self, SamlError> {
        let compressed =
            decode_xml_base64(encoded).map_err(|e| SamlError::InvalidEncoding(e.to_string()))?;
        let mut xml = Vec::new();
        DeflateDecoder::new(compressed.as_slice())
            .take(MAX_INFLATED_LEN + 1)
            .read_to_end(&mut xml)
            .map_err(|e| SamlError::InvalidEncoding(e.to_string()))?;
        if xml.len() as u64 > MAX_INFLATED_LEN {
            return Err(SamlError::InvalidEncoding("SAMLRequest too large".into()));
        }
        Self::parse(&xml)
    }

    pub fn parse(xml: &[u8]) -> Result<Self, SamlError> {
        let document = parse_document(xml)?;
        let mut context = xpath_context(&document)?;
        let root = root_element(&document)?;
        expect_element(&root, SAMLP_NS, "AuthnRequest")?;

        Ok(AuthnRequestInfo {
            id: root
                .get_attribute_no_ns("ID")
                .filter(|id| !id.is_empty())
                .ok_or(SamlError::MissingField("ID"))?,
            issuer: require_value(&mut context, "saml:Issuer", &root, "Issuer")?,
            destination: root.get_attribute_no_ns("Destination"),
            assertion_consumer_service_url: root.get_attribute_no_ns("AssertionConsumerServiceURL"),
            protocol_binding: find_value(&mut context, "@ProtocolBinding", &root)
                .and_then(|binding| binding.parse().ok()),
            issue_instant: root
                .get_attribute_no_ns("IssueInstant")
                .ok_or(SamlError::MissingField("IssueInstant"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AuthnRequest {
        AuthnRequestBuilder::new()
            .auto_id()
            .issued_now()
            .issuer("TestSP")
            .destination("http://idp.example/idp/sso")
            .consumer_url("http://sp.example/sp/consumer")
            .build()
            .unwrap()
    }

    #[test]
    fn requests_artifact_binding_and_password_context() {
        let xml = request().to_xml().unwrap();
        assert!(xml.contains("samlp:AuthnRequest"));
        assert!(xml.contains("HTTP-Artifact"));
        assert!(xml.contains(AUTHN_CONTEXT_PASSWORD));
        assert!(xml.contains(NAME_ID_FORMAT_TRANSIENT));
    }

    #[test]
    fn missing_destination_is_an_error() {
        let result = AuthnRequestBuilder::new()
            .auto_id()
            .issued_now()
            .issuer("TestSP")
            .consumer_url("http://sp.example/sp/consumer")
            .build();
        assert!(matches!(result, Err(SamlError::MissingField("Destination"))));
    }

    #[test]
    fn redirect_parameter_decodes_to_the_request() {
        let request = request();
        let url = request.redirect_url().unwrap();
        let (base, query) = url.split_once("?SAMLRequest=").unwrap();
        assert_eq!(base, "http://idp.example/idp/sso");

        let encoded = urlencoding::decode(query).unwrap();
        let info = AuthnRequestInfo::decode(&encoded).unwrap();
        assert_eq!(info.id, request.id());
        assert_eq!(info.issuer, "TestSP");
        assert_eq!(info.destination.as_deref(), Some("http://idp.example/idp/sso"));
        assert_eq!(
            info.assertion_consumer_service_url.as_deref(),
            Some("http://sp.example/sp/consumer")
        );
        assert_eq!(info.protocol_binding, Some(ProtocolBinding::Artifact));
    }

    #[test]
    fn request_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..64).map(|_| request().id().to_string()).collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn rejects_non_request_documents() {
        let xml = format!(r#"<samlp:Response xmlns:samlp="{SAMLP_NS}" ID="_x"/>"#);
        assert!(matches!(
            AuthnRequestInfo::parse(xml.as_bytes()),
            Err(SamlError::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn rejects_garbage_encoding() {
        assert!(AuthnRequestInfo::decode("%%%not-base64").is_err());
    }
}
