use libxml::{tree::Node, xpath::Context};
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    elements::{Issuer, Status},
    encryption::EncryptedAssertion,
    utils::{find_value, format_instant, secure_random_id},
    SamlError, STATUS_SUCCESS,
};

/// The `samlp:Response` an artifact stands for.
#[derive(Debug, Clone, YaSerialize)]
#[yaserde(
  rename = "Response",
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
    "xenc" = "http://www.w3.org/2001/04/xmlenc#",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "samlp"
)]
pub struct Response {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "InResponseTo")]
    in_response_to: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "Status", prefix = "samlp")]
    status: Status,
    #[yaserde(rename = "EncryptedAssertion", prefix = "saml")]
    encrypted_assertions: Vec<EncryptedAssertion>,
}

impl Response {
    pub fn new(
        issuer: &str,
        destination: &str,
        in_response_to: &str,
        encrypted_assertions: Vec<EncryptedAssertion>,
    ) -> Result<Self, SamlError> {
        Ok(Response {
            id: secure_random_id(),
            version: "2.0".to_string(),
            issue_instant: format_instant(OffsetDateTime::now_utc())?,
            destination: destination.into(),
            in_response_to: in_response_to.into(),
            issuer: Issuer::entity(issuer),
            status: Status::success(),
            encrypted_assertions,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, YaSerialize)]
#[yaserde(
  rename = "ArtifactResponse",
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
    "xenc" = "http://www.w3.org/2001/04/xmlenc#",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "samlp"
)]
pub struct ArtifactResponse {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "InResponseTo")]
    in_response_to: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "Status", prefix = "samlp")]
    status: Status,
    #[yaserde(rename = "Response", prefix = "samlp")]
    response: Option<Response>,
}

impl ArtifactResponse {
    /// `response` is `None` when the artifact could not be resolved.
    pub fn new(
        issuer: &str,
        in_response_to: &str,
        response: Option<Response>,
    ) -> Result<Self, SamlError> {
        Ok(ArtifactResponse {
            id: secure_random_id(),
            version: "2.0".to_string(),
            issue_instant: format_instant(OffsetDateTime::now_utc())?,
            in_response_to: in_response_to.into(),
            issuer: Issuer::entity(issuer),
            status: Status::success(),
            response,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_message(&self) -> bool {
        self.response.is_some()
    }
}

/// Fails unless the top-level status code under `node` is Success.
pub(crate) fn expect_success(context: &mut Context, node: &Node) -> Result<(), SamlError> {
    match find_value(context, "samlp:Status/samlp:StatusCode/@Value", node) {
        Some(status) if status == STATUS_SUCCESS => Ok(()),
        Some(status) => Err(SamlError::StatusNotSuccess(status)),
        None => Err(SamlError::MissingElement("StatusCode")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        utils::{find_nodes, parse_document, root_element, to_xml, xpath_context},
        STATUS_SUCCESS,
    };

    #[test]
    fn artifact_response_embeds_response() {
        let response = Response::new("TestIDP", "http://sp/consumer", "_req", Vec::new()).unwrap();
        let response_id = response.id().to_string();
        let message = ArtifactResponse::new("TestIDP", "_resolve", Some(response)).unwrap();
        let xml = to_xml(&message).unwrap();

        let document = parse_document(xml.as_bytes()).unwrap();
        let mut context = xpath_context(&document).unwrap();
        let root = root_element(&document).unwrap();
        assert_eq!(root.get_attribute_no_ns("InResponseTo").as_deref(), Some("_resolve"));
        expect_success(&mut context, &root).unwrap();

        let embedded = find_nodes(&mut context, "samlp:Response", &root).unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].get_attribute_no_ns("ID"), Some(response_id));
        assert_eq!(
            embedded[0].get_attribute_no_ns("InResponseTo").as_deref(),
            Some("_req")
        );
        assert!(xml.contains(STATUS_SUCCESS));
    }

    #[test]
    fn empty_artifact_response_has_no_message() {
        let message = ArtifactResponse::new("TestIDP", "_resolve", None).unwrap();
        assert!(!message.has_message());
        assert!(!to_xml(&message).unwrap().contains("samlp:Response"));
    }

    #[test]
    fn non_success_status_is_reported() {
        let xml = format!(
            r#"<samlp:Response xmlns:samlp="{}"><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Requester"/></samlp:Status></samlp:Response>"#,
            crate::SAMLP_NS
        );
        let document = parse_document(xml.as_bytes()).unwrap();
        let mut context = xpath_context(&document).unwrap();
        assert!(matches!(
            expect_success(&mut context, &root_element(&document).unwrap()),
            Err(SamlError::StatusNotSuccess(_))
        ));
    }
}
