use libxml::{tree::Node, xpath::Context};
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    artifact::Artifact,
    elements::Issuer,
    signature::{Signable, Signature},
    utils::{expect_element, format_instant, require_value, secure_random_id},
    SamlError, SAMLP_NS,
};

#[derive(Debug, Clone, YaSerialize)]
#[yaserde(
  rename = "ArtifactResolve",
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "samlp"
)]
pub struct ArtifactResolve {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "Signature", prefix = "ds")]
    signature: Option<Signature>,
    #[yaserde(rename = "Artifact", prefix = "samlp")]
    artifact: String,
}

impl ArtifactResolve {
    /// A fresh, unsigned resolve request for `artifact`.
    pub fn new(issuer: &str, destination: &str, artifact: &Artifact) -> Result<Self, SamlError> {
        Ok(ArtifactResolve {
            id: secure_random_id(),
            version: "2.0".to_string(),
            issue_instant: format_instant(OffsetDateTime::now_utc())?,
            destination: destination.into(),
            issuer: Issuer::entity(issuer),
            signature: None,
            artifact: artifact.value().into(),
        })
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

impl Signable for ArtifactResolve {
    fn id(&self) -> &str {
        &self.id
    }

    fn attach_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }
}

/// The fields the resolution service reads from an incoming `samlp:ArtifactResolve`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactResolveInfo {
    pub id: String,
    pub issuer: String,
    pub issue_instant: String,
    pub destination: Option<String>,
    pub artifact: String,
}

impl ArtifactResolveInfo {
    pub fn from_node(context: &mut Context, node: &Node) -> Result<Self, SamlError> {
        expect_element(node, SAMLP_NS, "ArtifactResolve")?;
        Ok(ArtifactResolveInfo {
            id: node
                .get_attribute_no_ns("ID")
                .ok_or(SamlError::MissingField("ID"))?,
            issuer: require_value(context, "saml:Issuer", node, "Issuer")?,
            issue_instant: node
                .get_attribute_no_ns("IssueInstant")
                .ok_or(SamlError::MissingField("IssueInstant"))?,
            destination: node.get_attribute_no_ns("Destination"),
            artifact: require_value(context, "samlp:Artifact", node, "Artifact")?,
        })
    }
}
