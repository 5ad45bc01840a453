//! The assertion itself: built and signed by the IDP, parsed and checked by the SP.

use libxml::{tree::Node, xpath::Context};
use time::{format_description::well_known::Iso8601, Duration, OffsetDateTime};
use yaserde::YaSerialize;

use crate::{
    elements::Issuer,
    signature::{Signable, Signature},
    utils::{
        expect_element, find_nodes, find_value, format_instant, require_value, secure_random_id,
        single_node,
    },
    SamlError, AUTHN_CONTEXT_PASSWORD, NAME_ID_FORMAT_TRANSIENT, SAML_NS,
    SUBJECT_CONFIRMATION_BEARER,
};

#[derive(Debug, Clone, YaSerialize)]
#[yaserde(
  rename = "Assertion",
  namespaces = {
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
    "xs" = "http://www.w3.org/2001/XMLSchema",
    "xsi" = "http://www.w3.org/2001/XMLSchema-instance",
  },
  prefix = "saml"
)]
pub struct Assertion {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "Signature", prefix = "ds")]
    signature: Option<Signature>,
    #[yaserde(rename = "Subject", prefix = "saml")]
    subject: Subject,
    #[yaserde(rename = "Conditions", prefix = "saml")]
    conditions: Conditions,
    #[yaserde(rename = "AuthnStatement", prefix = "saml")]
    authn_statement: AuthnStatement,
    #[yaserde(rename = "AttributeStatement", prefix = "saml")]
    attribute_statement: Option<AttributeStatement>,
}

#[derive(Debug, Clone, YaSerialize)]
struct Subject {
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameId,
    #[yaserde(rename = "SubjectConfirmation", prefix = "saml")]
    subject_confirmation: SubjectConfirmation,
}

#[derive(Debug, Clone, YaSerialize)]
struct NameId {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    value: String,
}

#[derive(Debug, Clone, YaSerialize)]
struct SubjectConfirmation {
    #[yaserde(attribute = true, rename = "Method")]
    method: String,
    #[yaserde(rename = "SubjectConfirmationData", prefix = "saml")]
    data: SubjectConfirmationData,
}

#[derive(Debug, Clone, YaSerialize)]
struct SubjectConfirmationData {
    #[yaserde(attribute = true, rename = "Recipient")]
    recipient: String,
    #[yaserde(attribute = true, rename = "InResponseTo")]
    in_response_to: String,
    #[yaserde(attribute = true, rename = "NotOnOrAfter")]
    not_on_or_after: String,
}

#[derive(Debug, Clone, YaSerialize)]
struct Conditions {
    #[yaserde(attribute = true, rename = "NotBefore")]
    not_before: String,
    #[yaserde(attribute = true, rename = "NotOnOrAfter")]
    not_on_or_after: String,
    #[yaserde(rename = "AudienceRestriction", prefix = "saml")]
    audience_restriction: AudienceRestriction,
}

#[derive(Debug, Clone, YaSerialize)]
struct AudienceRestriction {
    #[yaserde(rename = "Audience", prefix = "saml")]
    audiences: Vec<String>,
}

#[derive(Debug, Clone, YaSerialize)]
struct AuthnStatement {
    #[yaserde(attribute = true, rename = "AuthnInstant")]
    authn_instant: String,
    #[yaserde(attribute = true, rename = "SessionIndex")]
    session_index: String,
    #[yaserde(rename = "AuthnContext", prefix = "saml")]
    authn_context: AuthnContext,
}

#[derive(Debug, Clone, YaSerialize)]
struct AuthnContext {
    #[yaserde(rename = "AuthnContextClassRef", prefix = "saml")]
    class_ref: String,
}

#[derive(Debug, Clone, YaSerialize)]
struct AttributeStatement {
    #[yaserde(rename = "Attribute", prefix = "saml")]
    attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, YaSerialize)]
struct Attribute {
    #[yaserde(attribute = true, rename = "Name")]
    name: String,
    #[yaserde(rename = "AttributeValue", prefix = "saml")]
    values: Vec<AttributeValue>,
}

#[derive(Debug, Clone, YaSerialize)]
#[yaserde(
  rename = "AttributeValue",
  namespaces = {
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
    "xsi" = "http://www.w3.org/2001/XMLSchema-instance",
  },
  prefix = "saml"
)]
struct AttributeValue {
    #[yaserde(attribute = true, rename = "type", prefix = "xsi")]
    xsi_type: String,
    #[yaserde(text = true)]
    value: String,
}

impl AttributeValue {
    fn string(value: String) -> Self {
        AttributeValue {
            xsi_type: "xs:string".into(),
            value,
        }
    }
}

impl Signable for Assertion {
    fn id(&self) -> &str {
        &self.id
    }

    fn attach_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }
}

#[derive(Default)]
pub struct AssertionBuilder {
    issuer: Option<String>,
    name_id: Option<String>,
    recipient: Option<String>,
    in_response_to: Option<String>,
    audience: Option<String>,
    lifetime: Option<Duration>,
    issue_instant: Option<OffsetDateTime>,
    attributes: Vec<(String, Vec<String>)>,
}

impl AssertionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AssertionBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn name_id(self, name_id: &str) -> Self {
        AssertionBuilder {
            name_id: Some(name_id.into()),
            ..self
        }
    }

    /// A random transient identifier for the subject.
    pub fn transient_name_id(self) -> Self {
        AssertionBuilder {
            name_id: Some(secure_random_id()),
            ..self
        }
    }

    pub fn recipient(self, consumer_url: &str) -> Self {
        AssertionBuilder {
            recipient: Some(consumer_url.into()),
            ..self
        }
    }

    pub fn in_response_to(self, request_id: &str) -> Self {
        AssertionBuilder {
            in_response_to: Some(request_id.into()),
            ..self
        }
    }

    pub fn audience(self, audience: &str) -> Self {
        AssertionBuilder {
            audience: Some(audience.into()),
            ..self
        }
    }

    pub fn lifetime(self, lifetime: Duration) -> Self {
        AssertionBuilder {
            lifetime: Some(lifetime),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AssertionBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn attribute(mut self, name: &str, value: &str) -> Self {
        match self.attributes.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push(value.into()),
            None => self.attributes.push((name.into(), vec![value.into()])),
        }
        self
    }

    pub fn build(self) -> Result<Assertion, SamlError> {
        let now = self.issue_instant.unwrap_or_else(OffsetDateTime::now_utc);
        let lifetime = self.lifetime.ok_or(SamlError::MissingField("lifetime"))?;
        let issued = format_instant(now)?;
        let expires = format_instant(now + lifetime)?;
        let in_response_to = self
            .in_response_to
            .ok_or(SamlError::MissingField("InResponseTo"))?;

        Ok(Assertion {
            id: secure_random_id(),
            version: "2.0".to_string(),
            issue_instant: issued.clone(),
            issuer: Issuer::entity(&self.issuer.ok_or(SamlError::MissingField("Issuer"))?),
            signature: None,
            subject: Subject {
                name_id: NameId {
                    format: NAME_ID_FORMAT_TRANSIENT.into(),
                    value: self.name_id.ok_or(SamlError::MissingField("NameID"))?,
                },
                subject_confirmation: SubjectConfirmation {
                    method: SUBJECT_CONFIRMATION_BEARER.into(),
                    data: SubjectConfirmationData {
                        recipient: self.recipient.ok_or(SamlError::MissingField("Recipient"))?,
                        in_response_to,
                        not_on_or_after: expires.clone(),
                    },
                },
            },
            conditions: Conditions {
                not_before: issued.clone(),
                not_on_or_after: expires,
                audience_restriction: AudienceRestriction {
                    audiences: vec![self.audience.ok_or(SamlError::MissingField("Audience"))?],
                },
            },
            authn_statement: AuthnStatement {
                authn_instant: issued,
                session_index: secure_random_id(),
                authn_context: AuthnContext {
                    class_ref: AUTHN_CONTEXT_PASSWORD.into(),
                },
            },
            attribute_statement: (!self.attributes.is_empty()).then(|| AttributeStatement {
                attributes: self
                    .attributes
                    .into_iter()
                    .map(|(name, values)| Attribute {
                        name,
                        values: values.into_iter().map(AttributeValue::string).collect(),
                    })
                    .collect(),
            }),
        })
    }
}

/// What the SP takes away from a verified assertion.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionInfo {
    pub id: String,
    pub issuer: String,
    pub name_id: String,
    pub session_index: Option<String>,
    pub authn_instant: Option<String>,
    pub authn_context_class: Option<String>,
    pub attributes: Vec<(String, Vec<String>)>,
}

impl AssertionInfo {
    pub fn from_node(context: &mut Context, node: &Node) -> Result<Self, SamlError> {
        expect_element(node, SAML_NS, "Assertion")?;

        let mut attributes = Vec::new();
        for attribute in find_nodes(context, "saml:AttributeStatement/saml:Attribute", node)? {
            let name = attribute
                .get_attribute_no_ns("Name")
                .ok_or(SamlError::MissingField("Name"))?;
            let values = find_nodes(context, "saml:AttributeValue", &attribute)?
                .iter()
                .map(|value| value.get_content().trim().to_string())
                .collect();
            attributes.push((name, values));
        }

        Ok(AssertionInfo {
            id: node
                .get_attribute_no_ns("ID")
                .ok_or(SamlError::MissingField("ID"))?,
            issuer: require_value(context, "saml:Issuer", node, "Issuer")?,
            name_id: require_value(context, "saml:Subject/saml:NameID", node, "NameID")?,
            session_index: find_value(context, "saml:AuthnStatement/@SessionIndex", node),
            authn_instant: find_value(context, "saml:AuthnStatement/@AuthnInstant", node),
            authn_context_class: find_value(
                context,
                "saml:AuthnStatement/saml:AuthnContext/saml:AuthnContextClassRef",
                node,
            ),
            attributes,
        })
    }
}

fn parse_instant(value: &str, field: &str) -> Result<OffsetDateTime, SamlError> {
    OffsetDateTime::parse(value, &Iso8601::DEFAULT)
        .map_err(|_| SamlError::ConditionNotMet(format!("malformed {field} {value:?}")))
}

/// Checks the `saml:Conditions` of `assertion`: the validity window, widened by
/// `clock_skew` on both sides, and every audience restriction.
pub fn check_conditions(
    context: &mut Context,
    assertion: &Node,
    now: OffsetDateTime,
    clock_skew: Duration,
    audience: &str,
) -> Result<(), SamlError> {
    let conditions = single_node(find_nodes(context, "saml:Conditions", assertion)?, "Conditions")?;

    if let Some(not_before) = find_value(context, "@NotBefore", &conditions) {
        if now + clock_skew < parse_instant(&not_before, "NotBefore")? {
            return Err(SamlError::ConditionNotMet(format!(
                "assertion not valid before {not_before}"
            )));
        }
    }

    if let Some(not_on_or_after) = find_value(context, "@NotOnOrAfter", &conditions) {
        if now - clock_skew >= parse_instant(&not_on_or_after, "NotOnOrAfter")? {
            return Err(SamlError::ConditionNotMet(format!(
                "assertion expired at {not_on_or_after}"
            )));
        }
    }

    for restriction in find_nodes(context, "saml:AudienceRestriction", &conditions)? {
        let audiences: Vec<String> = find_nodes(context, "saml:Audience", &restriction)?
            .iter()
            .map(|node| node.get_content().trim().to_string())
            .collect();
        if !audiences.iter().any(|a| a == audience) {
            return Err(SamlError::ConditionNotMet(format!(
                "audience {audience:?} not in {audiences:?}"
            )));
        }
    }

    Ok(())
}

/// The SP's expectations for an assertion it is about to trust.
#[derive(Debug, Clone)]
pub struct AssertionValidation {
    pub idp_entity_id: String,
    pub audience: String,
    pub recipient: String,
    pub in_response_to: String,
    pub clock_skew: Duration,
    pub now: OffsetDateTime,
}

impl AssertionValidation {
    pub fn validate(&self, context: &mut Context, assertion: &Node) -> Result<(), SamlError> {
        let issuer = require_value(context, "saml:Issuer", assertion, "Issuer")?;
        if issuer != self.idp_entity_id {
            return Err(SamlError::InvalidIssuer(issuer));
        }

        check_conditions(context, assertion, self.now, self.clock_skew, &self.audience)?;
        self.check_subject_confirmation(context, assertion)
    }

    fn check_subject_confirmation(
        &self,
        context: &mut Context,
        assertion: &Node,
    ) -> Result<(), SamlError> {
        let data = single_node(
            find_nodes(
                context,
                &format!(
                    "saml:Subject/saml:SubjectConfirmation[@Method={SUBJECT_CONFIRMATION_BEARER:?}]/saml:SubjectConfirmationData"
                ),
                assertion,
            )?,
            "SubjectConfirmationData",
        )?;

        let recipient = data.get_attribute_no_ns("Recipient").unwrap_or_default();
        if recipient != self.recipient {
            return Err(SamlError::ConditionNotMet(format!(
                "bearer recipient {recipient:?} is not this consumer"
            )));
        }

        let in_response_to = data.get_attribute_no_ns("InResponseTo").unwrap_or_default();
        if in_response_to != self.in_response_to {
            return Err(SamlError::Correlation(format!(
                "bearer confirmation answers {in_response_to:?}, expected {:?}",
                self.in_response_to
            )));
        }

        let not_on_or_after = data.get_attribute_no_ns("NotOnOrAfter").ok_or_else(|| {
            SamlError::ConditionNotMet("bearer confirmation has no NotOnOrAfter".into())
        })?;
        if self.now - self.clock_skew >= parse_instant(&not_on_or_after, "NotOnOrAfter")? {
            return Err(SamlError::ConditionNotMet(format!(
                "bearer confirmation expired at {not_on_or_after}"
            )));
        }

        Ok(())
    }
}
