//! SOAP 1.1 envelopes for the back channel.

use libxml::{
    tree::{Node, NodeType},
    xpath::Context,
};

use crate::{
    utils::{find_nodes, single_node, strip_xml_declaration},
    SamlError, SOAP11_NS,
};

pub const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";
pub const SOAP_ACTION: &str = "http://www.oasis-open.org/committees/security";

/// Wraps a serialized protocol message in an envelope body.
pub fn wrap_in_soap_envelope(message_xml: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soap11:Envelope xmlns:soap11="{SOAP11_NS}"><soap11:Body>{}</soap11:Body></soap11:Envelope>"#,
        strip_xml_declaration(message_xml)
    )
}

/// Returns the only element inside the envelope body of `envelope`.
pub fn unwrap_soap_body(context: &mut Context, envelope: &Node) -> Result<Node, SamlError> {
    let body = single_node(
        find_nodes(context, "/soap11:Envelope/soap11:Body", envelope)?,
        "Body",
    )?;
    let elements: Vec<Node> = body
        .get_child_nodes()
        .into_iter()
        .filter(|child| child.get_type() == Some(NodeType::ElementNode))
        .collect();
    match elements.len() {
        1 => Ok(elements.into_iter().next().ok_or(SamlError::MissingElement("Body"))?),
        0 => Err(SamlError::EmptyResponse),
        n => Err(SamlError::UnexpectedMessage(format!(
            "SOAP body holds {n} elements"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        utils::{parse_document, root_element, xpath_context},
        SAMLP_NS,
    };

    fn unwrap(xml: &str) -> Result<String, SamlError> {
        let document = parse_document(xml.as_bytes())?;
        let mut context = xpath_context(&document)?;
        let node = unwrap_soap_body(&mut context, &root_element(&document)?)?;
        Ok(node.get_name())
    }

    #[test]
    fn envelope_round_trips_message() {
        let message = format!(
            r#"<?xml version="1.0" encoding="utf-8"?><samlp:ArtifactResponse xmlns:samlp="{SAMLP_NS}" ID="_r"/>"#
        );
        let envelope = wrap_in_soap_envelope(&message);
        assert_eq!(envelope.matches("<?xml").count(), 1);
        assert_eq!(unwrap(&envelope).unwrap(), "ArtifactResponse");
    }

    #[test]
    fn empty_body_is_a_transport_failure() {
        assert!(matches!(
            unwrap(&wrap_in_soap_envelope("")),
            Err(SamlError::EmptyResponse)
        ));
    }

    #[test]
    fn two_messages_are_rejected() {
        let envelope = wrap_in_soap_envelope("<a/><b/>");
        assert!(matches!(
            unwrap(&envelope),
            Err(SamlError::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn non_envelope_is_rejected() {
        assert!(unwrap("<Envelope><Body><x/></Body></Envelope>").is_err());
    }
}
