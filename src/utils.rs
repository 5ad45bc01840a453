use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{
    parser::Parser as XmlParser,
    tree::{Document, Node},
    xpath::Context,
};
use rand::{
    distributions::{Alphanumeric, DistString},
    rngs::OsRng,
    RngCore,
};
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{SamlError, DATE_TIME_FORMAT, DSIG_NS, SAMLP_NS, SAML_NS, SOAP11_NS, XENC_NS};

pub fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// 128 bits from the OS generator, hex encoded. The leading underscore keeps it a valid xs:ID.
pub fn secure_random_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("_{}", hex::encode(bytes))
}

pub fn single_node(mut nodes: Vec<Node>, element: &'static str) -> Result<Node, SamlError> {
    match nodes.len() {
        0 => Err(SamlError::MissingElement(element)),
        1 => Ok(nodes.remove(0)),
        _ => Err(SamlError::UnexpectedMessage(format!(
            "expected a single {element}, found {}",
            nodes.len()
        ))),
    }
}

pub fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

pub fn parse_document(input: &[u8]) -> Result<Document, SamlError> {
    let parser = XmlParser::default();
    parser
        .parse_string(input)
        .map_err(|e| SamlError::InvalidXml(format!("{e:?}")))
}

pub fn root_element(document: &Document) -> Result<Node, SamlError> {
    document
        .get_root_element()
        .ok_or(SamlError::MissingElement("document root"))
}

/// XPath context with every prefix used by this crate registered.
pub fn xpath_context(document: &Document) -> Result<Context, SamlError> {
    let mut context = Context::new(document)
        .map_err(|_| SamlError::InvalidXml("failed to create XPath context".into()))?;
    for (prefix, href) in [
        ("samlp", SAMLP_NS),
        ("saml", SAML_NS),
        ("ds", DSIG_NS),
        ("xenc", XENC_NS),
        ("soap11", SOAP11_NS),
    ] {
        context
            .register_namespace(prefix, href)
            .map_err(|_| SamlError::InvalidXml(format!("failed to register {prefix}")))?;
    }
    Ok(context)
}

/// String value of `xpath` evaluated against `node`; an empty result counts as absent.
pub fn find_value(context: &mut Context, xpath: &str, node: &Node) -> Option<String> {
    context
        .findvalue(xpath, Some(node))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn require_value(
    context: &mut Context,
    xpath: &str,
    node: &Node,
    element: &'static str,
) -> Result<String, SamlError> {
    find_value(context, xpath, node).ok_or(SamlError::MissingElement(element))
}

pub fn find_nodes(context: &mut Context, xpath: &str, node: &Node) -> Result<Vec<Node>, SamlError> {
    context
        .findnodes(xpath, Some(node))
        .map_err(|_| SamlError::InvalidXml(format!("XPath evaluation failed: {xpath}")))
}

pub fn is_element(node: &Node, namespace: &str, name: &str) -> bool {
    node.get_name() == name
        && node
            .get_namespace()
            .map(|ns| ns.get_href() == namespace)
            .unwrap_or(false)
}

pub fn expect_element(node: &Node, namespace: &str, name: &'static str) -> Result<(), SamlError> {
    if is_element(node, namespace, name) {
        Ok(())
    } else {
        Err(SamlError::UnexpectedMessage(format!(
            "expected {name}, found {}",
            node.get_name()
        )))
    }
}

pub fn to_xml<T: YaSerialize>(value: &T) -> Result<String, SamlError> {
    yaserde::ser::to_string(value).map_err(SamlError::Serialization)
}

pub fn strip_xml_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    match trimmed.strip_prefix("<?xml") {
        Some(rest) => match rest.find("?>") {
            Some(end) => rest[end + 2..].trim_start(),
            None => trimmed,
        },
        None => trimmed,
    }
}

pub fn format_instant(instant: OffsetDateTime) -> Result<String, SamlError> {
    instant
        .format(&DATE_TIME_FORMAT)
        .map_err(|e| SamlError::Serialization(e.to_string()))
}

pub fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
