//! Enveloped XML signatures over SAML protocol messages and assertions.
//!
//! Algorithms are fixed: RSA-SHA256 over exclusive-C14N `SignedInfo`, SHA-256
//! reference digests. Anything else found on an incoming signature is rejected.

use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{
    tree::{Document, Node},
    xpath::Context,
};
use sha2::{Digest, Sha256};
use yaserde::YaSerialize;

use crate::{
    c14n::{canonicalize, canonicalize_enveloped},
    credentials::Credential,
    utils::{
        decode_xml_base64, find_nodes, find_value, parse_document, require_value, root_element,
        single_node, to_xml,
    },
    SamlError,
};

pub const SIGNATURE_ALGORITHM: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const DIGEST_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const CANONICALIZATION_ALGORITHM: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE_TRANSFORM: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Debug, Clone, PartialEq, YaSerialize)]
#[yaserde(
  rename = "Signature",
  namespaces = {
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "ds"
)]
pub struct Signature {
    #[yaserde(rename = "SignedInfo", prefix = "ds")]
    signed_info: SignedInfo,
    #[yaserde(rename = "SignatureValue", prefix = "ds")]
    signature_value: String,
}

#[derive(Debug, Clone, PartialEq, YaSerialize)]
#[yaserde(
  rename = "SignedInfo",
  namespaces = {
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "ds"
)]
struct SignedInfo {
    #[yaserde(rename = "CanonicalizationMethod", prefix = "ds")]
    canonicalization_method: AlgorithmRef,
    #[yaserde(rename = "SignatureMethod", prefix = "ds")]
    signature_method: AlgorithmRef,
    #[yaserde(rename = "Reference", prefix = "ds")]
    reference: Reference,
}

#[derive(Debug, Clone, PartialEq, YaSerialize)]
struct Reference {
    #[yaserde(attribute = true, rename = "URI")]
    uri: String,
    #[yaserde(rename = "Transforms", prefix = "ds")]
    transforms: Transforms,
    #[yaserde(rename = "DigestMethod", prefix = "ds")]
    digest_method: AlgorithmRef,
    #[yaserde(rename = "DigestValue", prefix = "ds")]
    digest_value: String,
}

#[derive(Debug, Clone, PartialEq, YaSerialize)]
struct Transforms {
    #[yaserde(rename = "Transform", prefix = "ds")]
    transform: Vec<AlgorithmRef>,
}

#[derive(Debug, Clone, PartialEq, YaSerialize)]
struct AlgorithmRef {
    #[yaserde(attribute = true, rename = "Algorithm")]
    algorithm: String,
}

impl AlgorithmRef {
    fn new(algorithm: &str) -> Self {
        AlgorithmRef {
            algorithm: algorithm.into(),
        }
    }
}

impl SignedInfo {
    fn new(reference_id: &str, digest_value: String) -> Self {
        SignedInfo {
            canonicalization_method: AlgorithmRef::new(CANONICALIZATION_ALGORITHM),
            signature_method: AlgorithmRef::new(SIGNATURE_ALGORITHM),
            reference: Reference {
                uri: format!("#{reference_id}"),
                transforms: Transforms {
                    transform: vec![
                        AlgorithmRef::new(ENVELOPED_SIGNATURE_TRANSFORM),
                        AlgorithmRef::new(CANONICALIZATION_ALGORITHM),
                    ],
                },
                digest_method: AlgorithmRef::new(DIGEST_ALGORITHM),
                digest_value,
            },
        }
    }
}

/// A protocol object that carries an enveloped signature over itself.
pub trait Signable: YaSerialize {
    fn id(&self) -> &str;
    fn attach_signature(&mut self, signature: Signature);
}

/// A message frozen after signing, together with the exact XML the signature covers.
#[derive(Debug, Clone)]
pub struct Signed<T> {
    message: T,
    xml: String,
}

impl<T> Signed<T> {
    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }
}

fn digest(canonical: &str) -> String {
    BASE64_STANDARD.encode(Sha256::digest(canonical.as_bytes()))
}

/// Signs `message` with `credential`. All other fields must be final, the
/// signature covers the whole serialized element.
pub fn sign<T: Signable>(mut message: T, credential: &Credential) -> Result<Signed<T>, SamlError> {
    let unsigned = to_xml(&message)?;
    let document = parse_document(unsigned.as_bytes())?;
    let digest_value = digest(&canonicalize_enveloped(&document, &root_element(&document)?)?);

    let signed_info = SignedInfo::new(message.id(), digest_value);
    let signed_info_document = parse_document(to_xml(&signed_info)?.as_bytes())?;
    let canonical_signed_info = canonicalize(&root_element(&signed_info_document)?)?;
    let signature_value = BASE64_STANDARD.encode(credential.sign(canonical_signed_info.as_bytes())?);

    message.attach_signature(Signature {
        signed_info,
        signature_value,
    });
    let xml = to_xml(&message)?;
    tracing::debug!(id = message.id(), signer = credential.entity_id(), "message signed");
    Ok(Signed { message, xml })
}

/// Checks the SAML signature profile on `element` and returns its `ds:Signature`.
///
/// The signature must be an immediate child of `element`, hold exactly one
/// reference, and that reference must point at `element` itself through an ID
/// that is unique in the document. Anything else is a wrapping attempt.
pub fn validate_signature_profile(context: &mut Context, element: &Node) -> Result<Node, SamlError> {
    let id = element
        .get_attribute_no_ns("ID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SamlError::SignatureProfile("signed element has no ID".into()))?;

    let mut signatures = find_nodes(context, "ds:Signature", element)?;
    let signature = match signatures.len() {
        0 => return Err(SamlError::Unsigned),
        1 => signatures.remove(0),
        n => {
            return Err(SamlError::SignatureProfile(format!(
                "{n} signatures on one element"
            )))
        }
    };

    let references = find_nodes(context, "ds:SignedInfo/ds:Reference", &signature)?;
    if references.len() != 1 {
        return Err(SamlError::SignatureProfile(format!(
            "expected one reference, found {}",
            references.len()
        )));
    }
    let uri = references[0].get_attribute_no_ns("URI").unwrap_or_default();
    if uri != format!("#{id}") {
        return Err(SamlError::SignatureProfile(format!(
            "reference {uri:?} does not point at the enclosing element {id:?}"
        )));
    }

    let same_id = find_nodes(context, &format!("//*[@ID={id:?}]"), element)
        .map_err(|_| SamlError::SignatureProfile("element ID is not a plain token".into()))?;
    if same_id.len() != 1 {
        return Err(SamlError::SignatureProfile(format!(
            "ID {id:?} appears {} times",
            same_id.len()
        )));
    }

    for transform in find_nodes(context, "ds:Transforms/ds:Transform", &references[0])? {
        let algorithm = transform.get_attribute_no_ns("Algorithm").unwrap_or_default();
        if algorithm != ENVELOPED_SIGNATURE_TRANSFORM && algorithm != CANONICALIZATION_ALGORITHM {
            return Err(SamlError::UnsupportedAlgorithm(algorithm));
        }
    }

    Ok(signature)
}

fn expect_algorithm(
    context: &mut Context,
    xpath: &str,
    node: &Node,
    expected: &str,
) -> Result<(), SamlError> {
    let algorithm = find_value(context, xpath, node).unwrap_or_default();
    if algorithm == expected {
        Ok(())
    } else {
        Err(SamlError::UnsupportedAlgorithm(algorithm))
    }
}

/// Verifies the enveloped signature on `element` of `document` against `credential`.
///
/// Structural problems are errors; `Ok(false)` means a well-formed signature
/// whose digest or value does not match.
pub fn verify_signature(
    document: &Document,
    context: &mut Context,
    element: &Node,
    credential: &Credential,
) -> Result<bool, SamlError> {
    let signature = validate_signature_profile(context, element)?;

    expect_algorithm(
        context,
        "ds:SignedInfo/ds:CanonicalizationMethod/@Algorithm",
        &signature,
        CANONICALIZATION_ALGORITHM,
    )?;
    expect_algorithm(
        context,
        "ds:SignedInfo/ds:SignatureMethod/@Algorithm",
        &signature,
        SIGNATURE_ALGORITHM,
    )?;
    expect_algorithm(
        context,
        "ds:SignedInfo/ds:Reference/ds:DigestMethod/@Algorithm",
        &signature,
        DIGEST_ALGORITHM,
    )?;

    let expected_digest = require_value(
        context,
        "ds:SignedInfo/ds:Reference/ds:DigestValue",
        &signature,
        "DigestValue",
    )?;
    if digest(&canonicalize_enveloped(document, element)?)
        != expected_digest.replace(char::is_whitespace, "")
    {
        tracing::warn!(signer = credential.entity_id(), "reference digest mismatch");
        return Ok(false);
    }

    let signed_info = single_node(find_nodes(context, "ds:SignedInfo", &signature)?, "SignedInfo")?;
    let signature_value = require_value(context, "ds:SignatureValue", &signature, "SignatureValue")?;
    let signature_bytes = decode_xml_base64(&signature_value)
        .map_err(|e| SamlError::InvalidEncoding(e.to_string()))?;

    Ok(credential.verify(canonicalize(&signed_info)?.as_bytes(), &signature_bytes))
}
