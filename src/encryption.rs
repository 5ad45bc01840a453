//! XML encryption of assertions for the relying party.
//!
//! The content key travels inline as an `xenc:EncryptedKey` inside the
//! `ds:KeyInfo` of the `xenc:EncryptedData`; no external key lookup happens.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{tree::Node, xpath::Context};
use rand::{rngs::OsRng, RngCore};
use yaserde::YaSerialize;

use crate::{
    credentials::Credential,
    utils::{decode_xml_base64, find_value, require_value},
    SamlError,
};

pub const BLOCK_ENCRYPTION_ALGORITHM: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";
pub const KEY_TRANSPORT_ALGORITHM: &str = "http://www.w3.org/2009/xmlenc11#rsa-oaep";
pub const KEY_TRANSPORT_DIGEST: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const ENCRYPTED_ELEMENT_TYPE: &str = "http://www.w3.org/2001/04/xmlenc#Element";
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, YaSerialize)]
#[yaserde(
  rename = "EncryptedAssertion",
  namespaces = {
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
    "xenc" = "http://www.w3.org/2001/04/xmlenc#",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "saml"
)]
pub struct EncryptedAssertion {
    #[yaserde(rename = "EncryptedData", prefix = "xenc")]
    encrypted_data: EncryptedData,
}

#[derive(Debug, Clone, YaSerialize)]
struct EncryptedData {
    #[yaserde(attribute = true, rename = "Type")]
    data_type: String,
    #[yaserde(rename = "EncryptionMethod", prefix = "xenc")]
    encryption_method: EncryptionMethod,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
    #[yaserde(rename = "CipherData", prefix = "xenc")]
    cipher_data: CipherData,
}

#[derive(Debug, Clone, YaSerialize)]
struct EncryptionMethod {
    #[yaserde(attribute = true, rename = "Algorithm")]
    algorithm: String,
    #[yaserde(rename = "DigestMethod", prefix = "ds")]
    digest_method: Option<DigestMethod>,
}

#[derive(Debug, Clone, YaSerialize)]
struct DigestMethod {
    #[yaserde(attribute = true, rename = "Algorithm")]
    algorithm: String,
}

#[derive(Debug, Clone, YaSerialize)]
struct KeyInfo {
    #[yaserde(rename = "EncryptedKey", prefix = "xenc")]
    encrypted_key: EncryptedKey,
}

#[derive(Debug, Clone, YaSerialize)]
struct EncryptedKey {
    #[yaserde(rename = "EncryptionMethod", prefix = "xenc")]
    encryption_method: EncryptionMethod,
    #[yaserde(rename = "CipherData", prefix = "xenc")]
    cipher_data: CipherData,
}

#[derive(Debug, Clone, YaSerialize)]
struct CipherData {
    #[yaserde(rename = "CipherValue", prefix = "xenc")]
    cipher_value: String,
}

/// Encrypts a serialized assertion so that only `recipient` can read it.
pub fn encrypt(plaintext: &str, recipient: &Credential) -> Result<EncryptedAssertion, SamlError> {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| SamlError::Credential(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| SamlError::Credential("content encryption failed".into()))?;
    let mut payload = nonce.to_vec();
    payload.extend_from_slice(&ciphertext);

    let wrapped_key = recipient.wrap_key(&key)?;
    tracing::debug!(recipient = recipient.entity_id(), "assertion encrypted");

    Ok(EncryptedAssertion {
        encrypted_data: EncryptedData {
            data_type: ENCRYPTED_ELEMENT_TYPE.into(),
            encryption_method: EncryptionMethod {
                algorithm: BLOCK_ENCRYPTION_ALGORITHM.into(),
                digest_method: None,
            },
            key_info: KeyInfo {
                encrypted_key: EncryptedKey {
                    encryption_method: EncryptionMethod {
                        algorithm: KEY_TRANSPORT_ALGORITHM.into(),
                        digest_method: Some(DigestMethod {
                            algorithm: KEY_TRANSPORT_DIGEST.into(),
                        }),
                    },
                    cipher_data: CipherData {
                        cipher_value: BASE64_STANDARD.encode(wrapped_key),
                    },
                },
            },
            cipher_data: CipherData {
                cipher_value: BASE64_STANDARD.encode(payload),
            },
        },
    })
}

fn expect_algorithm(actual: Option<String>, expected: &str) -> Result<(), SamlError> {
    match actual {
        Some(algorithm) if algorithm == expected => Ok(()),
        Some(algorithm) => Err(SamlError::UnsupportedAlgorithm(algorithm)),
        None => Err(SamlError::MissingElement("EncryptionMethod")),
    }
}

fn decode_cipher_value(value: &str) -> Result<Vec<u8>, SamlError> {
    decode_xml_base64(value).map_err(|e| SamlError::Decryption(e.to_string()))
}

/// Decrypts the `saml:EncryptedAssertion` at `node` with `credential`'s private key.
pub fn decrypt(
    context: &mut Context,
    node: &Node,
    credential: &Credential,
) -> Result<String, SamlError> {
    expect_algorithm(
        find_value(context, "xenc:EncryptedData/xenc:EncryptionMethod/@Algorithm", node),
        BLOCK_ENCRYPTION_ALGORITHM,
    )?;
    let encrypted_key = "xenc:EncryptedData/ds:KeyInfo/xenc:EncryptedKey";
    expect_algorithm(
        find_value(
            context,
            &format!("{encrypted_key}/xenc:EncryptionMethod/@Algorithm"),
            node,
        ),
        KEY_TRANSPORT_ALGORITHM,
    )?;
    expect_algorithm(
        find_value(
            context,
            &format!("{encrypted_key}/xenc:EncryptionMethod/ds:DigestMethod/@Algorithm"),
            node,
        ),
        KEY_TRANSPORT_DIGEST,
    )?;

    let wrapped_key = decode_cipher_value(&require_value(
        context,
        &format!("{encrypted_key}/xenc:CipherData/xenc:CipherValue"),
        node,
        "EncryptedKey",
    )?)?;
    let payload = decode_cipher_value(&require_value(
        context,
        "xenc:EncryptedData/xenc:CipherData/xenc:CipherValue",
        node,
        "CipherValue",
    )?)?;
    if payload.len() <= NONCE_LEN {
        return Err(SamlError::Decryption("cipher value too short".into()));
    }

    let key = credential.unwrap_key(&wrapped_key)?;
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| SamlError::Decryption(e.to_string()))?;
    let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SamlError::Decryption("authentication tag mismatch".into()))?;

    String::from_utf8(plaintext).map_err(|e| SamlError::Decryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credentials::fixtures::*,
        utils::{parse_document, root_element, to_xml, xpath_context},
    };

    const ASSERTION: &str = r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_a1"><saml:Issuer>TestIDP</saml:Issuer></saml:Assertion>"#;

    fn decrypt_with(encrypted: &EncryptedAssertion, credential: &Credential) -> Result<String, SamlError> {
        let xml = to_xml(encrypted)?;
        let document = parse_document(xml.as_bytes())?;
        let mut context = xpath_context(&document)?;
        decrypt(&mut context, &root_element(&document)?, credential)
    }

    #[test]
    fn decrypts_back_to_the_assertion() {
        let recipient = Credential::from_public_pem(SP_ENTITY_ID, SP_PUB).unwrap();
        let encrypted = encrypt(ASSERTION, &recipient).unwrap();
        assert_eq!(decrypt_with(&encrypted, &sp()).unwrap(), ASSERTION);
    }

    #[test]
    fn other_private_key_cannot_decrypt() {
        let recipient = Credential::from_public_pem(SP_ENTITY_ID, SP_PUB).unwrap();
        let encrypted = encrypt(ASSERTION, &recipient).unwrap();
        assert!(matches!(
            decrypt_with(&encrypted, &idp()),
            Err(SamlError::Decryption(_))
        ));
    }

    #[test]
    fn ciphertext_is_not_the_plaintext() {
        let recipient = Credential::from_public_pem(SP_ENTITY_ID, SP_PUB).unwrap();
        let xml = to_xml(&encrypt(ASSERTION, &recipient).unwrap()).unwrap();
        assert!(!xml.contains("TestIDP"));
        assert!(xml.contains(KEY_TRANSPORT_ALGORITHM));
    }
}
