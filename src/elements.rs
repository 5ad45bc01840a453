//! Elements shared by several protocol messages.

use yaserde::YaSerialize;

use crate::{NAME_ID_FORMAT_ENTITY, STATUS_SUCCESS};

#[derive(Debug, Clone, PartialEq, YaSerialize)]
pub struct Issuer {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

impl Issuer {
    pub fn entity(entity_id: &str) -> Self {
        Issuer {
            format: NAME_ID_FORMAT_ENTITY.to_string(),
            content: entity_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, YaSerialize)]
pub struct Status {
    #[yaserde(rename = "StatusCode", prefix = "samlp")]
    status_code: StatusCode,
}

#[derive(Debug, Clone, PartialEq, YaSerialize)]
struct StatusCode {
    #[yaserde(attribute = true, rename = "Value")]
    value: String,
}

impl Status {
    pub fn success() -> Self {
        Status {
            status_code: StatusCode {
                value: STATUS_SUCCESS.into(),
            },
        }
    }
}
