//! JSON payload helpers for typed registrations and typed calls.
//!
//! Everything crossing the history boundary is a `String`; typed APIs go
//! through a [`Codec`] so handlers can work with their own types.

use serde::{de::DeserializeOwned, Serialize};

pub trait Codec {
    fn encode<T: Serialize>(v: &T) -> Result<String, String>;
    fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
}

pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        serde_json::to_string(v).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
    }
}

/// Entity operations may be invoked without input; handlers still receive a
/// well-formed JSON document.
pub(crate) fn decode_optional<T: DeserializeOwned>(s: Option<&str>) -> Result<T, String> {
    Json::decode(s.unwrap_or("null"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_decodes_as_null() {
        let v: Option<i64> = decode_optional(None).unwrap();
        assert_eq!(v, None);
        let unit: () = decode_optional(None).unwrap();
        assert_eq!(unit, ());
    }

    #[test]
    fn decode_error_is_prefixed() {
        let err = Json::decode::<i64>("not json").unwrap_err();
        assert!(err.starts_with("decode:"), "{err}");
    }
}
