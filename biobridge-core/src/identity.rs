//! Identifier types for capture devices and enrolled identities.

use std::fmt;

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

/// Numeric terminal id of a capture device, carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the upstream service when an identity is created.
///
/// Serializes as a string. Deserialization also accepts a JSON integer,
/// since upstream responses and device payloads use either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for IdentityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) if s.is_empty() => Err(serde::de::Error::custom("empty identity id")),
            Raw::Text(s) => Ok(Self(s)),
            Raw::Number(n) => Ok(Self(n.to_string())),
        }
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque biometric template returned by a capture.
///
/// The gateway never inspects the bytes. They travel base64-encoded in
/// upstream request bodies. `Debug` only prints the length.
#[derive(Clone, PartialEq, Eq)]
pub struct Template(Bytes);

impl Template {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(|bytes| Self(Bytes::from(bytes)))
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Template({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_transparent_number() {
        let id = DeviceId::new(541_531_029);
        assert_eq!(serde_json::to_string(&id).unwrap(), "541531029");
        assert_eq!(id.to_string(), "541531029");
    }

    #[test]
    fn identity_id_roundtrip() {
        let id = IdentityId::new("bio-55");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""bio-55""#);
        let parsed: IdentityId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn identity_id_accepts_number() {
        let parsed: IdentityId = serde_json::from_str("55").unwrap();
        assert_eq!(parsed, IdentityId::new("55"));
    }

    #[test]
    fn identity_id_rejects_empty() {
        assert!(serde_json::from_str::<IdentityId>(r#""""#).is_err());
    }

    #[test]
    fn template_base64_roundtrip() {
        let template = Template::new(&b"\x00\x01template-a\xff"[..]);
        let decoded = Template::from_base64(&template.to_base64()).unwrap();
        assert_eq!(decoded, template);
    }

    #[test]
    fn template_rejects_invalid_base64() {
        assert!(Template::from_base64("not base64!").is_err());
    }

    #[test]
    fn template_debug_hides_bytes() {
        let template = Template::new(&b"secret"[..]);
        assert_eq!(format!("{:?}", template), "Template(6 bytes)");
    }
}
