//! Binary value encodings used inside row events and payloads

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Encoding applied to every binary-bearing value of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BinaryEncoding {
    /// Values are carried as raw text
    #[default]
    None,
    Base64,
    Hex,
}

impl BinaryEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryEncoding::None => "NONE",
            BinaryEncoding::Base64 => "BASE64",
            BinaryEncoding::Hex => "HEX",
        }
    }

    /// Encode raw bytes into their textual column form
    pub fn encode(&self, bytes: &[u8]) -> String {
        match self {
            BinaryEncoding::None => String::from_utf8_lossy(bytes).into_owned(),
            BinaryEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
            BinaryEncoding::Hex => hex::encode(bytes),
        }
    }

    /// Decode a textual column value back into bytes
    pub fn decode(&self, value: &str) -> std::result::Result<Vec<u8>, String> {
        match self {
            BinaryEncoding::None => Ok(value.as_bytes().to_vec()),
            BinaryEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(value)
                .map_err(|e| format!("invalid base64 value: {}", e)),
            BinaryEncoding::Hex => hex::decode(value).map_err(|e| format!("invalid hex value: {}", e)),
        }
    }
}

impl std::fmt::Display for BinaryEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BinaryEncoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(BinaryEncoding::None),
            "BASE64" => Ok(BinaryEncoding::Base64),
            "HEX" => Ok(BinaryEncoding::Hex),
            other => Err(format!("unknown binary encoding: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodings() {
        let bytes = [0u8, 1, 254, 255];
        for encoding in [BinaryEncoding::Base64, BinaryEncoding::Hex] {
            let text = encoding.encode(&bytes);
            assert_eq!(encoding.decode(&text).unwrap(), bytes);
        }
        assert_eq!(BinaryEncoding::Hex.encode(&[0xde, 0xad]), "dead");
        assert!(BinaryEncoding::Base64.decode("not base64!").is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!("base64".parse::<BinaryEncoding>().unwrap(), BinaryEncoding::Base64);
        assert!("rot13".parse::<BinaryEncoding>().is_err());
    }
}
