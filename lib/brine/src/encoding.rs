/// Base64 helpers for serializing fixed byte arrays in configuration files.
pub mod base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    #[inline]
    pub fn encode(bytes: &[u8]) -> String {
        ::base64::encode(bytes)
    }

    #[inline]
    pub fn decode(encoded: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(encoded)
    }

    #[inline]
    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&encode(bytes))
    }

    #[inline]
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = <&str>::deserialize(deserializer)?;
        decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::base64;

    #[test]
    fn test_roundtrip() {
        let data = [1u8, 2, 3, 250, 251, 252];
        let encoded = base64::encode(&data);
        assert_eq!(base64::decode(&encoded).unwrap(), &data[..]);
    }
}
