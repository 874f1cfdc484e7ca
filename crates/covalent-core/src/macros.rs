/// Implement `Serialize`/`Deserialize` through a type's `Display`/`FromStr`.
///
/// Every identifier travels as its prefixed string form on the wire.
macro_rules! string_serde {
    ($ty:ty) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> ::std::result::Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Parse a fixed-length hex body, used by all `*_z<hex>` identifiers.
pub(crate) fn parse_hex_body<const N: usize>(
    full: &str,
    body: &str,
) -> Result<[u8; N], crate::error::CoreError> {
    let bytes = hex::decode(body)
        .map_err(|e| crate::error::CoreError::invalid_id(full, e.to_string()))?;
    bytes.try_into().map_err(|_| {
        crate::error::CoreError::invalid_id(full, format!("expected {} bytes", N))
    })
}
