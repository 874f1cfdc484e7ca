//! Deterministic CBOR for hashing headers and transactions.
//!
//! CoValue ids and session hashes are computed over these bytes, so every
//! replica must produce them identically. The encoding follows RFC 8949
//! core deterministic rules: shortest heads, definite lengths, map keys
//! sorted by their encoded bytes. Floats are always written as 64-bit.

use ciborium::value::{Integer, Value};
use serde::Serialize;

use crate::error::{CoreError, Result};

const UINT: u8 = 0;
const NEGINT: u8 = 1;
const BYTES: u8 = 2;
const TEXT: u8 = 3;
const ARRAY: u8 = 4;
const MAP: u8 = 5;
const TAG: u8 = 6;

const FALSE: u8 = 0xf4;
const TRUE: u8 = 0xf5;
const NULL: u8 = 0xf6;
const FLOAT64: u8 = 0xfb;

/// Encode any serializable value to deterministic CBOR.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = Value::serialized(value).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    let mut encoder = Encoder::default();
    encoder.value(&value)?;
    Ok(encoder.out)
}

#[derive(Default)]
struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    /// A major type and its argument in the shortest form.
    fn head(&mut self, major: u8, arg: u64) {
        let major = major << 5;
        match arg {
            0..=23 => self.out.push(major | arg as u8),
            24..=0xff => self.out.extend([major | 24, arg as u8]),
            0x100..=0xffff => {
                self.out.push(major | 25);
                self.out.extend((arg as u16).to_be_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.out.push(major | 26);
                self.out.extend((arg as u32).to_be_bytes());
            }
            _ => {
                self.out.push(major | 27);
                self.out.extend(arg.to_be_bytes());
            }
        }
    }

    fn integer(&mut self, n: Integer) {
        let n = i128::from(n);
        if n >= 0 {
            self.head(UINT, n as u64);
        } else {
            // -1 is encoded as 0, -2 as 1, ...
            self.head(NEGINT, (-1 - n) as u64);
        }
    }

    fn value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Integer(n) => self.integer(*n),
            Value::Bytes(bytes) => {
                self.head(BYTES, bytes.len() as u64);
                self.out.extend_from_slice(bytes);
            }
            Value::Text(text) => {
                self.head(TEXT, text.len() as u64);
                self.out.extend_from_slice(text.as_bytes());
            }
            Value::Array(items) => {
                self.head(ARRAY, items.len() as u64);
                for item in items {
                    self.value(item)?;
                }
            }
            Value::Map(entries) => self.map(entries)?,
            Value::Bool(b) => self.out.push(if *b { TRUE } else { FALSE }),
            Value::Null => self.out.push(NULL),
            Value::Float(f) => {
                self.out.push(FLOAT64);
                self.out.extend(f.to_be_bytes());
            }
            Value::Tag(tag, inner) => {
                self.head(TAG, *tag);
                self.value(inner)?;
            }
            other => {
                return Err(CoreError::EncodingError(format!(
                    "cannot encode {:?} canonically",
                    other
                )))
            }
        }
        Ok(())
    }

    fn map(&mut self, entries: &[(Value, Value)]) -> Result<()> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let mut key_encoder = Encoder::default();
            key_encoder.value(key)?;
            encoded.push((key_encoder.out, value));
        }
        encoded.sort_by(|a, b| a.0.cmp(&b.0));

        self.head(MAP, encoded.len() as u64);
        for (key, value) in encoded {
            self.out.extend(key);
            self.value(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn head(major: u8, arg: u64) -> Vec<u8> {
        let mut encoder = Encoder::default();
        encoder.head(major, arg);
        encoder.out
    }

    #[test]
    fn test_heads_are_shortest() {
        assert_eq!(head(UINT, 0), vec![0x00]);
        assert_eq!(head(UINT, 23), vec![0x17]);
        assert_eq!(head(UINT, 24), vec![0x18, 24]);
        assert_eq!(head(UINT, 256), vec![0x19, 0x01, 0x00]);
        assert_eq!(head(TEXT, 65_536), vec![0x7a, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_object_key_order_is_irrelevant() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"type":"comap","meta":null,"uniqueness":7}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"uniqueness":7,"type":"comap","meta":null}"#).unwrap();
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
    }

    #[test]
    fn test_negatives_and_floats() {
        assert_eq!(canonical_bytes(&-1i64).unwrap(), vec![0x20]);
        assert_eq!(canonical_bytes(&-25i64).unwrap(), vec![0x38, 24]);
        let bytes = canonical_bytes(&json!(0.5)).unwrap();
        assert_eq!(bytes[0], FLOAT64);
        assert_eq!(bytes.len(), 9);
    }

    #[test]
    fn test_shorter_keys_sort_first() {
        let bytes = canonical_bytes(&json!({"madeAt": 1, "op": 2, "key": 3})).unwrap();
        assert_eq!(bytes[0], 0xa3);
        // "op" (2 bytes) < "key" (3 bytes) < "madeAt" (6 bytes)
        assert_eq!(&bytes[1..4], &[0x62, b'o', b'p']);
        assert_eq!(&bytes[5..9], &[0x63, b'k', b'e', b'y']);
        assert_eq!(&bytes[10..17], &[0x66, b'm', b'a', b'd', b'e', b'A', b't']);
    }
}
