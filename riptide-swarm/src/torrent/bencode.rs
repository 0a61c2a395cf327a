//! Bencode helpers shared by the info dictionary and extension messages
//!
//! Decoding goes through `bencode-rs`; this module adds dictionary boundary
//! scanning (needed for payloads that carry raw bytes after a dictionary)
//! and a small canonical encoder.

use std::collections::{BTreeMap, HashMap};

use super::TorrentError;

pub(crate) type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;

/// Value tree for encoding. Dictionary keys are kept sorted as bencode requires.
#[derive(Debug, Clone, PartialEq)]
pub enum BencodeValue<'a> {
    Integer(i64),
    Bytes(&'a [u8]),
    List(Vec<BencodeValue<'a>>),
    Dictionary(BTreeMap<&'a [u8], BencodeValue<'a>>),
}

impl BencodeValue<'_> {
    /// Encodes into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Appends the encoding of this value to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            BencodeValue::Integer(value) => {
                buf.push(b'i');
                buf.extend_from_slice(value.to_string().as_bytes());
                buf.push(b'e');
            }
            BencodeValue::Bytes(bytes) => {
                buf.extend_from_slice(bytes.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(bytes);
            }
            BencodeValue::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_into(buf);
                }
                buf.push(b'e');
            }
            BencodeValue::Dictionary(entries) => {
                buf.push(b'd');
                for (key, value) in entries {
                    BencodeValue::Bytes(key).encode_into(buf);
                    value.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }
}

/// Parses `data` and returns the root dictionary.
///
/// # Errors
/// - `TorrentError::InvalidMetadata` - Malformed bencode or non-dictionary root
pub fn parse_dictionary(data: &[u8]) -> Result<BencodeDict<'_>, TorrentError> {
    let parsed = bencode_rs::Value::parse(data).map_err(|e| TorrentError::InvalidMetadata {
        reason: format!("Bencode parsing failed: {e:?}"),
    })?;

    match parsed.into_iter().next() {
        Some(bencode_rs::Value::Dictionary(dict)) => Ok(dict),
        Some(_) => Err(TorrentError::InvalidMetadata {
            reason: "Root element must be dictionary".to_string(),
        }),
        None => Err(TorrentError::InvalidMetadata {
            reason: "Empty bencode data".to_string(),
        }),
    }
}

/// Reads an integer field.
pub(crate) fn integer(dict: &BencodeDict<'_>, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(bencode_rs::Value::Integer(value)) => Some(*value),
        _ => None,
    }
}

/// Reads a byte-string field.
pub(crate) fn bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key) {
        Some(bencode_rs::Value::Bytes(value)) => Some(&**value),
        _ => None,
    }
}

/// Finds the end position of a bencode dictionary at the start of `data`.
///
/// # Errors
///
/// - `TorrentError::InvalidMetadata` - If invalid bencode dictionary format
pub fn find_dictionary_end(data: &[u8]) -> Result<usize, TorrentError> {
    if data.is_empty() || data[0] != b'd' {
        return Err(TorrentError::InvalidMetadata {
            reason: "Expected dictionary start".to_string(),
        });
    }

    let mut pos = 1;
    let mut depth = 1;

    while pos < data.len() && depth > 0 {
        match data[pos] {
            b'd' | b'l' => {
                depth += 1;
                pos += 1;
            }
            b'e' => {
                depth -= 1;
                pos += 1;
            }
            b'i' => {
                pos += 1;
                while pos < data.len() && data[pos] != b'e' {
                    pos += 1;
                }
                if pos < data.len() {
                    pos += 1;
                }
            }
            b'0'..=b'9' => {
                let start = pos;
                while pos < data.len() && data[pos] != b':' {
                    pos += 1;
                }
                if pos >= data.len() {
                    return Err(TorrentError::InvalidMetadata {
                        reason: "Invalid string format".to_string(),
                    });
                }

                let length: usize = std::str::from_utf8(&data[start..pos])
                    .ok()
                    .and_then(|text| text.parse().ok())
                    .ok_or_else(|| TorrentError::InvalidMetadata {
                        reason: "Invalid string length".to_string(),
                    })?;

                pos += 1 + length;
            }
            _ => {
                return Err(TorrentError::InvalidMetadata {
                    reason: "Invalid bencode character".to_string(),
                });
            }
        }
    }

    if depth != 0 || pos > data.len() {
        return Err(TorrentError::InvalidMetadata {
            reason: "Incomplete bencode dictionary".to_string(),
        });
    }

    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_dictionary_sorted_keys() {
        let mut entries = BTreeMap::new();
        entries.insert(b"piece".as_slice(), BencodeValue::Integer(3));
        entries.insert(b"msg_type".as_slice(), BencodeValue::Integer(0));
        let encoded = BencodeValue::Dictionary(entries).encode();
        assert_eq!(encoded, b"d8:msg_typei0e5:piecei3ee");
    }

    #[test]
    fn test_find_dictionary_end_trailing_payload_excluded() {
        let payload = b"d8:msg_typei1e5:piecei0eeRAWDATA";
        let end = find_dictionary_end(payload).unwrap();
        assert_eq!(&payload[end..], b"RAWDATA");
    }

    #[test]
    fn test_find_dictionary_end_truncated_input_rejected() {
        assert!(find_dictionary_end(b"d3:abc").is_err());
        assert!(find_dictionary_end(b"d3:abci1e").is_err());
        assert!(find_dictionary_end(b"i1e").is_err());
    }

    #[test]
    fn test_parse_dictionary_non_dictionary_root_rejected() {
        assert!(parse_dictionary(b"li1ee").is_err());
    }

    #[test]
    fn test_parse_dictionary_reads_fields() {
        let dict = parse_dictionary(b"d6:lengthi42e4:name3:abce").unwrap();
        assert_eq!(integer(&dict, b"length"), Some(42));
        assert_eq!(bytes(&dict, b"name"), Some(b"abc".as_slice()));
        assert_eq!(integer(&dict, b"name"), None);
    }
}
