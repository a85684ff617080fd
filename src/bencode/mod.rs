mod decoder;
mod encoder;
mod value;

pub use decoder::{decode, decode_prefix, value_span};
pub use encoder::encode;
pub use value::BencodeValue;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_integer_encoding() {
        let value = BencodeValue::Integer(42);
        let encoded = encode(&value);
        assert_eq!(encoded, b"i42e");
    }

    #[test]
    fn test_string_encoding() {
        let value = BencodeValue::String(b"spam".to_vec());
        let encoded = encode(&value);
        assert_eq!(encoded, b"4:spam");
    }

    #[test]
    fn test_dict_encoding_sorts_keys() {
        let mut dict = BTreeMap::new();
        dict.insert(b"a".to_vec(), BencodeValue::Integer(1));
        dict.insert(b"b".to_vec(), BencodeValue::String(b"xy".to_vec()));
        let value = BencodeValue::Dict(dict);
        let encoded = encode(&value);
        assert_eq!(encoded, b"d1:ai1e1:b2:xye");

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_roundtrip() {
        let original = BencodeValue::List(vec![
            BencodeValue::Integer(-123),
            BencodeValue::String(b"test".to_vec()),
            BencodeValue::Dict(BTreeMap::new()),
        ]);
        let encoded = encode(&original);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_canonical_input_reencodes_identically() {
        let canonical = b"d3:bar4:spam3:fooi42ee";
        let decoded = decode(canonical).unwrap();
        assert_eq!(encode(&decoded), canonical);
    }

    #[test]
    fn test_non_canonical_key_order_is_normalized() {
        // Unsorted keys are accepted on decode but re-encode sorted
        let unsorted = b"d3:fooi42e3:bar4:spame";
        let decoded = decode(unsorted).unwrap();
        assert_eq!(encode(&decoded), b"d3:bar4:spam3:fooi42ee");
    }

    #[test]
    fn test_rejects_invalid_integers() {
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i12").is_err());
        assert!(decode(b"i-42e").is_ok());
        assert!(decode(b"i0e").is_ok());
    }

    #[test]
    fn test_rejects_structural_violations() {
        assert!(decode(b"").is_err());
        assert!(decode(b"x").is_err());
        assert!(decode(b"5:spam").is_err());
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"di1e4:spame").is_err());
        assert!(decode(b"i1ei2e").is_err()); // trailing document
    }

    #[test]
    fn test_value_span_preserves_source_bytes() {
        let data = b"d4:infod6:lengthi6ee8:trailingi1ee";
        let span = value_span(data, b"info").unwrap();
        assert_eq!(&data[span], b"d6:lengthi6ee");
    }

    #[test]
    fn test_value_span_skips_nested_terminators() {
        // The value before the wanted key contains 'e' bytes inside a string
        let data = b"d1:a7:literal4:infoi7ee";
        let span = value_span(data, b"info").unwrap();
        assert_eq!(&data[span], b"i7e");
    }

    #[test]
    fn test_value_span_missing_key() {
        assert!(value_span(b"d1:ai1ee", b"info").is_err());
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let data = b"d1:ai1eeTRAILING";
        let (value, consumed) = decode_prefix(data).unwrap();
        assert_eq!(consumed, 8);
        assert!(value.as_dict().is_some());
        assert!(decode(data).is_err());
    }
}
