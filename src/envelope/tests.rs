use super::*;
use serde_json::json;

fn sample() -> Envelope {
    Envelope::builder()
        .field("str", "hello")
        .field("int", 2)
        .field("float", 55.5)
        .field("bool", true)
        .field(
            "nested",
            Value::Object(BTreeMap::from([
                ("list".to_string(), Value::from(vec![Value::from(1), Value::from("two")])),
                ("flag".to_string(), Value::from(false)),
            ])),
        )
        .named_blob("frame", vec![0u8, 159, 146, 150])
        .blob(Bytes::from_static(b"HELLO"))
        .build()
        .unwrap()
}

#[test]
fn test_round_trip_preserves_values_and_blobs() {
    let env = sample();
    let decoded = codec::decode(codec::encode(&env).unwrap()).unwrap();
    assert_eq!(decoded, env);
}

#[test]
fn test_round_trip_keeps_integral_numbers_as_floats() {
    let env = Envelope::builder().field("n", 2).build().unwrap();
    let decoded = codec::decode(codec::encode(&env).unwrap()).unwrap();
    assert_eq!(decoded.get("n"), Some(&Value::Number(2.0)));
    assert_eq!(decoded.get("n").and_then(Value::as_f64), Some(2.0));
}

#[test]
fn test_round_trip_preserves_float_bits() {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut checked = 0;
    while checked < 50_000 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let n = f64::from_bits(state);
        if !n.is_finite() {
            continue;
        }

        let env = Envelope::builder().field("n", n).build().unwrap();
        let decoded = codec::decode(codec::encode(&env).unwrap()).unwrap();
        let bits = decoded.get("n").and_then(Value::as_f64).map(f64::to_bits);
        assert_eq!(bits, Some(n.to_bits()), "{n:e} changed on the wire");
        checked += 1;
    }

    for n in [0.1, 1.0 / 3.0, f64::MIN_POSITIVE, 5e-324, f64::MAX, f64::MIN, 1e300] {
        let env = Envelope::builder().field("n", n).build().unwrap();
        let decoded = codec::decode(codec::encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.get("n").and_then(Value::as_f64), Some(n));
    }
}

#[test]
fn test_round_trip_blob_only() {
    let env = Envelope::builder().blob(vec![1u8, 2, 3]).build().unwrap();
    assert_eq!(env.content_type(), ContentType::Blob);
    let decoded = codec::decode(codec::encode(&env).unwrap()).unwrap();
    assert_eq!(decoded, env);
}

#[test]
fn test_from_json_accepts_value_union() {
    let env = Envelope::from_json(
        json!({"str": "hello", "int": 2, "float": 55.5, "bool": true, "arr": [1, {"k": "v"}]}),
        vec![],
    )
    .unwrap();

    assert_eq!(env.get("str").and_then(Value::as_str), Some("hello"));
    assert_eq!(env.get("int"), Some(&Value::Number(2.0)));
    assert_eq!(env.get("bool").and_then(Value::as_bool), Some(true));
    assert_eq!(env.get("arr").and_then(Value::as_array).map(<[_]>::len), Some(2));
}

#[test]
fn test_from_json_rejects_null_with_path() {
    let err = Envelope::from_json(json!({"outer": {"inner": [1, null]}}), vec![]).unwrap_err();
    match err {
        EnvelopeError::InvalidValueType { path, .. } => assert_eq!(path, "outer.inner[1]"),
    }
}

#[test]
fn test_from_json_rejects_non_object_root() {
    let err = Envelope::from_json(json!([1, 2]), vec![]).unwrap_err();
    assert!(matches!(err, EnvelopeError::InvalidValueType { .. }));
}

#[test]
fn test_new_rejects_non_finite_numbers() {
    let data = BTreeMap::from([(
        "bad".to_string(),
        Value::Array(vec![Value::Number(f64::NAN)]),
    )]);
    let err = Envelope::new(data, vec![]).unwrap_err();
    match err {
        EnvelopeError::InvalidValueType { path, .. } => assert_eq!(path, "bad[0]"),
    }
}

#[test]
fn test_builder_reports_first_invalid_field() {
    let err = Envelope::builder()
        .field("ok", 1)
        .try_field("bad", json!(null))
        .try_field("worse", json!({"x": null}))
        .build()
        .unwrap_err();
    match err {
        EnvelopeError::InvalidValueType { path, .. } => assert_eq!(path, "bad"),
    }
}

#[test]
fn test_value_number_rejects_infinity() {
    assert!(Value::number(f64::INFINITY).is_err());
    assert_eq!(Value::number(1.5).unwrap(), Value::Number(1.5));
}

#[test]
fn test_structural_equality() {
    assert_eq!(sample(), sample());

    let other = Envelope::builder()
        .field("str", "hello")
        .named_blob("frame", vec![0u8])
        .build()
        .unwrap();
    assert_ne!(sample(), other);
}

#[test]
fn test_blob_lookup_by_index_and_name() {
    let env = sample();
    assert_eq!(env.blob(1).map(|b| &b.data()[..]), Some(&b"HELLO"[..]));
    assert_eq!(env.blob_named("frame").and_then(Blob::name), Some("frame"));
    assert!(env.blob_named("missing").is_none());
    assert!(env.blob(5).is_none());
}

#[test]
fn test_describe() {
    let shape = sample().describe();
    assert_eq!(shape.content_type, ContentType::JsonBlob);
    assert_eq!(shape.blob_count, 2);
    assert_eq!(shape.fields.get("float"), Some(&ValueKind::Number));
    assert_eq!(shape.fields.get("nested"), Some(&ValueKind::Object));
}

#[test]
fn test_content_type_empty_is_json() {
    assert_eq!(Envelope::default().content_type(), ContentType::Json);
    assert!(Envelope::default().is_empty());
}

#[test]
fn test_to_json() {
    let env = Envelope::builder().field("a", 1).field("b", "x").build().unwrap();
    assert_eq!(env.to_json(), json!({"a": 1.0, "b": "x"}));
}
