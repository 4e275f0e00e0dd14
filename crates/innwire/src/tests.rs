use super::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Payload {
    rid: u64,
    name: String,
    bytes: Vec<u8>,
}

#[test]
fn test_round_trip_structured_value() {
    let envelope = Envelope::ok(Payload {
        rid: 7,
        name: "std_dispatcher".into(),
        bytes: vec![116, 101, 115, 116],
    });

    let bytes = encode(&envelope).unwrap();
    let decoded: Envelope<Payload> = decode(&bytes).unwrap();

    assert_eq!(decoded, envelope);
}

#[test]
fn test_round_trip_error_envelope() {
    let envelope = Envelope::<Empty>::fail("resource not found: rid-9");

    let bytes = encode(&envelope).unwrap();
    let decoded: Envelope<Empty> = decode(&bytes).unwrap();

    assert_eq!(decoded, envelope);
}

#[test]
fn test_into_data_returns_payload() {
    let data = Envelope::ok(42u64).into_data().unwrap();
    assert_eq!(data, 42);
}

#[test]
fn test_into_data_surfaces_op_error() {
    let err = Envelope::<u64>::fail("boom").into_data().unwrap_err();
    assert_eq!(err, Error::Op("boom".into()));
}

#[test]
fn test_error_takes_precedence_over_data() {
    // A peer that sets both fields is out of contract; the error wins.
    let envelope = Envelope { error: Some(OpError::new("boom")), data: Some(1u64) };
    assert_eq!(envelope.into_data().unwrap_err(), Error::Op("boom".into()));
}

#[test]
fn test_empty_envelope_is_missing_data() {
    let envelope: Envelope<u64> = Envelope { error: None, data: None };
    assert_eq!(envelope.into_data().unwrap_err(), Error::MissingData);
}

#[test]
fn test_decode_rejects_garbage() {
    let err = decode::<Empty>(b"not json").unwrap_err();
    assert!(matches!(err, Error::Malformed(_)));
}

#[test]
fn test_fail_bytes_decodes_as_op_error() {
    let bytes = fail_bytes("no pending command 3");
    let err = decode_data::<Empty>(&bytes).unwrap_err();
    assert_eq!(err, Error::Op("no pending command 3".into()));
}

#[test]
fn test_empty_serializes_as_bare_object() {
    let bytes = to_payload(&Empty {}).unwrap();
    assert_eq!(bytes, b"{}");
}

#[test]
fn test_decode_data_of_success_envelope() {
    let bytes = encode(&Envelope::ok(Empty {})).unwrap();
    let data: Empty = decode_data(&bytes).unwrap();
    assert_eq!(data, Empty {});
}
