//! Wire-level round-trip coverage across the public codec surface.

use bytes::Bytes;
use parleyproto::codec::{CodecConfig, TextCodec};
use parleyproto::{
    compat, compress, decompress, BinaryFrame, Compression, ErrorCode, Frame, RpcError,
};
use pretty_assertions::assert_eq;
use uuid::Uuid;

#[test]
fn every_frame_kind_survives_encode_decode() {
    let codec = TextCodec::new(CodecConfig::default());
    let frames = vec![
        Frame::request_with_params("r1", "session.create", serde_json::json!({"title": "demo"})),
        Frame::ok(
            serde_json::json!("r1"),
            Some(serde_json::json!({"session_id": "sess-1"})),
        ),
        Frame::err(serde_json::json!("r2"), RpcError::method_not_found("nope")),
        Frame::event("session.output", serde_json::json!({"chunk": "hello"}), Some(1)),
    ];

    for frame in &frames {
        let text = codec.encode_frame(frame).unwrap();
        let outcome = codec.decode(&text).unwrap();
        assert_eq!(outcome.frames, vec![frame.clone()]);
    }

    // And as one batch, order preserved, no diagnostics.
    let text = codec.encode_batch(&frames).unwrap();
    let outcome = codec.decode(&text).unwrap();
    assert!(outcome.is_batch);
    assert_eq!(outcome.frames, frames);
    assert!(outcome.errors.is_empty());
}

#[test]
fn binary_upload_roundtrip() {
    let correlation_id: Uuid = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
    let frame = BinaryFrame::new(
        correlation_id,
        serde_json::json!({"method": "file.upload"}),
        Bytes::from(vec![0xAB; 100_000]),
    );

    let encoded = frame.encode().unwrap();
    let decoded = BinaryFrame::decode(&encoded).unwrap();

    assert_eq!(decoded.correlation_id, correlation_id);
    assert_eq!(decoded.metadata["method"], "file.upload");
    assert_eq!(decoded.payload.len(), 100_000);
    assert!(decoded.payload.iter().all(|b| *b == 0xAB));
}

#[test]
fn compression_law_holds_for_frame_payloads() {
    let frame = Frame::request_with_params(
        "up-1",
        "memory.store",
        serde_json::json!({"text": "lorem ipsum ".repeat(4096)}),
    );
    let serialized = serde_json::to_vec(&frame).unwrap();

    for algorithm in [Compression::Gzip, Compression::Deflate, Compression::None] {
        let packed = compress(&serialized, algorithm).unwrap();
        let unpacked = decompress(&packed, algorithm).unwrap();
        assert_eq!(serialized, unpacked);
    }
}

#[test]
fn jsonrpc_client_gets_jsonrpc_answers() {
    let codec = TextCodec::new(CodecConfig::default());
    let inbound = compat::decode_any(
        &codec,
        r#"{"jsonrpc":"2.0","id":9,"method":"health.ping","params":{}}"#,
    )
    .unwrap();

    let message = &inbound.messages[0];
    assert_eq!(message.dialect, compat::Dialect::JsonRpc2);

    let response = Frame::ok(serde_json::json!(9), Some(serde_json::json!({"pong": true})));
    let rendered = compat::render_response(message.dialect, &response);
    assert_eq!(rendered["jsonrpc"], "2.0");
    assert_eq!(rendered["result"]["pong"], true);
}

#[test]
fn batch_with_garbage_element_reports_index() {
    let codec = TextCodec::new(CodecConfig::default());
    let outcome = compat::decode_any(
        &codec,
        r#"[{"type":"req","id":"a","method":"health.ping"},{"type":"garbage"},{"type":"req","id":"b","method":"health.ping"}]"#,
    )
    .unwrap();

    assert_eq!(outcome.messages.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].index, 1);

    let response = compat::parse_failure_response(
        compat::Dialect::V2,
        &outcome.errors[0].to_string(),
    );
    assert_eq!(response["ok"], false);
    assert_eq!(response["id"], serde_json::Value::Null);
    assert_eq!(
        response["error"]["code"],
        ErrorCode::InvalidRequest.as_str()
    );
}
