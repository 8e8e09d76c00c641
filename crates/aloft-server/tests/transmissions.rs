mod common;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{build_app, channel_access_token, request};
use serde_json::json;

async fn create_channel(app: &axum::Router, writer: &str, name: &str) -> String {
    let (status, created) = request(
        app,
        "POST",
        "/api/v1/channels",
        Some(writer),
        Some(json!({"name": name, "type": "general"})),
    )
    .await;
    assert_eq!(status, 201, "{created:?}");
    created["data"]["uuid"].as_str().unwrap().to_string()
}

fn chunk_body(session_id: &str, sequence: u32, payload: &[u8]) -> serde_json::Value {
    json!({
        "session_id": session_id,
        "chunk_sequence": sequence,
        "audio_data": STANDARD.encode(payload),
        "chunk_size_bytes": payload.len(),
        "timestamp_ms": 1_700_000_000_000u64 + sequence as u64,
    })
}

#[tokio::test]
async fn start_chunk_end_happy_path() {
    let (app, _db) = build_app();
    let pilot = channel_access_token("pilot-c1", "placeholder", &["read:api", "write:api"]);
    let uuid = create_channel(&app, &pilot, "Col du Belvédère").await;
    let pilot = channel_access_token("pilot-c1", &uuid, &["read:api", "write:api"]);

    let (status, joined) = request(&app, "POST", &format!("/api/v1/channels/{uuid}/join"), Some(&pilot), Some(json!({}))).await;
    assert_eq!(status, 200, "{joined:?}");

    let (status, started) = request(
        &app,
        "POST",
        "/api/v1/transmissions/start",
        Some(&pilot),
        Some(json!({
            "channel_uuid": uuid,
            "audio_format": "aac-lc",
            "sample_rate": 48000,
            "network_quality": "good",
        })),
    )
    .await;
    assert_eq!(status, 201, "{started:?}");
    let session_id = started["data"]["session_id"].as_str().unwrap().to_string();
    assert!(session_id.starts_with(&format!("ptt_{uuid}_")));
    assert_eq!(started["data"]["max_duration_secs"], 30);

    let payload = vec![0u8; 1024];
    for seq in 1..=3u32 {
        let (status, chunk) = request(
            &app,
            "POST",
            &format!("/api/v1/transmissions/{session_id}/chunk"),
            Some(&pilot),
            Some(chunk_body(&session_id, seq, &payload)),
        )
        .await;
        assert_eq!(status, 200, "chunk {seq}: {chunk:?}");
        assert_eq!(chunk["data"]["chunk_received"], true);
        assert_eq!(chunk["data"]["next_expected_sequence"], seq + 1);
    }

    let (status, ended) = request(
        &app,
        "POST",
        &format!("/api/v1/transmissions/{session_id}/end"),
        Some(&pilot),
        Some(json!({"session_id": session_id, "total_duration_ms": 5000})),
    )
    .await;
    assert_eq!(status, 200, "{ended:?}");
    assert_eq!(ended["data"]["chunks_received"], 3);
    assert_eq!(ended["data"]["total_bytes"], 3072);
}

#[tokio::test]
async fn second_start_on_busy_channel_is_rejected() {
    let (app, _db) = build_app();
    let placeholder = channel_access_token("pilot-a", "placeholder", &["read:api", "write:api"]);
    let uuid = create_channel(&app, &placeholder, "Busy Channel").await;

    let pilot_a = channel_access_token("pilot-a", &uuid, &["read:api", "write:api"]);
    let pilot_b = channel_access_token("pilot-b", &uuid, &["read:api", "write:api"]);
    request(&app, "POST", &format!("/api/v1/channels/{uuid}/join"), Some(&pilot_a), Some(json!({}))).await;
    request(&app, "POST", &format!("/api/v1/channels/{uuid}/join"), Some(&pilot_b), Some(json!({}))).await;

    let (status, started) = request(
        &app,
        "POST",
        "/api/v1/transmissions/start",
        Some(&pilot_a),
        Some(json!({"channel_uuid": uuid, "audio_format": "opus", "sample_rate": 48000})),
    )
    .await;
    assert_eq!(status, 201, "{started:?}");

    let (status, rejected) = request(
        &app,
        "POST",
        "/api/v1/transmissions/start",
        Some(&pilot_b),
        Some(json!({"channel_uuid": uuid, "audio_format": "opus", "sample_rate": 48000})),
    )
    .await;
    assert_eq!(status, 409, "{rejected:?}");
    assert!(rejected["error"]["message"].as_str().unwrap().contains("already active"));
}

#[tokio::test]
async fn out_of_order_chunk_sequence_is_rejected_and_does_not_advance() {
    let (app, _db) = build_app();
    let placeholder = channel_access_token("pilot-seq", "placeholder", &["read:api", "write:api"]);
    let uuid = create_channel(&app, &placeholder, "Sequence Channel").await;
    let pilot = channel_access_token("pilot-seq", &uuid, &["read:api", "write:api"]);
    request(&app, "POST", &format!("/api/v1/channels/{uuid}/join"), Some(&pilot), Some(json!({}))).await;

    let (_, started) = request(
        &app,
        "POST",
        "/api/v1/transmissions/start",
        Some(&pilot),
        Some(json!({"channel_uuid": uuid, "audio_format": "pcm", "sample_rate": 16000})),
    )
    .await;
    let session_id = started["data"]["session_id"].as_str().unwrap().to_string();
    let payload = vec![1u8; 64];

    for seq in 1..=2u32 {
        let (status, _) = request(
            &app,
            "POST",
            &format!("/api/v1/transmissions/{session_id}/chunk"),
            Some(&pilot),
            Some(chunk_body(&session_id, seq, &payload)),
        )
        .await;
        assert_eq!(status, 200);
    }

    let (status, skipped) = request(
        &app,
        "POST",
        &format!("/api/v1/transmissions/{session_id}/chunk"),
        Some(&pilot),
        Some(chunk_body(&session_id, 4, &payload)),
    )
    .await;
    assert_eq!(status, 400, "{skipped:?}");
    assert!(skipped["error"]["message"].as_str().unwrap().contains("Invalid chunk sequence"));

    let (status, retry) = request(
        &app,
        "POST",
        &format!("/api/v1/transmissions/{session_id}/chunk"),
        Some(&pilot),
        Some(chunk_body(&session_id, 3, &payload)),
    )
    .await;
    assert_eq!(status, 200, "{retry:?}");
    assert_eq!(retry["data"]["next_expected_sequence"], 4);
}

#[tokio::test]
async fn chunk_for_unknown_session_returns_not_found() {
    let (app, _db) = build_app();
    let placeholder = channel_access_token("pilot-x", "placeholder", &["read:api", "write:api"]);
    let uuid = create_channel(&app, &placeholder, "No Session Channel").await;
    let pilot = channel_access_token("pilot-x", &uuid, &["read:api", "write:api"]);

    let fake_session = format!("ptt_{uuid}_pilot-x_1700000000000_abcd1234");
    let (status, body) = request(
        &app,
        "POST",
        &format!("/api/v1/transmissions/{fake_session}/chunk"),
        Some(&pilot),
        Some(chunk_body(&fake_session, 1, &[0u8; 4])),
    )
    .await;
    assert_eq!(status, 404, "{body:?}");
}

#[tokio::test]
async fn ptt_active_reflects_current_transmission() {
    let (app, _db) = build_app();
    let placeholder = channel_access_token("pilot-y", "placeholder", &["read:api", "write:api"]);
    let uuid = create_channel(&app, &placeholder, "Active Query Channel").await;
    let pilot = channel_access_token("pilot-y", &uuid, &["read:api", "write:api"]);
    request(&app, "POST", &format!("/api/v1/channels/{uuid}/join"), Some(&pilot), Some(json!({}))).await;

    let (status, none_active) = request(&app, "GET", &format!("/api/v1/transmissions/active/{uuid}"), Some(&pilot), None).await;
    assert_eq!(status, 200);
    assert!(none_active["data"].is_null());

    let (_, started) = request(
        &app,
        "POST",
        "/api/v1/transmissions/start",
        Some(&pilot),
        Some(json!({"channel_uuid": uuid, "audio_format": "opus", "sample_rate": 48000})),
    )
    .await;
    let session_id = started["data"]["session_id"].as_str().unwrap().to_string();

    let (status, active) = request(&app, "GET", &format!("/api/v1/transmissions/active/{uuid}"), Some(&pilot), None).await;
    assert_eq!(status, 200);
    assert_eq!(active["data"]["session_id"], session_id);
}
