#![allow(dead_code)]

use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::json;
use sheet_insight::clients::EngineClient;
use sheet_insight::config::EngineConfig;
use sheet_insight::services::session_registry::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;

pub const SESSION_ID: &str = "s1";

pub fn engine_config(base_url: String, attempts: u32) -> EngineConfig {
    EngineConfig {
        base_url,
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        retry_attempts: attempts,
        retry_backoff: Duration::ZERO,
    }
}

pub fn engine_client(server: &MockServer) -> EngineClient {
    EngineClient::new(&engine_config(server.base_url(), 3), Arc::new(SessionRegistry::new())).unwrap()
}

/// Mocks for one full session lifecycle.
pub struct EngineMocks<'a> {
    pub create: Mock<'a>,
    pub load: Mock<'a>,
    pub analyze: Mock<'a>,
    pub destroy: Mock<'a>,
}

pub async fn healthy_engine(server: &MockServer) -> EngineMocks<'_> {
    engine_with(server, 200, json!({ "success": true, "data": { "totalFormulas": 1, "functions": {} } })).await
}

pub async fn engine_with(server: &MockServer, load_status: u16, analyze_body: serde_json::Value) -> EngineMocks<'_> {
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/sessions");
            then.status(200).json_body(json!({ "sessionId": SESSION_ID }));
        })
        .await;
    let load = server
        .mock_async(|when, then| {
            when.method(POST).path(format!("/sessions/{}/load", SESSION_ID));
            then.status(load_status).json_body(json!({ "message": "loaded" }));
        })
        .await;
    let analyze = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/sessions/{}/analyze", SESSION_ID));
            then.status(200).json_body(analyze_body);
        })
        .await;
    let destroy = server
        .mock_async(|when, then| {
            when.method(DELETE).path(format!("/sessions/{}", SESSION_ID));
            then.status(200).json_body(json!({ "message": "destroyed" }));
        })
        .await;
    EngineMocks {
        create,
        load,
        analyze,
        destroy,
    }
}

pub const SCENARIO_CSV: &[u8] = b"a,1\nb,=A1&B1\nc,3\n";
