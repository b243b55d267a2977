//! Shared helpers for adapter integration tests.

use odmirror_graph::GraphClient;
use wiremock::MockServer;

pub async fn mock_client() -> (MockServer, GraphClient) {
    let server = MockServer::start().await;
    let client = GraphClient::with_base_url("test-token", server.uri());
    (server, client)
}

/// A minimal DriveItem body for a file.
pub fn file_item_json(id: &str, name: &str, size: i64, qxor: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "eTag": format!("\"{{{id}}},1\""),
        "size": size,
        "lastModifiedDateTime": "2024-01-01T00:00:00Z",
        "parentReference": {
            "driveId": "abcdef0123456789",
            "id": "ROOT",
            "path": "/drive/root:"
        },
        "file": {
            "mimeType": "application/octet-stream",
            "hashes": { "quickXorHash": qxor }
        }
    })
}
