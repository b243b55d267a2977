//! Change feed and enumeration behaviour.

use odmirror_core::ports::remote::RemoteApi;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{file_item_json, mock_client};

#[tokio::test]
async fn test_list_changes_pages_in_order() {
    let (server, client) = mock_client().await;

    // First page carries one item and a nextLink pointing back at the server.
    let next_url = format!("{}/page2", server.uri());
    Mock::given(method("GET"))
        .and(path("/drives/abcdef0123456789/items/ROOT/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_item_json("A", "a.txt", 10, "QX1")],
            "@odata.nextLink": next_url,
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_item_json("B", "b.txt", 20, "QX2")],
            "@odata.deltaLink": "https://graph.microsoft.com/v1.0/delta?token=final",
        })))
        .mount(&server)
        .await;

    let first = client
        .list_changes("abcdef0123456789", "ROOT", None)
        .await
        .unwrap();
    assert_eq!(first.items.len(), 1);
    assert_eq!(first.items[0].id, "A");
    let next = first.next_link.unwrap();

    let second = client
        .list_changes("abcdef0123456789", "ROOT", Some(&next))
        .await
        .unwrap();
    assert_eq!(second.items[0].id, "B");
    assert!(second.delta_link.unwrap().contains("token=final"));
}

#[tokio::test]
async fn test_expired_delta_token_maps_to_gone() {
    let (server, client) = mock_client().await;

    Mock::given(method("GET"))
        .and(path("/drives/D/items/R/delta"))
        .respond_with(ResponseTemplate::new(410).set_body_json(serde_json::json!({
            "error": { "code": "resyncRequired", "message": "The delta token is no longer valid." }
        })))
        .mount(&server)
        .await;

    let err = client.list_changes("D", "R", None).await.unwrap_err();
    assert!(err.is_gone());
    assert!(err.to_string().contains("no longer valid"));
}

#[tokio::test]
async fn test_throttled_request_retries_after_header() {
    let (server, client) = mock_client().await;

    // First attempt is throttled with an immediate Retry-After, the mock
    // then falls through to the success response.
    Mock::given(method("GET"))
        .and(path("/drives/D/items/R/children"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "0")
                .set_body_json(serde_json::json!({
                    "error": {"code": "tooManyRequests", "message": "slow down"}
                })),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drives/D/items/R/children"))
        .and(query_param("$top", "200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_item_json("C", "c.txt", 30, "QX3")]
        })))
        .mount(&server)
        .await;

    let page = client.list_children("D", "R", None).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].name, "c.txt");
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let (server, client) = mock_client().await;

    Mock::given(method("GET"))
        .and(path("/me/drive"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": {"code": "InvalidAuthenticationToken", "message": "token expired"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client.get_default_drive().await.unwrap_err();
    assert!(err.is_auth_failure());
}

#[tokio::test]
async fn test_requests_carry_bearer_token() {
    let (server, client) = mock_client().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "ROOT", "name": "root", "root": {}, "folder": {"childCount": 0},
            "parentReference": {"driveId": "abcdef0123456789"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let root = client.get_default_root().await.unwrap();
    assert!(root.is_root);
}

#[tokio::test]
async fn test_update_item_precondition_failure_surfaces() {
    let (server, client) = mock_client().await;

    Mock::given(method("PATCH"))
        .and(path("/drives/D/items/X"))
        .and(header("If-Match", "\"etag-1\""))
        .respond_with(ResponseTemplate::new(412).set_body_json(serde_json::json!({
            "error": {"code": "resourceModified", "message": "ETag does not match"}
        })))
        .mount(&server)
        .await;

    let patch = serde_json::json!({"name": "renamed.txt"});
    let err = client
        .update_item("D", "X", &patch, Some("\"etag-1\""))
        .await
        .unwrap_err();
    assert!(err.is_precondition());
}
