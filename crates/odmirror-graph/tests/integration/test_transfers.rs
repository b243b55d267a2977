//! Upload and download protocol behaviour.

use std::io::Write;

use odmirror_core::ports::remote::{FragmentOutcome, RemoteApi};
use wiremock::matchers::{body_bytes, header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{file_item_json, mock_client};

fn temp_file_with(content: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn test_simple_upload_puts_content() {
    let (server, client) = mock_client().await;
    let local = temp_file_with(b"hello world");

    Mock::given(method("PUT"))
        .and(path("/drives/D/items/PARENT:/b.txt:/content"))
        .and(body_bytes(b"hello world".to_vec()))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(file_item_json("NEW", "b.txt", 11, "QX")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let item = client
        .simple_upload(local.path(), "D", "PARENT", "b.txt")
        .await
        .unwrap();
    assert_eq!(item.id, "NEW");
    assert_eq!(item.size, Some(11));
}

#[tokio::test]
async fn test_upload_session_fragment_sequence() {
    let (server, client) = mock_client().await;
    let local = temp_file_with(&[7u8; 1024]);
    let upload_url = format!("{}/up/session-1", server.uri());

    Mock::given(method("POST"))
        .and(path("/drives/D/items/PARENT:/big.bin:/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": upload_url,
            "expirationDateTime": "2026-01-01T00:00:00Z",
            "nextExpectedRanges": ["0-"]
        })))
        .mount(&server)
        .await;

    // First fragment accepted, second completes the item.
    Mock::given(method("PUT"))
        .and(path("/up/session-1"))
        .and(header("Content-Range", "bytes 0-511/1024"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "expirationDateTime": "2026-01-01T00:00:00Z",
            "nextExpectedRanges": ["512-"]
        })))
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/up/session-1"))
        .and(header("Content-Range", "bytes 512-1023/1024"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(file_item_json("BIG", "big.bin", 1024, "QX")),
        )
        .mount(&server)
        .await;

    let session = client
        .create_upload_session("D", "PARENT", "big.bin", None, &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(session.next_offset(), Some(0));

    let first = client
        .upload_fragment(&session.upload_url, local.path(), 0, 512, 1024)
        .await
        .unwrap();
    let next = match first {
        FragmentOutcome::Accepted(s) => s.next_offset().unwrap(),
        FragmentOutcome::Completed(_) => panic!("first fragment must not complete"),
    };
    assert_eq!(next, 512);

    let second = client
        .upload_fragment(&session.upload_url, local.path(), 512, 512, 1024)
        .await
        .unwrap();
    match second {
        FragmentOutcome::Completed(item) => assert_eq!(item.id, "BIG"),
        FragmentOutcome::Accepted(_) => panic!("final fragment must complete"),
    }
}

#[tokio::test]
async fn test_fragment_416_resynchronises_from_status() {
    let (server, client) = mock_client().await;
    let local = temp_file_with(&[1u8; 512]);
    let upload_url = format!("{}/up/session-2", server.uri());

    Mock::given(method("PUT"))
        .and(path("/up/session-2"))
        .respond_with(ResponseTemplate::new(416).set_body_json(serde_json::json!({
            "error": {"code": "invalidRange", "message": "fragment already received"}
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/up/session-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "expirationDateTime": "2026-01-01T00:00:00Z",
            "nextExpectedRanges": ["256-"]
        })))
        .mount(&server)
        .await;

    let outcome = client
        .upload_fragment(&upload_url, local.path(), 0, 256, 512)
        .await
        .unwrap();
    match outcome {
        FragmentOutcome::Accepted(session) => assert_eq!(session.next_offset(), Some(256)),
        FragmentOutcome::Completed(_) => panic!("416 must not complete the upload"),
    }
}

#[tokio::test]
async fn test_download_writes_full_content() {
    let (server, client) = mock_client().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.bin");

    Mock::given(method("GET"))
        .and(path("/drives/D/items/X/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
        .mount(&server)
        .await;

    let written = client.download_item("D", "X", &dest, 10, 0).await.unwrap();
    assert_eq!(written, 10);
    assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_download_resumes_with_range_header() {
    let (server, client) = mock_client().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.bin");
    std::fs::write(&dest, b"01234").unwrap();

    Mock::given(method("GET"))
        .and(path("/drives/D/items/X/content"))
        .and(header("Range", "bytes=5-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"56789".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let written = client.download_item("D", "X", &dest, 10, 5).await.unwrap();
    assert_eq!(written, 10);
    assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_create_share_link() {
    let (server, client) = mock_client().await;

    Mock::given(method("POST"))
        .and(path("/drives/D/items/X/createLink"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "perm-1",
            "link": {"webUrl": "https://1drv.ms/abc"}
        })))
        .mount(&server)
        .await;

    let link = client
        .create_share_link(
            "D",
            "X",
            &odmirror_core::ports::remote::ShareLinkRequest {
                link_type: "view".to_string(),
                scope: "anonymous".to_string(),
                password: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(link.url, "https://1drv.ms/abc");
}
