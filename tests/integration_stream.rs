mod support;

use std::time::Duration;

use futures_util::StreamExt;
use sekha::prelude::{CallContext, Client, Error, ErrorCode};
use serde::Deserialize;

use support::{MockServer, Reply, TEST_KEY};

#[derive(Debug, Deserialize, PartialEq)]
struct Row {
    n: u32,
}

fn chunk(text: &str, delay_ms: u64) -> (Vec<u8>, Duration) {
    (text.as_bytes().to_vec(), Duration::from_millis(delay_ms))
}

fn client_for(server: &MockServer, max_connections: usize) -> Client {
    Client::builder(TEST_KEY, server.base_url())
        .max_connections(max_connections)
        .timeout(Duration::from_secs(2))
        .try_build()
        .expect("build client")
}

#[tokio::test(flavor = "current_thread")]
async fn records_split_across_chunks_are_reassembled() {
    let server = MockServer::start(vec![Reply::Stream {
        status: 200,
        chunks: vec![
            chunk("{\"n\":1}\n{\"n\"", 0),
            chunk(":2}\r\n\n", 10),
            chunk("   \n{\"n\":3}", 10),
        ],
        hold_open: false,
    }]);
    let client = client_for(&server, 1);

    let stream = client
        .stream(&client.get("/api/v1/export/stream").build())
        .await
        .expect("stream opens");
    assert_eq!(stream.status().as_u16(), 200);
    assert_eq!(stream.attempts(), 1);

    let rows: Vec<Row> = stream
        .json::<Row>()
        .map(|row| row.expect("valid row"))
        .collect()
        .await;
    assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }, Row { n: 3 }]);

    let status = client.pool_status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.idle, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn abandoning_a_stream_frees_its_connection() {
    let server = MockServer::start(vec![
        Reply::Stream {
            status: 200,
            chunks: vec![chunk("{\"n\":1}\n{\"n\":2}\n", 0)],
            hold_open: true,
        },
        support::ResponseSpec::new(200, "{}").into(),
    ]);
    let client = client_for(&server, 1);

    let mut stream = client
        .stream(&client.get("/api/v1/export/stream").build())
        .await
        .expect("stream opens");
    let first = stream.next_record().await.expect("one record").expect("ok");
    assert_eq!(first.as_ref(), b"{\"n\":1}");
    assert_eq!(client.pool_status().in_use, 1);
    drop(stream);

    assert_eq!(client.pool_status().in_use, 0);
    let response = client
        .execute(&client.get("/health").build())
        .await
        .expect("pool slot is available again");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(server.connections(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn stalled_stream_times_out() {
    let server = MockServer::start(vec![Reply::Stream {
        status: 200,
        chunks: vec![chunk("{\"n\":1}\n", 0)],
        hold_open: true,
    }]);
    let client = client_for(&server, 1);

    let descriptor = client
        .get("/api/v1/export/stream")
        .timeout(Duration::from_millis(200))
        .build();
    let mut stream = client.stream(&descriptor).await.expect("stream opens");
    assert!(stream.next_record().await.expect("record").is_ok());

    let error = stream
        .next_record()
        .await
        .expect("an error item")
        .expect_err("idle read times out");
    assert_eq!(error.code(), ErrorCode::Timeout);
    assert!(stream.next_record().await.is_none());
    assert_eq!(client.pool_status().in_use, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_the_context_ends_the_stream() {
    let server = MockServer::start(vec![Reply::Stream {
        status: 200,
        chunks: vec![chunk("{\"n\":1}\n", 0)],
        hold_open: true,
    }]);
    let client = client_for(&server, 1);

    let context = CallContext::new();
    let mut stream = client
        .stream(&client.get("/api/v1/export/stream").context(context.clone()).build())
        .await
        .expect("stream opens");
    assert!(stream.next_record().await.expect("record").is_ok());

    context.cancel();
    match stream.next_record().await.expect("an error item") {
        Err(Error::Cancelled { attempts, .. }) => assert_eq!(attempts, 1),
        other => panic!("unexpected item: {other:?}"),
    }
    assert_eq!(client.pool_status().in_use, 0);
}

#[tokio::test(flavor = "current_thread")]
async fn oversized_record_is_rejected() {
    let big = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(256));
    let server = MockServer::start(vec![Reply::Stream {
        status: 200,
        chunks: vec![(big.into_bytes(), Duration::ZERO)],
        hold_open: false,
    }]);
    let client = Client::builder(TEST_KEY, server.base_url())
        .max_record_bytes(64)
        .try_build()
        .expect("build client");

    let mut stream = client
        .stream(&client.get("/api/v1/export/stream").build())
        .await
        .expect("stream opens");
    let error = stream
        .next_record()
        .await
        .expect("an error item")
        .expect_err("record too large");
    assert_eq!(error.code(), ErrorCode::ResponseBodyTooLarge);
}

#[tokio::test(flavor = "current_thread")]
async fn error_status_fails_before_streaming() {
    let server = MockServer::respond(support::ResponseSpec::json(
        404,
        serde_json::json!({"status_code": 404, "message": "no such export"}),
    ));
    let client = client_for(&server, 1);

    let error = client
        .stream(&client.get("/api/v1/export/stream").build())
        .await
        .expect_err("404");
    assert!(error.is_not_found());
    assert_eq!(client.pool_status().in_use, 0);
}
