#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::error::ControlError;
    use crate::metrics::Metrics;
    use crate::protocol::{
        error_codes, ControlRequest, JsonRpcId, JsonRpcMessage, JsonRpcResponse, JsonRpcV2Message,
    };
    use crate::transport::{Connection, LineConnection};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn pipe() -> (Arc<dyn Connection>, Arc<LineConnection>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        (
            Arc::new(LineConnection::new(our_read, our_write)),
            Arc::new(LineConnection::new(their_read, their_write)),
        )
    }

    async fn next_request(host: &LineConnection) -> (JsonRpcId, ControlRequest) {
        let line = host.recv().await.unwrap();
        let JsonRpcMessage::V2(JsonRpcV2Message::Request(request)) =
            serde_json::from_slice(&line).unwrap()
        else {
            panic!("Expected request message");
        };
        let parsed = ControlRequest::from_jsonrpc(&request).unwrap();
        (request.id, parsed)
    }

    async fn reply(host: &LineConnection, response: JsonRpcResponse) {
        let line = JsonRpcMessage::response(response).to_line().unwrap();
        host.send(line).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (connection, host) = pipe();
        let metrics = Arc::new(Metrics::new());
        let client = ControlClient::new("p", connection, Some(metrics.clone()));

        let responder = tokio::spawn(async move {
            let (id, request) = next_request(&host).await;
            assert_eq!(request, ControlRequest::Ping);
            reply(&host, JsonRpcResponse::success(id, json!({}))).await;
        });

        client.ping(Duration::from_secs(1)).await.unwrap();
        responder.await.unwrap();
        assert_eq!(metrics.control_calls_total.get(), 1);
        assert_eq!(metrics.control_calls_failed.get(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_matched_by_id() {
        let (connection, host) = pipe();
        let client = Arc::new(ControlClient::new("p", connection, None));

        let responder = tokio::spawn(async move {
            let (first_id, _) = next_request(&host).await;
            let (second_id, _) = next_request(&host).await;
            reply(&host, JsonRpcResponse::success(second_id, json!({"n": 2}))).await;
            reply(&host, JsonRpcResponse::success(first_id, json!({"n": 1}))).await;
        });

        let first = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .get_ui_state("c", None, Some("one"), Duration::from_secs(1))
                    .await
            })
        };
        // Make sure the first request is written before the second.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = client
            .get_ui_state("c", None, Some("two"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(second, json!({"n": 2}));
        assert_eq!(first.await.unwrap().unwrap(), json!({"n": 1}));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let (connection, _host) = pipe();
        let client = ControlClient::new("p", connection, None);

        let err = client.ping(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ControlError::Timeout { method: "ping", .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let (connection, host) = pipe();
        let client = ControlClient::new("p", connection, None);

        tokio::spawn(async move {
            let (id, _) = next_request(&host).await;
            reply(
                &host,
                JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, "bad capability"),
            )
            .await;
        });

        let err = client
            .connect("missing", json!({}), "s", Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            ControlError::Remote { code, message } => {
                assert_eq!(code, error_codes::INVALID_PARAMS);
                assert_eq!(message, "bad capability");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!ControlError::Remote {
            code: 0,
            message: String::new()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn test_malformed_result_is_reported() {
        let (connection, host) = pipe();
        let client = ControlClient::new("p", connection, None);

        tokio::spawn(async move {
            let (id, _) = next_request(&host).await;
            reply(&host, JsonRpcResponse::success(id, json!({"capabilities": "nope"}))).await;
        });

        let err = client
            .get_capabilities(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Malformed {
                method: "get-capabilities",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pending_calls_fail_when_host_goes_away() {
        let (connection, host) = pipe();
        let client = ControlClient::new("p", connection, None);

        tokio::spawn(async move {
            let _ = next_request(&host).await;
            // Dropping the host end closes the pipe.
            drop(host);
        });

        let err = client.ping(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ControlError::Closed));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.is_closed());
        assert!(matches!(
            client.ping(Duration::from_secs(1)).await.unwrap_err(),
            ControlError::Closed
        ));
    }

    #[tokio::test]
    async fn test_close_fails_future_calls() {
        let (connection, _host) = pipe();
        let client = ControlClient::new("p", connection, None);
        client.close().await;

        let err = client
            .set_backpressure("s", crate::protocol::BackpressureLevel::High, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Closed));
    }
}
