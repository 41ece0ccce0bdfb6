//! Request/response contract tests.

use std::time::Duration;

use edgebus::{BusContext, BusError, Envelope, Request, Value};

use super::RECV_TIMEOUT;

fn query(id: u32) -> Envelope {
    Envelope::builder()
        .field("id", id)
        .field("op", "status")
        .blob(vec![id as u8; 4])
        .build()
        .expect("query envelope")
}

fn id_of(envelope: &Envelope) -> Option<f64> {
    envelope.get("id").and_then(Value::as_f64)
}

pub async fn test_echo_exchange(ctx: &BusContext) {
    let service = ctx.new_service("contract-echo").await.unwrap();
    let client = ctx.new_client("contract-echo").await.unwrap();

    client.request(&query(1)).await.unwrap();
    let Request { envelope, token } = service
        .recv_timeout(RECV_TIMEOUT)
        .await
        .unwrap()
        .expect("request should arrive");
    assert_eq!(envelope, query(1));

    service.respond(token, &envelope).await.unwrap();
    let response = client.recv_timeout(RECV_TIMEOUT).await.unwrap();
    assert_eq!(response, Some(query(1)));
}

pub async fn test_sequential_exchanges(ctx: &BusContext) {
    let service = ctx.new_service("contract-seq").await.unwrap();
    let client = ctx.new_client("contract-seq").await.unwrap();

    for id in 0..5 {
        client.request(&query(id)).await.unwrap();
        let request = service.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
        assert_eq!(id_of(&request.envelope), Some(id as f64));
        service.respond(request.token, &query(id + 100)).await.unwrap();

        let response = client.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
        assert_eq!(id_of(&response), Some((id + 100) as f64));
    }
}

pub async fn test_call_with_responder_task(ctx: &BusContext) {
    let service = ctx.new_service("contract-call").await.unwrap();
    let client = ctx.new_client("contract-call").await.unwrap();

    let responder = tokio::spawn(async move {
        let Request { envelope, token } = service.recv_wait().await.unwrap();
        let id = id_of(&envelope).unwrap() as u32;
        service.respond(token, &query(id * 2)).await.unwrap();
    });

    let response = client
        .call(&query(21), RECV_TIMEOUT)
        .await
        .unwrap()
        .expect("call should be answered");
    assert_eq!(id_of(&response), Some(42.0));
    responder.await.unwrap();
}

pub async fn test_late_response_is_discarded(ctx: &BusContext) {
    let service = ctx.new_service("contract-late").await.unwrap();
    let client = ctx.new_client("contract-late").await.unwrap();

    let first = client
        .call(&query(1), Duration::from_millis(30))
        .await
        .unwrap();
    assert!(first.is_none());

    let late = service.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
    service.respond(late.token, &query(1)).await.unwrap();

    client.request(&query(2)).await.unwrap();
    let current = service.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(id_of(&current.envelope), Some(2.0));
    service.respond(current.token, &query(2)).await.unwrap();

    let response = client.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(id_of(&response), Some(2.0));
}

pub async fn test_clients_get_their_own_responses(ctx: &BusContext) {
    let service = ctx.new_service("contract-multi").await.unwrap();
    let alice = ctx.new_client("contract-multi").await.unwrap();
    let bob = ctx.new_client("contract-multi").await.unwrap();

    alice.request(&query(10)).await.unwrap();
    bob.request(&query(20)).await.unwrap();

    for _ in 0..2 {
        let Request { envelope, token } =
            service.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
        service.respond(token, &envelope).await.unwrap();
    }

    let to_alice = alice.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
    let to_bob = bob.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(id_of(&to_alice), Some(10.0));
    assert_eq!(id_of(&to_bob), Some(20.0));
}

pub async fn test_alternation_errors(ctx: &BusContext) {
    let service = ctx.new_service("contract-alt").await.unwrap();
    let client = ctx.new_client("contract-alt").await.unwrap();

    assert!(matches!(
        client.recv_nowait().await,
        Err(BusError::NoOutstandingRequest)
    ));
    client.request(&query(1)).await.unwrap();
    assert!(matches!(
        client.request(&query(2)).await,
        Err(BusError::ResponseAlreadyOutstanding)
    ));

    let request = service.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
    assert!(matches!(
        service.recv_nowait().await,
        Err(BusError::ResponseAlreadyOutstanding)
    ));
    let stale = request.token.clone();
    service.respond(request.token, &query(1)).await.unwrap();
    assert!(matches!(
        service.respond(stale, &query(1)).await,
        Err(BusError::NoOutstandingRequest)
    ));
    client.recv_timeout(RECV_TIMEOUT).await.unwrap().unwrap();
}

pub async fn test_duplicate_service(ctx: &BusContext) {
    let _service = ctx.new_service("contract-dup").await.unwrap();
    let err = ctx.new_service("contract-dup").await.unwrap_err();
    assert!(matches!(err, BusError::Bind { .. }), "unexpected error: {err:?}");
}

pub async fn test_connect_to_missing_service(ctx: &BusContext) {
    let err = ctx.new_client("contract-missing").await.unwrap_err();
    assert!(matches!(err, BusError::Connect { .. }), "unexpected error: {err:?}");
}

/// Run all request/response contract tests against a context.
#[macro_export]
macro_rules! run_reqresp_tests {
    ($ctx:expr) => {
        use $crate::bus::reqresp_tests::*;

        test_echo_exchange($ctx).await;
        println!("  test_echo_exchange: PASSED");

        test_sequential_exchanges($ctx).await;
        println!("  test_sequential_exchanges: PASSED");

        test_call_with_responder_task($ctx).await;
        println!("  test_call_with_responder_task: PASSED");

        test_late_response_is_discarded($ctx).await;
        println!("  test_late_response_is_discarded: PASSED");

        test_clients_get_their_own_responses($ctx).await;
        println!("  test_clients_get_their_own_responses: PASSED");

        test_alternation_errors($ctx).await;
        println!("  test_alternation_errors: PASSED");

        test_duplicate_service($ctx).await;
        println!("  test_duplicate_service: PASSED");

        test_connect_to_missing_service($ctx).await;
        println!("  test_connect_to_missing_service: PASSED");
    };
}
