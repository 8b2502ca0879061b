//! End-to-end behavior over the in-memory transport: services, discovery
//! client and requesters sharing one connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use proptest::prelude::*;

use crate::client::{ClientError, DiscoveryClient, RequestManyOptions};
use crate::service::{
    add_service, handler_fn, middleware_fn, EndpointOptions, HandlerError, LifecycleError, Next,
    RegistrationError, Request, Service, ServiceConfig, ServiceError,
};
use crate::transport::InMemoryTransport;

const TIMEOUT: Duration = Duration::from_secs(1);

fn quick() -> RequestManyOptions {
    RequestManyOptions::default().with_max_wait(Duration::from_millis(100))
}

async fn demo_service(transport: &Arc<InMemoryTransport>) -> Service {
    let service = add_service(transport.clone(), ServiceConfig::new("demo-service", "1.0.0")).unwrap();
    let echo = handler_fn(|request: Request| async move {
        let payload = request.data().clone();
        request.respond(payload).await?;
        Ok(())
    });
    let endpoint = service
        .add_group("demo")
        .unwrap()
        .add_endpoint("echo", echo, EndpointOptions::default().with_subject("ECHO"))
        .await
        .unwrap();
    assert_eq!(endpoint.subject(), "demo.ECHO");
    service
}

#[tokio::test]
async fn echo_then_stats() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = demo_service(&transport).await;
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    let reply = client.request("demo.ECHO", "Hello, world!", TIMEOUT).await.unwrap();
    assert_eq!(reply.payload, Bytes::from_static(b"Hello, world!"));

    let stats = client
        .service("demo-service")
        .instance(service.id())
        .stats(TIMEOUT)
        .await
        .unwrap();
    assert_eq!(stats.endpoints.len(), 1);
    let echo = &stats.endpoints[0];
    assert_eq!(echo.name, "echo");
    assert_eq!(echo.subject, "demo.ECHO");
    assert_eq!(echo.num_requests, 1);
    assert_eq!(echo.num_errors, 0);
    assert_eq!(Some(stats.started), service.started_at());
}

#[tokio::test]
async fn explicit_error_reply_and_stats() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = add_service(transport.clone(), ServiceConfig::new("demo-service", "1.0.0")).unwrap();
    let failing = handler_fn(|_request: Request| async move {
        Err(HandlerError::from(ServiceError::new(400, "bad request")))
    });
    service.add_endpoint("fail", failing, EndpointOptions::default()).await.unwrap();
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    let reply = client
        .request_with_headers("fail", Default::default(), "x", TIMEOUT)
        .await;
    let Err(ClientError::Service { code, description }) = reply else {
        panic!("expected a service error");
    };
    assert_eq!(code, 400);
    assert_eq!(description, "bad request");

    // Raw reply: both headers set, empty body.
    let raw = crate::transport::Transport::request(
        transport.as_ref(),
        "fail",
        Default::default(),
        Bytes::new(),
        TIMEOUT,
    )
    .await
    .unwrap();
    assert_eq!(raw.service_error(), Some((400, "bad request")));
    assert!(raw.payload.is_empty());

    let stats = service.stats();
    assert_eq!(stats.endpoints[0].num_errors, 2);
    assert_eq!(stats.endpoints[0].last_error, "bad request");
}

#[tokio::test]
async fn broadcast_ping_reaches_every_instance() {
    let transport = Arc::new(InMemoryTransport::new());
    let first = demo_service(&transport).await;
    let second = add_service(transport.clone(), ServiceConfig::new("other", "2.0.0")).unwrap();
    first.start().await.unwrap();
    second.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    let mut ids: Vec<String> = client
        .ping(None, quick())
        .await
        .unwrap()
        .into_iter()
        .map(|ping| ping.id)
        .collect();
    ids.sort();
    let mut expected = vec![first.id().to_string(), second.id().to_string()];
    expected.sort();
    assert_eq!(ids, expected);

    let scoped = client.service("other").ping(quick()).await.unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].name, "other");
    assert_eq!(scoped[0].version, "2.0.0");

    let one = client
        .service("demo-service")
        .instance(first.id())
        .ping(TIMEOUT)
        .await
        .unwrap();
    assert_eq!(one, first.ping());

    let none = client
        .service("demo-service")
        .instance("not-an-instance")
        .ping(Duration::from_millis(50))
        .await;
    assert!(none.is_err());
}

#[tokio::test]
async fn info_lists_endpoints_of_every_instance() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = demo_service(&transport).await;
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    let infos = client.info(Some("demo-service"), quick()).await.unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].endpoints[0].subject, "demo.ECHO");
    assert_eq!(infos[0].endpoints[0].queue_group, "q");
}

#[tokio::test]
async fn stopped_service_disappears_from_discovery() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = demo_service(&transport).await;
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());
    assert_eq!(client.ping(None, quick()).await.unwrap().len(), 1);

    service.stop().await;
    assert!(service.stopped());
    assert!(client.ping(None, quick()).await.unwrap().is_empty());

    let err = service
        .add_endpoint("late", handler_fn(|_r: Request| async { Ok(()) }), EndpointOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, RegistrationError::Lifecycle(LifecycleError::Stopped));

    service.stop().await;
    assert!(service.stopped());
}

#[tokio::test]
async fn queue_group_balances_between_instances() {
    let transport = Arc::new(InMemoryTransport::new());
    let a = demo_service(&transport).await;
    let b = demo_service(&transport).await;
    a.start().await.unwrap();
    b.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    for _ in 0..20 {
        client.request("demo.ECHO", "x", TIMEOUT).await.unwrap();
    }
    let total = a.stats().endpoints[0].num_requests + b.stats().endpoints[0].num_requests;
    assert_eq!(total, 20);
}

#[tokio::test]
async fn slow_handler_does_not_block_others() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = add_service(transport.clone(), ServiceConfig::new("mixed", "1.0.0")).unwrap();
    let slow = handler_fn(|request: Request| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        request.respond("slow").await?;
        Ok(())
    });
    let fast = handler_fn(|request: Request| async move {
        request.respond("fast").await?;
        Ok(())
    });
    service.add_endpoint("slow", slow, EndpointOptions::default()).await.unwrap();
    service.add_endpoint("fast", fast, EndpointOptions::default()).await.unwrap();
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", "", TIMEOUT).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(service.in_flight(), 1);

    let reply = tokio::time::timeout(Duration::from_millis(100), client.request("fast", "", TIMEOUT))
        .await
        .expect("fast endpoint not blocked")
        .unwrap();
    assert_eq!(reply.payload, Bytes::from_static(b"fast"));

    // Discovery answers while the slow handler is still running.
    let stats = client
        .service("mixed")
        .instance(service.id())
        .stats(Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(stats.endpoints.len(), 2);

    let slow_reply = pending.await.unwrap().unwrap();
    assert_eq!(slow_reply.payload, Bytes::from_static(b"slow"));
    assert!(service.wait_for_drain(TIMEOUT).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_requests_to_one_endpoint_are_all_counted() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = add_service(transport.clone(), ServiceConfig::new("busy", "1.0.0")).unwrap();
    let running = Arc::new(AtomicU64::new(0));
    let peak = Arc::new(AtomicU64::new(0));
    let handler = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        handler_fn(move |request: Request| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);

                let n: u32 = std::str::from_utf8(request.data())
                    .map_err(anyhow::Error::from)?
                    .parse()
                    .map_err(anyhow::Error::from)?;
                if n % 2 == 1 {
                    return Err(ServiceError::new(422, "odd").into());
                }
                request.respond("even").await?;
                Ok(())
            }
        })
    };
    service.add_endpoint("parity", handler, EndpointOptions::default()).await.unwrap();
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    let replies = join_all((0..100u32).map(|n| {
        let client = client.clone();
        async move { client.request("parity", n.to_string(), TIMEOUT).await }
    }))
    .await;

    let failed = replies
        .iter()
        .filter(|reply| matches!(reply, Err(ClientError::Service { code: 422, .. })))
        .count();
    assert_eq!(failed, 50);
    assert_eq!(replies.iter().filter(|reply| reply.is_ok()).count(), 50);
    assert!(peak.load(Ordering::SeqCst) > 1, "handlers never overlapped");

    assert!(service.wait_for_drain(TIMEOUT).await);
    let snapshot = service.stats();
    let stats = &snapshot.endpoints[0];
    assert_eq!(stats.num_requests, 100);
    assert_eq!(stats.num_errors, 50);
    assert_eq!(stats.last_error, "odd");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn info_snapshots_stay_consistent_during_registration() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = add_service(transport.clone(), ServiceConfig::new("growing", "1.0.0")).unwrap();
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    let registering = {
        let service = service.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                let echo = handler_fn(|request: Request| async move {
                    request.respond("ok").await?;
                    Ok(())
                });
                service
                    .add_endpoint(&format!("e{i}"), echo, EndpointOptions::default())
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let mut snapshots = Vec::new();
    while !registering.is_finished() {
        let info = client
            .service("growing")
            .instance(service.id())
            .info(TIMEOUT)
            .await
            .unwrap();
        snapshots.push(info.endpoints.into_iter().map(|e| e.name).collect::<Vec<_>>());
    }
    registering.await.unwrap();

    let last: Vec<String> = service.info().endpoints.into_iter().map(|e| e.name).collect();
    assert_eq!(last.len(), 20);
    for snapshot in &snapshots {
        assert!(last.starts_with(snapshot), "{snapshot:?} is not a prefix of {last:?}");
    }
    let stats = client
        .service("growing")
        .instance(service.id())
        .stats(TIMEOUT)
        .await
        .unwrap();
    let names: Vec<String> = stats.endpoints.into_iter().map(|e| e.name).collect();
    assert_eq!(names, last);
}

#[tokio::test]
async fn endpoint_middlewares_wrap_replies() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = add_service(transport.clone(), ServiceConfig::new("wrapped", "1.0.0")).unwrap();
    let greet = handler_fn(|request: Request| async move {
        if request.data().is_empty() {
            return Err(ServiceError::new(400, "empty").into());
        }
        request.respond("hello").await?;
        Ok(())
    });
    let options = EndpointOptions::default()
        .with_middleware(middleware_fn(|request: Request, next: Next| async move {
            let mut response = next.run(request).await?;
            response.add_header("X-Version", "1.0.0");
            Ok(response)
        }))
        .with_middleware(middleware_fn(|request: Request, next: Next| async move {
            let mut response = next.run(request).await?;
            let mut data = response.data().to_vec();
            data.extend_from_slice(b"!");
            response.set_data(data);
            Ok(response)
        }));
    service.add_endpoint("greet", greet, options).await.unwrap();
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    let reply = client.request("greet", "me", TIMEOUT).await.unwrap();
    assert_eq!(reply.payload, Bytes::from_static(b"hello!"));
    assert_eq!(reply.headers.get("X-Version").map(String::as_str), Some("1.0.0"));

    let err = client.request("greet", "", TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ClientError::Service { code: 400, .. }));

    assert!(service.wait_for_drain(TIMEOUT).await);
    let snapshot = service.stats();
    let stats = &snapshot.endpoints[0];
    assert_eq!(stats.num_requests, 2);
    assert_eq!(stats.num_errors, 1);
}

#[tokio::test]
async fn in_flight_handler_finishes_after_stop() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = add_service(transport.clone(), ServiceConfig::new("draining", "1.0.0")).unwrap();
    let slow = handler_fn(|request: Request| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        request.respond("done").await?;
        Ok(())
    });
    service.add_endpoint("slow", slow, EndpointOptions::default()).await.unwrap();
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", "", TIMEOUT).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    service.stop().await;

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.payload, Bytes::from_static(b"done"));
    assert!(service.wait_for_drain(TIMEOUT).await);
}

#[tokio::test]
async fn scoped_service_is_stopped_on_exit() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = demo_service(&transport).await;
    let client = DiscoveryClient::new(transport.clone());

    let seen = service
        .run_scoped(|_running| {
            let client = client.clone();
            async move { client.ping(None, quick()).await.unwrap().len() }
        })
        .await
        .unwrap();
    assert_eq!(seen, 1);
    assert!(service.stopped());
    assert!(client.ping(None, quick()).await.unwrap().is_empty());
}

fn error_pattern() -> impl Strategy<Value = Vec<bool>> {
    proptest::collection::vec(any::<bool>(), 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn error_counts_follow_request_sequence(pattern in error_pattern()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (requests, errors, last_error) = runtime.block_on(async {
            let transport = Arc::new(InMemoryTransport::new());
            let service = add_service(transport.clone(), ServiceConfig::new("prop", "1.0.0")).unwrap();
            let handler = handler_fn(|request: Request| async move {
                let body = String::from_utf8_lossy(request.data()).into_owned();
                if let Some(tag) = body.strip_prefix("fail-") {
                    return Err(HandlerError::from(ServiceError::new(422, format!("failure {tag}"))));
                }
                request.respond("ok").await?;
                Ok(())
            });
            service.add_endpoint("work", handler, EndpointOptions::default()).await.unwrap();
            service.start().await.unwrap();
            let client = DiscoveryClient::new(transport.clone());

            for (i, fail) in pattern.iter().enumerate() {
                let body = if *fail { format!("fail-{i}") } else { format!("ok-{i}") };
                let _ = client.request("work", body, TIMEOUT).await;
            }
            let stats = service.stats().endpoints.remove(0);
            (stats.num_requests, stats.num_errors, stats.last_error)
        });

        let expected_errors = pattern.iter().filter(|fail| **fail).count() as u64;
        prop_assert_eq!(requests, pattern.len() as u64);
        prop_assert_eq!(errors, expected_errors);
        match pattern.iter().rposition(|fail| *fail) {
            Some(i) => prop_assert_eq!(last_error, format!("failure {i}")),
            None => prop_assert!(last_error.is_empty()),
        }
    }
}

#[tokio::test]
async fn average_is_total_over_successful_requests() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = demo_service(&transport).await;
    service.start().await.unwrap();
    let client = DiscoveryClient::new(transport.clone());

    for _ in 0..10 {
        client.request("demo.ECHO", "x", TIMEOUT).await.unwrap();
    }
    // The last handler may still be recording its time after replying.
    assert!(service.wait_for_drain(TIMEOUT).await);
    let stats = service.stats().endpoints.remove(0);
    assert_eq!(stats.num_requests, 10);
    assert_eq!(stats.num_errors, 0);
    assert_eq!(stats.average_processing_time, stats.processing_time / 10);
}
