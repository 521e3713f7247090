#![allow(missing_docs)]

mod common;

use common::test_helpers::{
    message, message_key, next_call, no_call, too_many_requests, with_quota, ManualTransport,
    ScriptedTransport,
};
use ratelane::telemetry::MemorySink;
use ratelane::{
    Clock, DispatchEvent, Dispatcher, DispatcherConfig, Method, MonotonicClock, Quota,
    RateLimitScope, RawResponse, Route, TrackingSleeper,
};
use std::time::Duration;
use tokio::time::Instant;

fn guild_request(guild_id: u64, label: &str) -> ratelane::ApiRequest {
    let mut request = Route::new(Method::Patch, "/guilds/{guild_id}")
        .param("guild_id", guild_id)
        .request()
        .unwrap();
    request.descriptor = request.descriptor.body(label.to_owned());
    request
}

#[tokio::test(start_paused = true)]
async fn route_rejection_pauses_only_that_bucket() {
    let (transport, mut calls) = ManualTransport::new();
    let dispatcher = Dispatcher::new(transport);

    let r = dispatcher.execute(guild_request(9, "R"));
    let s = dispatcher.execute(guild_request(9, "S"));

    let first = next_call(&mut calls, Duration::from_millis(10)).await;
    assert_eq!(first.label(), "R");
    let rejected_at = first.at;
    first.respond(too_many_requests(2.0, false));

    // another bucket is unaffected
    let elsewhere = dispatcher.execute(guild_request(10, "elsewhere"));
    let call = next_call(&mut calls, Duration::from_millis(10)).await;
    assert_eq!(call.label(), "elsewhere");
    assert!(call.at - rejected_at < Duration::from_millis(10));
    call.respond(RawResponse::new(200));
    elsewhere.await.unwrap();
    assert!(dispatcher.global_gate().is_open());

    // R goes first again, no earlier than the server asked
    let retry = next_call(&mut calls, Duration::from_secs(5)).await;
    assert_eq!(retry.label(), "R");
    assert!(retry.at - rejected_at >= Duration::from_secs(2));
    retry.respond(RawResponse::new(200).body("{}"));

    let then = next_call(&mut calls, Duration::from_millis(10)).await;
    assert_eq!(then.label(), "S");
    then.respond(RawResponse::new(204));

    assert_eq!(r.await.unwrap().status, 200);
    assert_eq!(s.await.unwrap().status, 204);
}

#[tokio::test(start_paused = true)]
async fn rejection_marks_the_bucket_exhausted() {
    let transport = ScriptedTransport::new().then(too_many_requests(2.0, false));
    let sink = MemorySink::new();
    let dispatcher = Dispatcher::builder(transport.clone()).telemetry(sink.clone()).build();

    let key = guild_request(9, "").bucket;
    let handle = dispatcher.execute(guild_request(9, "R"));

    // wait for the rejection to be processed
    while !sink.events().iter().any(|e| matches!(e, DispatchEvent::Requeued { .. })) {
        tokio::task::yield_now().await;
    }
    let now = dispatcher.buckets().clock().now_millis();
    let state = dispatcher.buckets().get(&key);
    assert_eq!(state.remaining(), 0);
    assert_eq!(state.wait_time(now), Some(Duration::from_secs(2)));
    assert_eq!(dispatcher.queued(&key), 1);

    handle.await.unwrap();
    assert_eq!(transport.labels(), ["R", "R"]);
}

#[tokio::test(start_paused = true)]
async fn global_rejection_halts_every_bucket() {
    let (transport, mut calls) = ManualTransport::new();
    let dispatcher = Dispatcher::new(transport);

    let mut handles = Vec::new();
    for channel in 1..=3 {
        handles.push(dispatcher.execute(message(channel, &format!("{channel}-first"))));
        handles.push(dispatcher.execute(message(channel, &format!("{channel}-second"))));
    }

    let mut first_wave = Vec::new();
    for _ in 0..3 {
        first_wave.push(next_call(&mut calls, Duration::from_millis(10)).await);
    }
    first_wave.sort_by_key(|c| c.label());
    let labels: Vec<_> = first_wave.iter().map(|c| c.label()).collect();
    assert_eq!(labels, ["1-first", "2-first", "3-first"]);

    let mut first_wave = first_wave.into_iter();
    let trigger = first_wave.next().unwrap();
    trigger.respond(too_many_requests(1.0, true));
    while dispatcher.global_gate().is_open() {
        tokio::task::yield_now().await;
    }
    let tripped_at = Instant::now();
    assert_eq!(dispatcher.global_gate().wait_time(), Some(Duration::from_secs(1)));

    // plenty of quota everywhere else, still nothing moves
    for call in first_wave {
        call.respond(with_quota(4, 5, 10.0));
    }
    no_call(&mut calls, Duration::from_millis(900)).await;

    let mut second_wave = Vec::new();
    for _ in 0..3 {
        let call = next_call(&mut calls, Duration::from_millis(200)).await;
        assert!(call.at - tripped_at >= Duration::from_secs(1));
        second_wave.push(call);
    }
    second_wave.sort_by_key(|c| c.label());
    let labels: Vec<_> = second_wave.iter().map(|c| c.label()).collect();
    assert_eq!(labels, ["1-first", "2-second", "3-second"]);

    for call in second_wave {
        call.respond(RawResponse::new(200));
    }
    let remaining = next_call(&mut calls, Duration::from_millis(10)).await;
    assert_eq!(remaining.label(), "1-second");
    remaining.respond(RawResponse::new(200));

    for handle in handles {
        handle.await.unwrap();
    }
    assert!(dispatcher.global_gate().is_open());
}

#[tokio::test(start_paused = true)]
async fn closed_gate_overrides_bucket_quota() {
    let (transport, mut calls) = ManualTransport::new();
    let dispatcher = Dispatcher::new(transport);
    let now = dispatcher.buckets().clock().now_millis();
    dispatcher
        .buckets()
        .update(&message_key(5), Quota { remaining: 5, limit: 5, reset_at: now + 60_000, bucket_id: None });

    let start = Instant::now();
    dispatcher.global_gate().trip(Duration::from_millis(1_500));
    let handle = dispatcher.execute(message(5, "gated"));

    let call = next_call(&mut calls, Duration::from_secs(3)).await;
    assert!(call.at - start >= Duration::from_millis(1_500));
    call.respond(RawResponse::new(200));
    handle.await.unwrap();
    assert_eq!(dispatcher.buckets().get(&message_key(5)).remaining(), 4);
}

#[tokio::test(start_paused = true)]
async fn body_scope_wins_over_global_header() {
    let mislabelled = too_many_requests(0.25, false).header("X-RateLimit-Global", "true");
    let transport = ScriptedTransport::new().then(mislabelled);
    let sink = MemorySink::new();
    let dispatcher = Dispatcher::builder(transport.clone()).telemetry(sink.clone()).build();

    dispatcher.execute(message(1, "x")).await.unwrap();

    assert!(dispatcher.global_gate().is_open());
    assert!(!sink.events().iter().any(|e| matches!(e, DispatchEvent::GlobalLimitTripped { .. })));
    assert!(sink.events().iter().any(|e| matches!(
        e,
        DispatchEvent::Requeued { scope: RateLimitScope::Route, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn retry_after_is_capped_by_configuration() {
    let transport = ScriptedTransport::new().then(too_many_requests(3600.0, false));
    let config = DispatcherConfig::builder().max_retry_after(Duration::from_secs(5)).build().unwrap();
    let dispatcher = Dispatcher::builder(transport.clone()).config(config).build();

    let start = Instant::now();
    dispatcher.execute(message(1, "capped")).await.unwrap();
    let times = transport.times();
    assert!(times[1] - start >= Duration::from_secs(5));
    assert!(times[1] - start < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn missing_retry_after_uses_the_fallback() {
    let bare = RawResponse::new(429).body("<html>slow down</html>");
    let transport = ScriptedTransport::new().then(bare);
    let config = DispatcherConfig::builder()
        .fallback_retry_after(Duration::from_millis(750))
        .build()
        .unwrap();
    let dispatcher = Dispatcher::builder(transport.clone()).config(config).build();

    let start = Instant::now();
    dispatcher.execute(message(1, "x")).await.unwrap();
    let times = transport.times();
    assert!(times[1] - start >= Duration::from_millis(750));
}

#[tokio::test(start_paused = true)]
async fn workers_sleep_exactly_as_long_as_asked() {
    let transport = ScriptedTransport::new().then(too_many_requests(2.0, false));
    let sleeper = TrackingSleeper::new();
    let dispatcher = Dispatcher::builder(transport)
        .clock(MonotonicClock::default())
        .sleeper(sleeper.clone())
        .build();

    dispatcher.execute(guild_request(9, "R")).await.unwrap();
    assert_eq!(sleeper.calls(), [Duration::from_secs(2)]);
}
