#![allow(clippy::unwrap_used)]

mod support;

use std::time::Duration;

use courier_common::EmailMessage;
use courier_dispatch::{
    Mailer,
    keepalive::KeepAliveMonitor,
    testing::{MailerCall, ScriptedMailer},
};
use courier_smtp::SendFailure;
use pretty_assertions::assert_eq;
use support::shared;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_secs(120);

#[tokio::test(start_paused = true)]
async fn probes_on_the_interval_and_reconnects_once_on_disconnect() {
    let mailer = ScriptedMailer::new();
    mailer
        .script_probe(Err(SendFailure::Disconnected("timed out".to_string())))
        .await;
    let token = CancellationToken::new();
    let start = Instant::now();

    let monitor = KeepAliveMonitor::spawn("test", shared(mailer.clone()), INTERVAL, &token);

    tokio::time::sleep(Duration::from_secs(121)).await;
    let calls = mailer.timed_calls().await;
    assert_eq!(
        calls.iter().map(|(call, _)| call.clone()).collect::<Vec<_>>(),
        vec![MailerCall::Probe, MailerCall::Reconnect]
    );
    assert_eq!(calls[0].1.duration_since(start), INTERVAL);

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(
        mailer.calls().await,
        vec![MailerCall::Probe, MailerCall::Reconnect, MailerCall::Probe]
    );

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn other_probe_failures_do_not_reconnect() {
    let mailer = ScriptedMailer::new();
    mailer
        .script_probe(Err(SendFailure::Unknown("500 what?".to_string())))
        .await;
    let token = CancellationToken::new();

    let monitor = KeepAliveMonitor::spawn("test", shared(mailer.clone()), INTERVAL, &token);

    tokio::time::sleep(Duration::from_secs(241)).await;
    assert_eq!(
        mailer.calls().await,
        vec![MailerCall::Probe, MailerCall::Probe]
    );

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stopping_ends_the_loop() {
    let mailer = ScriptedMailer::new();
    let token = CancellationToken::new();

    let monitor = KeepAliveMonitor::spawn("test", shared(mailer.clone()), INTERVAL, &token);
    tokio::time::sleep(Duration::from_secs(10)).await;
    monitor.stop().await;

    tokio::time::sleep(INTERVAL * 5).await;
    assert!(mailer.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn parent_cancellation_stops_probing() {
    let mailer = ScriptedMailer::new();
    let token = CancellationToken::new();

    let monitor = KeepAliveMonitor::spawn("test", shared(mailer.clone()), INTERVAL, &token);
    token.cancel();

    tokio::time::sleep(INTERVAL * 3).await;
    assert!(mailer.calls().await.is_empty());

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn keep_alive_waits_for_a_send_in_flight() {
    let mailer = ScriptedMailer::new();
    mailer.slow_sends(Duration::from_secs(30)).await;
    let session = shared(mailer.clone());
    let token = CancellationToken::new();
    let start = Instant::now();

    let monitor = KeepAliveMonitor::spawn("test", session.clone(), INTERVAL, &token);

    tokio::time::sleep(Duration::from_secs(100)).await;
    let sending = tokio::spawn({
        let session = session.clone();
        async move {
            let message = EmailMessage::new("Hello", "Hi").recipient("ada@example.com");
            session.lock().await.send(&message).await
        }
    });

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(mailer.count(|call| *call == MailerCall::Probe).await, 0);

    sending.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let calls = mailer.timed_calls().await;
    assert!(matches!(calls[0].0, MailerCall::Send(_)));
    assert_eq!(calls[0].1.duration_since(start), Duration::from_secs(100));
    assert_eq!(calls[1].0, MailerCall::Probe);
    assert_eq!(calls[1].1.duration_since(start), Duration::from_secs(130));

    monitor.stop().await;
}
