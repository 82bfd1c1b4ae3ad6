//! `SmtpSession` against the scriptable mock server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use courier_common::{EmailMessage, SmtpConfig};
use courier_smtp::{
    SendFailure, SessionError, SessionOptions, SessionState, SmtpSession,
    testing::{MockSmtpServer, SmtpCommand},
};
use pretty_assertions::assert_eq;

fn config_for(server: &MockSmtpServer) -> SmtpConfig {
    let mut config = SmtpConfig::new(
        server.host(),
        "FileServer <noreply@example.com>",
        "mailer",
        "hunter2",
    );
    config.port = server.port();
    config.debug = true;
    config
}

fn options() -> SessionOptions {
    SessionOptions {
        connect_timeout: Duration::from_millis(500),
        helo_name: "courier.test".to_string(),
    }
}

fn welcome() -> EmailMessage {
    EmailMessage::new(
        "Welcome to FileServer! [do not reply]",
        "Hello Ada,\n.hidden line\nBye",
    )
    .recipient("ada@example.com")
}

async fn ready_session(server: &MockSmtpServer) -> SmtpSession {
    let mut session = SmtpSession::new(config_for(server), options());
    session.connect().await.unwrap();
    session.authenticate().await.unwrap();
    session
}

#[tokio::test]
async fn connect_authenticate_and_send() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let mut session = SmtpSession::new(config_for(&server), options());

    let greeting = session.connect().await.unwrap();
    assert_eq!(greeting.code, 220);
    assert_eq!(
        session.state(),
        SessionState {
            connected: true,
            authenticated: false
        }
    );

    let login = session.authenticate().await.unwrap();
    assert_eq!(login.code, 235);
    assert!(session.state().authenticated);

    session.send(&welcome()).await.unwrap();

    let commands = server.commands().await;
    assert_eq!(commands[0], SmtpCommand::Ehlo("courier.test".to_string()));
    assert!(matches!(&commands[1], SmtpCommand::Auth(arg) if arg.starts_with("PLAIN ")));
    assert_eq!(
        commands[2],
        SmtpCommand::MailFrom("FROM:<noreply@example.com> SMTPUTF8 BODY=8BITMIME".to_string())
    );
    assert_eq!(
        commands[3],
        SmtpCommand::RcptTo("TO:<ada@example.com>".to_string())
    );
    assert_eq!(commands[4], SmtpCommand::Data);

    let messages = server.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Subject: Welcome to FileServer! [do not reply]\r\n"));
    assert!(messages[0].contains("To: ada@example.com\r\n"));
    assert!(messages[0].contains("\r\n.hidden line\r\n"));
}

#[tokio::test]
async fn auth_login_is_used_when_plain_is_not_offered() {
    let server = MockSmtpServer::builder()
        .with_capabilities(&["mock.example.com", "AUTH LOGIN"])
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    assert!(session.state().authenticated);
    assert_eq!(
        server.commands().await[1],
        SmtpCommand::Auth("LOGIN".to_string())
    );

    session.send(&welcome()).await.unwrap();
    assert_eq!(
        server.commands().await[2],
        SmtpCommand::MailFrom("FROM:<noreply@example.com>".to_string())
    );
}

#[tokio::test]
async fn rejected_credentials_are_an_authentication_error() {
    let server = MockSmtpServer::builder()
        .with_response("AUTH", 535, "Authentication credentials invalid")
        .build()
        .await
        .unwrap();
    let mut session = SmtpSession::new(config_for(&server), options());
    session.connect().await.unwrap();

    let error = session.authenticate().await.unwrap_err();

    assert!(matches!(error, SessionError::Authentication(_)));
    assert!(!session.state().authenticated);
    assert!(session.state().connected);
}

#[tokio::test]
async fn starttls_without_server_support_fails_authentication() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let mut config = config_for(&server);
    config.starttls = true;
    let mut session = SmtpSession::new(config, options());
    session.connect().await.unwrap();

    let error = session.authenticate().await.unwrap_err();

    assert!(matches!(error, SessionError::Authentication(_)));
    assert_eq!(server.count(|c| matches!(c, SmtpCommand::Auth(_))).await, 0);
}

#[tokio::test]
async fn unreachable_server_is_a_connection_error() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let config = config_for(&server);
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = SmtpSession::new(config, options());
    let error = session.connect().await.unwrap_err();

    assert!(matches!(error, SessionError::Connection { .. }));
    assert_eq!(session.state(), SessionState::default());
}

#[tokio::test]
async fn slow_greeting_times_out() {
    let server = MockSmtpServer::builder()
        .with_connection_delay(Duration::from_secs(5))
        .build()
        .await
        .unwrap();
    let mut session = SmtpSession::new(config_for(&server), options());

    let error = session.connect().await.unwrap_err();

    assert!(matches!(error, SessionError::Timeout { .. }));
}

#[tokio::test]
async fn permanent_sender_refusal_means_auth_required() {
    let server = MockSmtpServer::builder()
        .with_scripted_response("MAIL", 530, "Authentication required")
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    let failure = session.send(&welcome()).await.unwrap_err();

    assert_eq!(
        failure,
        SendFailure::AuthRequired {
            code: 530,
            message: "Authentication required".to_string()
        }
    );
    assert_eq!(server.count(|c| *c == SmtpCommand::Rset).await, 1);

    // The connection survives the reset.
    session.send(&welcome()).await.unwrap();
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn transient_sender_refusal_is_reported_with_its_code() {
    let server = MockSmtpServer::builder()
        .with_scripted_response("MAIL", 451, "Try again later")
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    let failure = session.send(&welcome()).await.unwrap_err();

    assert_eq!(
        failure,
        SendFailure::SenderRefusedOther {
            code: 451,
            message: "Try again later".to_string()
        }
    );
}

#[tokio::test]
async fn all_recipients_refused_is_permanent() {
    let server = MockSmtpServer::builder()
        .with_response("RCPT", 550, "No such user")
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    let failure = session.send(&welcome()).await.unwrap_err();

    assert!(matches!(failure, SendFailure::PermanentRejection(reason) if reason.contains("ada@example.com")));
    assert_eq!(server.count(|c| *c == SmtpCommand::Data).await, 0);
}

#[tokio::test]
async fn partially_refused_recipients_still_deliver() {
    let server = MockSmtpServer::builder()
        .with_scripted_response("RCPT", 550, "No such user")
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    session
        .send(&welcome().recipient("grace@example.com"))
        .await
        .unwrap();

    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn rejected_content_is_permanent() {
    let server = MockSmtpServer::builder()
        .with_scripted_response("CONTENT", 554, "Message rejected as spam")
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    let failure = session.send(&welcome()).await.unwrap_err();

    assert_eq!(
        failure,
        SendFailure::PermanentRejection("554 Message rejected as spam".to_string())
    );
}

#[tokio::test]
async fn line_breaks_in_a_recipient_are_refused_before_the_envelope() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let mut session = ready_session(&server).await;

    let injected = EmailMessage::new("Welcome to FileServer! [do not reply]", "Hi")
        .recipient("ada@example.com>\r\nRCPT TO:<evil@attacker.test");
    let failure = session.send(&injected).await.unwrap_err();

    assert!(matches!(failure, SendFailure::PermanentRejection(reason) if reason.starts_with("To contains")));
    assert_eq!(
        server
            .count(|c| matches!(c, SmtpCommand::MailFrom(_) | SmtpCommand::RcptTo(_)))
            .await,
        0
    );

    tokio::time::timeout(Duration::from_secs(3), session.send(&welcome()))
        .await
        .expect("the connection is still in step")
        .unwrap();

    assert_eq!(
        server
            .count(|c| *c == SmtpCommand::RcptTo("TO:<evil@attacker.test>".to_string()))
            .await,
        0
    );
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn dropped_connection_is_a_disconnect_and_reconnect_recovers() {
    let server = MockSmtpServer::builder()
        .with_scripted_drop("MAIL")
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    let failure = session.send(&welcome()).await.unwrap_err();
    assert!(failure.is_disconnect());
    assert_eq!(session.state(), SessionState::default());

    // Without a connection every send is a disconnect.
    assert!(session.send(&welcome()).await.unwrap_err().is_disconnect());

    let state = session.reconnect().await;
    assert_eq!(
        state,
        SessionState {
            connected: true,
            authenticated: true
        }
    );
    assert_eq!(server.connection_count(), 2);

    session.send(&welcome()).await.unwrap();
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn reconnect_swallows_failures() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let mut session = ready_session(&server).await;
    server.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = session.reconnect().await;

    assert_eq!(state, SessionState::default());
}

#[tokio::test]
async fn probe_detects_a_closed_peer() {
    let server = MockSmtpServer::builder()
        .with_scripted_drop("NOOP")
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    assert!(session.probe().await.unwrap_err().is_disconnect());
    assert!(!session.state().connected);

    session.reconnect().await;
    session.probe().await.unwrap();
}

#[tokio::test]
async fn service_closing_reply_to_probe_is_a_disconnect() {
    let server = MockSmtpServer::builder()
        .with_scripted_response("NOOP", 421, "Service closing transmission channel")
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    let failure = session.probe().await.unwrap_err();

    assert!(failure.is_disconnect());
}

#[tokio::test]
async fn reauthenticate_logs_in_again_on_the_same_connection() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let mut session = ready_session(&server).await;

    session.reauthenticate().await.unwrap();

    assert_eq!(server.count(|c| matches!(c, SmtpCommand::Auth(_))).await, 2);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn close_sends_quit_and_tolerates_a_missing_peer() {
    let server = MockSmtpServer::builder()
        .with_scripted_drop("QUIT")
        .build()
        .await
        .unwrap();
    let mut session = ready_session(&server).await;

    session.close().await.unwrap();
    assert_eq!(server.count(|c| *c == SmtpCommand::Quit).await, 1);
    assert_eq!(session.state(), SessionState::default());

    // Closing twice is a no-op.
    session.close().await.unwrap();
}
