use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use webtask::mock::{MockReply, MockTransport};
use webtask::{
    Challenge, ChallengeKind, Client, Credential, Disposition, Outcome, ResponseMeta,
    StaticCredentials, TaskError,
};

fn counting_handler(calls: Arc<AtomicU32>) -> impl Fn(&Challenge) -> Result<Disposition, TaskError> + Send + Sync {
    move |_challenge: &Challenge| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Disposition::UseCredential(Credential::basic("alice", "secret")))
    }
}

fn started_task(client: &Client, mock: &MockTransport) -> (webtask::Task, webtask::TransferId) {
    let task = client.get("private").build().unwrap();
    task.resume();
    let id = task.transfer_id().expect("transfer should be started");
    assert_eq!(mock.last_transfer().unwrap().id, id);
    (task, id)
}

#[test]
fn basic_challenges_are_capped_per_task() {
    let mock = MockTransport::new().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let client = Client::builder("https://api.example.com")
        .transport(mock.clone())
        .max_auth_retry(3)
        .authentication_handler(counting_handler(calls.clone()))
        .build()
        .unwrap();
    let (task, id) = started_task(&client, &mock);

    let challenge = Challenge::new(ChallengeKind::HttpBasic).with_realm("private");
    let dispositions: Vec<_> = (0..4)
        .map(|failures| mock.challenge(id, &challenge.clone().with_previous_failures(failures)).unwrap())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(dispositions[0], Disposition::UseCredential(_)));
    assert!(matches!(dispositions[2], Disposition::UseCredential(_)));
    assert_eq!(dispositions[3], Disposition::PerformDefaultHandling);
    assert_eq!(task.auth_attempts(), 3);

    // The cap is per task
    let (second, second_id) = started_task(&client, &mock);
    assert!(matches!(mock.challenge(second_id, &challenge), Some(Disposition::UseCredential(_))));
    assert_eq!(second.auth_attempts(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn zero_max_retry_means_no_cap() {
    let mock = MockTransport::new().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let client = Client::builder("https://api.example.com")
        .transport(mock.clone())
        .authentication_handler(counting_handler(calls.clone()))
        .build()
        .unwrap();
    assert_eq!(client.max_auth_retry(), 0);
    let (_task, id) = started_task(&client, &mock);

    for _ in 0..10 {
        let disposition = mock.challenge(id, &Challenge::new(ChallengeKind::Default)).unwrap();
        assert!(matches!(disposition, Disposition::UseCredential(_)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[test]
fn other_challenge_kinds_are_always_forwarded() {
    let mock = MockTransport::new().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let client = Client::builder("https://api.example.com")
        .transport(mock.clone())
        .max_auth_retry(1)
        .authentication_handler(counting_handler(calls.clone()))
        .build()
        .unwrap();
    let (task, id) = started_task(&client, &mock);

    for kind in [ChallengeKind::HttpDigest, ChallengeKind::Ntlm, ChallengeKind::ServerTrust] {
        for _ in 0..2 {
            mock.challenge(id, &Challenge::new(kind)).unwrap();
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(task.auth_attempts(), 0);
}

#[test]
fn without_a_handler_default_handling_is_used() {
    let mock = MockTransport::new().unwrap();
    let client = Client::builder("https://api.example.com").transport(mock.clone()).build().unwrap();
    let (_task, id) = started_task(&client, &mock);

    let disposition = mock.challenge(id, &Challenge::new(ChallengeKind::HttpBasic)).unwrap();
    assert_eq!(disposition, Disposition::PerformDefaultHandling);
}

#[test]
fn handler_error_fails_the_task_and_cancels_the_challenge() {
    let mock = MockTransport::new().unwrap();
    let client = Client::builder("https://api.example.com")
        .transport(mock.clone())
        .authentication_handler(|_: &Challenge| -> Result<Disposition, TaskError> {
            Err(TaskError::domain("no credentials for realm"))
        })
        .build()
        .unwrap();
    let (task, id) = started_task(&client, &mock);
    let ran = Arc::new(AtomicU32::new(0));
    let r = ran.clone();
    task.on_response(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let disposition = mock.challenge(id, &Challenge::new(ChallengeKind::HttpBasic)).unwrap();
    assert_eq!(disposition, Disposition::CancelAuthenticationChallenge);

    // Even a successful transfer keeps the recorded failure
    mock.complete(id, Some(ResponseMeta::new(StatusCode::UNAUTHORIZED)), None);
    let status = task.wait(Duration::from_secs(5));
    assert!(matches!(
        status.outcome().and_then(Outcome::error),
        Some(TaskError::Domain(msg)) if msg == "no credentials for realm"
    ));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn task_authenticate_installs_client_handler() {
    let mock = MockTransport::with_responder(|_| {
        MockReply::ok("welcome").with_challenge(Challenge::new(ChallengeKind::HttpBasic))
    })
    .unwrap();
    let client = Client::builder("https://api.example.com").transport(mock.clone()).build().unwrap();

    let task = client.get("private").build().unwrap();
    task.authenticate(StaticCredentials::new(Credential::bearer("token-1")));
    let status = task.resume_and_wait(Duration::from_secs(5));

    assert!(status.outcome().is_some_and(Outcome::is_success));
    let transfer = mock.last_transfer().unwrap();
    assert_eq!(
        transfer.dispositions,
        vec![Disposition::UseCredential(Credential::bearer("token-1"))]
    );

    // Installed on the client, so later tasks see it too
    let second = client.get("private/2").build().unwrap();
    assert!(second
        .resume_and_wait(Duration::from_secs(5))
        .outcome()
        .is_some_and(Outcome::is_success));
    assert!(matches!(
        mock.last_transfer().unwrap().dispositions.as_slice(),
        [Disposition::UseCredential(_)]
    ));
}
