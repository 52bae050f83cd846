use std::time::Duration;

use crate::{Config, Error, FutureState, Request, TimeoutKind};

use super::scenario::*;

fn timeouts(request: Option<u64>, read: Option<u64>) -> Config {
    Config::default()
        .request_timeout(request.map(Duration::from_millis))
        .read_timeout(read.map(Duration::from_millis))
}

#[tokio::test(start_paused = true)]
async fn request_timeout_fires() {
    let mock = MockTransport::new().dial(Dial::ok(vec![vec![Script::Stall]]));
    let client = mock.client(timeouts(Some(1000), None));

    let req = Request::get("http://a.test/").build().unwrap();
    let future = client.send(req);
    let err = future.get().await.unwrap_err();

    assert_eq!(
        err,
        Error::Timeout {
            kind: TimeoutKind::Request,
            after: Duration::from_secs(1),
            remote: Some(addr("127.0.0.1:80")),
        }
    );
    assert_eq!(err.to_string(), "request timeout of 1000ms to 127.0.0.1:80");
    assert_eq!(future.state(), FutureState::Failed);

    // Timeouts are not retried.
    assert_eq!(mock.connects().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_fires() {
    let script = vec![
        status(200),
        headers(&[]),
        Script::Delay(Duration::from_secs(2)),
        end(),
    ];
    let mock = MockTransport::new().dial(Dial::ok(vec![script]));
    let client = mock.client(timeouts(None, Some(500)));

    let req = Request::get("http://a.test/").build().unwrap();
    let err = client.send(req).get().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Timeout {
            kind: TimeoutKind::Idle,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn steady_transfer_beats_idle_timeout() {
    let delay = || Script::Delay(Duration::from_millis(300));
    let script = vec![
        status(200),
        headers(&[]),
        delay(),
        part("a"),
        delay(),
        part("b"),
        delay(),
        part("c"),
        end(),
    ];
    let mock = MockTransport::new().dial(Dial::ok(vec![script]));
    let client = mock.client(timeouts(None, Some(500)));

    let req = Request::get("http://a.test/").build().unwrap();
    let res = client.send(req).get().await.unwrap();

    assert_eq!(res.body(), "abc");
}

#[tokio::test(start_paused = true)]
async fn per_request_timeout_overrides_config() {
    let mock = MockTransport::new().dial(Dial::ok(vec![vec![Script::Stall]]));
    let client = mock.client(timeouts(Some(60_000), None));

    let req = Request::get("http://a.test/")
        .request_timeout(Some(Duration::from_millis(200)))
        .build()
        .unwrap();
    let err = client.send(req).get().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Timeout {
            kind: TimeoutKind::Request,
            after,
            ..
        } if after == Duration::from_millis(200)
    ));
}

#[tokio::test(start_paused = true)]
async fn timers_do_not_outlive_response() {
    let mock = MockTransport::new().dial(Dial::ok(vec![ok("x")]));
    let client = mock.client(timeouts(Some(1000), Some(500)));

    let req = Request::get("http://a.test/").build().unwrap();
    let future = client.send(req);
    future.get().await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(future.state(), FutureState::Completed);
    assert!(future.try_get().unwrap().is_ok());
}

#[tokio::test]
async fn cancel_fails_future_and_closes_connection() {
    let mock = MockTransport::new().dial(Dial::ok(vec![vec![Script::Stall]]));
    let client = mock.client(Config::default());

    let recorder = Recorder::new();
    let events = recorder.events.clone();

    let req = Request::get("http://a.test/").build().unwrap();
    let future = client.execute(req, recorder);
    mock.until_connects(1).await;

    assert!(future.cancel());
    assert!(!future.cancel());
    assert_eq!(future.get().await.unwrap_err(), Error::Cancelled);
    assert_eq!(future.state(), FutureState::Cancelled);

    while mock.closes() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(client.pool().stats().open, 0);
    assert_eq!(events.lock().clone(), vec!["throwable request was cancelled"]);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_reported() {
    let mock = MockTransport::new().dial(Dial::Hang);
    let config = Config::default()
        .connect_timeout(Duration::from_secs(2))
        .max_request_retry(0);
    let client = mock.client(config);

    let req = Request::get("http://a.test/").build().unwrap();
    let err = client.send(req).get().await.unwrap_err();

    assert_eq!(
        err,
        Error::ConnectTimeout {
            after: Duration::from_secs(2),
            remote: addr("127.0.0.1:80"),
        }
    );
}
