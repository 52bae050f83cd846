use std::io;
use std::sync::Arc;

use http::{header, HeaderValue, StatusCode};

use crate::{AuthScheme, Authenticator, Challenge, Client, Config, Error, ProxyServer};
use crate::{Realm, Request, RequestHead};

use super::scenario::*;

/// Walks a connection oriented handshake, one token per step.
struct Handshake;

impl Authenticator for Handshake {
    fn authorize(
        &self,
        _realm: &Realm,
        challenge: &Challenge,
        _head: &RequestHead,
        step: u32,
    ) -> Result<Option<HeaderValue>, Error> {
        if challenge.scheme != AuthScheme::Ntlm {
            return Ok(None);
        }
        let token = format!("NTLM step{}", step);
        Ok(Some(HeaderValue::from_str(&token).unwrap()))
    }
}

fn challenge(code: u16, name: &str, value: &str) -> Vec<Script> {
    response(code, &[(name, value), ("content-length", "0")], "")
}

#[tokio::test]
async fn basic_challenge_answered() {
    let mock = MockTransport::new().dial(Dial::ok(vec![
        challenge(401, "www-authenticate", "Basic realm=\"x\""),
        ok("in"),
    ]));
    let client = mock.client(Config::default());

    let req = Request::get("http://a.test/")
        .realm(Realm::basic("u", "p"))
        .build()
        .unwrap();
    let res = client.send(req).get().await.unwrap();

    assert_eq!(res.body(), "in");

    let heads = mock.heads();
    assert!(heads[0].headers.get(header::AUTHORIZATION).is_none());
    assert_eq!(heads[1].headers[header::AUTHORIZATION], "Basic dTpw");
    assert_eq!(mock.connects().len(), 1);
}

#[tokio::test]
async fn basic_challenge_answered_once() {
    let mock = MockTransport::new().dial(Dial::ok(vec![
        challenge(401, "www-authenticate", "Basic realm=\"x\""),
        challenge(401, "www-authenticate", "Basic realm=\"x\""),
    ]));
    let client = mock.client(Config::default());

    let req = Request::get("http://a.test/")
        .realm(Realm::basic("u", "wrong"))
        .build()
        .unwrap();
    let res = client.send(req).get().await.unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(mock.heads().len(), 2);
}

#[tokio::test]
async fn challenge_without_realm_delivered() {
    let mock = MockTransport::new().dial(Dial::ok(vec![challenge(
        401,
        "www-authenticate",
        "Basic realm=\"x\"",
    )]));
    let client = mock.client(Config::default());

    let req = Request::get("http://a.test/").build().unwrap();
    let res = client.send(req).get().await.unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(mock.heads().len(), 1);
}

#[tokio::test]
async fn unanswerable_scheme_delivered() {
    let mock = MockTransport::new().dial(Dial::ok(vec![challenge(
        401,
        "www-authenticate",
        "Digest realm=\"x\", nonce=\"abc\"",
    )]));
    let client = mock.client(Config::default());

    let req = Request::get("http://a.test/")
        .realm(Realm::new(AuthScheme::Digest, "u", "p"))
        .build()
        .unwrap();
    let res = client.send(req).get().await.unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(mock.heads().len(), 1);
}

#[tokio::test]
async fn connection_oriented_handshake_keeps_connection() {
    let mock = MockTransport::new().dial(Dial::ok(vec![
        challenge(401, "www-authenticate", "NTLM"),
        challenge(401, "www-authenticate", "NTLM abc"),
        ok("in"),
    ]));
    let client = Client::with_authenticator(mock.clone(), Config::default(), Arc::new(Handshake));

    let req = Request::get("http://a.test/")
        .realm(Realm::new(AuthScheme::Ntlm, "u", "p"))
        .build()
        .unwrap();
    let future = client.send(req);
    let res = future.get().await.unwrap();

    assert_eq!(res.body(), "in");
    assert_eq!(mock.connects().len(), 1);

    let heads = mock.heads();
    assert_eq!(heads[1].headers[header::AUTHORIZATION], "NTLM step0");
    assert_eq!(heads[2].headers[header::AUTHORIZATION], "NTLM step1");

    // Challenges are not retries.
    assert_eq!(future.current_retry(), 0);
}

#[tokio::test]
async fn no_retry_during_handshake() {
    let reset = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
    let mock = MockTransport::new()
        .dial(Dial::ok(vec![
            challenge(401, "www-authenticate", "NTLM"),
            vec![Script::Error(reset)],
        ]))
        .dial(Dial::ok(vec![ok("unused")]));
    let client = Client::with_authenticator(mock.clone(), Config::default(), Arc::new(Handshake));

    let req = Request::get("http://a.test/")
        .realm(Realm::new(AuthScheme::Ntlm, "u", "p"))
        .build()
        .unwrap();
    let err = client.send(req).get().await.unwrap_err();

    assert!(err.is_io());
    assert_eq!(mock.connects().len(), 1);
}

#[tokio::test]
async fn proxy_challenge_answered() {
    let mut proxy = ProxyServer::new("proxy.test", 3128);
    proxy.realm = Some(Realm::basic("pu", "pp"));

    let mock = MockTransport::new().dial(Dial::ok(vec![
        challenge(407, "proxy-authenticate", "Basic realm=\"proxy\""),
        ok("through"),
    ]));
    let client = mock.client(Config::default());

    let req = Request::get("http://a.test/").proxy(proxy).build().unwrap();
    let res = client.send(req).get().await.unwrap();

    assert_eq!(res.body(), "through");
    assert_eq!(mock.resolves(), vec!["proxy.test"]);
    assert_eq!(mock.connects(), vec![addr("127.0.0.1:3128")]);

    let heads = mock.heads();
    assert!(heads[0].headers.get(header::PROXY_AUTHORIZATION).is_none());
    assert!(heads[1].headers.contains_key(header::PROXY_AUTHORIZATION));
}
