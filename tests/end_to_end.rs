// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use remote_call::{
    Annotation, Argument, AssertionBuilder, AssertionContext, CancellationToken, ClientConfig,
    ContentResult, ContentResultConverter, ConverterEntry, DeclarativeContext, Error, FileContent,
    MethodMetadata, Parameter, ParameterAnnotation, RemoteClient, RequestEventHandler,
    ResponseEnvelope, SerializerOptions, XmlOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tide::{Request, Response};

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    id: u64,
    verbose: Option<String>,
    agent: Option<String>,
    cookie: Option<String>,
    hooked: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
struct Item {
    id: u32,
    name: String,
}

fn header(req: &Request<()>, name: &str) -> Option<String> {
    req.header(name).map(|v| v.as_str().to_string())
}

async fn get_user(req: Request<()>) -> tide::Result {
    let id: u64 = req.param("id")?.parse()?;
    let query: HashMap<String, String> = req.query()?;
    Ok(Response::builder(200)
        .body(json!({
            "id": id,
            "verbose": query.get("verbose"),
            "agent": header(&req, "User-Agent"),
            "cookie": header(&req, "Cookie"),
            "hooked": header(&req, "X-Hooked"),
        }))
        .build())
}

async fn echo(mut req: Request<()>) -> tide::Result {
    let content_type = header(&req, "Content-Type").unwrap_or_default();
    let body = req.body_string().await?;
    Ok(Response::builder(200)
        .body(body)
        .header("Content-Type", content_type.as_str())
        .build())
}

async fn wrapped(_req: Request<()>) -> tide::Result {
    Ok(Response::builder(200)
        .body(json!({"code": 0, "data": {"id": 3, "name": "wrapped"}}))
        .build())
}

async fn missing(_req: Request<()>) -> tide::Result {
    Ok(Response::builder(404).body("nope").build())
}

async fn slow(_req: Request<()>) -> tide::Result {
    async_std::task::sleep(Duration::from_millis(500)).await;
    Ok(Response::builder(200).body("late").build())
}

fn client() -> RemoteClient {
    let mut app = tide::new();
    app.at("/users/:id").get(get_user);
    app.at("/echo").post(echo);
    app.at("/wrapped").get(wrapped);
    app.at("/missing").get(missing);
    app.at("/slow").get(slow);

    let mut config = ClientConfig::default();
    config.base_url = Some("http://example.test/".into());
    config.routes.insert(
        "echo_xml".into(),
        SerializerOptions {
            xml: XmlOptions {
                root: Some("item".into()),
            },
            ..Default::default()
        },
    );
    RemoteClient::with_client(surf::Client::with_http_client(app), config).unwrap()
}

fn get_user_call(id: u64) -> DeclarativeContext {
    DeclarativeContext::new(
        MethodMetadata::new("get_user", "GET", "users/{id}")
            .annotate_contract(Annotation::header("User-Agent", "remote-call-test"))
            .annotate(Annotation::cookie("session", "abc")),
    )
    .with_parameter(Parameter::value("id", &id).unwrap())
    .with_parameter(Parameter::value("verbose", &true).unwrap())
}

#[async_std::test]
async fn invokes_declared_method() {
    let user: User = client()
        .invoke(get_user_call(7), &[], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        user,
        User {
            id: 7,
            verbose: Some("true".into()),
            agent: Some("remote-call-test".into()),
            cookie: Some("session=abc".into()),
            hooked: None,
        }
    );
}

#[test]
fn blocking_invoke_matches_async() {
    let user: User = client().invoke_blocking(get_user_call(8), &[]).unwrap();
    assert_eq!(user.id, 8);
}

#[async_std::test]
async fn xml_bodies_use_route_options() {
    let client = client();
    let call = || {
        DeclarativeContext::new(MethodMetadata::new("echo_xml", "POST", "echo")).with_parameter(
            Parameter::value(
                "item",
                &Item {
                    id: 5,
                    name: "widget".into(),
                },
            )
            .unwrap()
            .annotate(ParameterAnnotation::body_as("application/xml")),
        )
    };
    let cancel = CancellationToken::new();
    let text: String = client.invoke(call(), &[], &cancel).await.unwrap();
    assert!(text.starts_with("<item>"), "{}", text);

    let item: Item = client.invoke(call(), &[], &cancel).await.unwrap();
    assert_eq!(
        item,
        Item {
            id: 5,
            name: "widget".into()
        }
    );
}

#[async_std::test]
async fn unwraps_json_responses() {
    let call = DeclarativeContext::new(
        MethodMetadata::new("wrapped", "GET", "wrapped")
            .annotate(Annotation::JsonResponseWrapping(true)),
    );
    let item: Item = client()
        .invoke(call, &[], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(item.name, "wrapped");
}

#[async_std::test]
async fn ensure_success_reports_error_bodies() {
    let cancel = CancellationToken::new();
    let call = DeclarativeContext::new(MethodMetadata::new("missing", "GET", "missing"));
    let body: String = client().invoke(call, &[], &cancel).await.unwrap();
    assert_eq!(body, "nope");

    let call = DeclarativeContext::new(
        MethodMetadata::new("missing", "GET", "missing")
            .annotate(Annotation::EnsureSuccessStatusCode),
    );
    match client().invoke::<String>(call, &[], &cancel).await {
        Err(Error::UnsuccessfulStatus { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "nope");
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[async_std::test]
async fn enforces_timeouts() {
    let call = DeclarativeContext::new(
        MethodMetadata::new("slow", "GET", "slow")
            .annotate(Annotation::Timeout(Duration::from_millis(50))),
    );
    let err = client()
        .invoke::<String>(call, &[], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{}", err);
}

#[derive(Default)]
struct Recorder {
    requests: AtomicUsize,
    responses: AtomicUsize,
}

impl RequestEventHandler for Recorder {
    fn on_request(&self, _request: &surf::Request) -> remote_call::Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_response(&self, _response: &ResponseEnvelope) -> remote_call::Result<()> {
        self.responses.fetch_add(1, Ordering::SeqCst);
        Err(Error::AssertionFailed {
            message: "observers cannot fail the call".into(),
        })
    }
}

#[async_std::test]
async fn hooks_observe_without_interfering() {
    let recorder = Arc::new(Recorder::default());
    let hook: remote_call::PreSendHook = Arc::new(|req: &mut surf::Request| {
        req.insert_header("X-Hooked", "yes");
        Ok(())
    });
    let call = get_user_call(9)
        .with_parameter(Parameter::new("events", Argument::Events(recorder.clone())))
        .with_parameter(Parameter::new("hook", Argument::OnPreSend(hook)));
    let user: User = client()
        .invoke(call, &[], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(user.hooked.as_deref(), Some("yes"));
    assert_eq!(recorder.requests.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.responses.load(Ordering::SeqCst), 1);
}

struct Labelled(&'static str, Arc<Mutex<Vec<String>>>);

impl RequestEventHandler for Labelled {
    fn on_request(&self, _request: &surf::Request) -> remote_call::Result<()> {
        self.1.lock().unwrap().push(format!("{} request", self.0));
        Ok(())
    }

    fn on_response(&self, _response: &ResponseEnvelope) -> remote_call::Result<()> {
        self.1.lock().unwrap().push(format!("{} response", self.0));
        Ok(())
    }
}

#[async_std::test]
async fn every_handler_is_notified_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let call = get_user_call(10)
        .with_parameter(Parameter::new(
            "audit",
            Argument::Events(Arc::new(Labelled("audit", log.clone()))),
        ))
        .with_parameter(Parameter::new(
            "metrics",
            Argument::Events(Arc::new(Labelled("metrics", log.clone()))),
        ));
    let user: User = client()
        .invoke(call, &[], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(user.id, 10);
    assert_eq!(
        *log.lock().unwrap(),
        [
            "audit request",
            "metrics request",
            "audit response",
            "metrics response"
        ]
    );
}

#[async_std::test]
async fn content_results_are_reachable_through_the_client() {
    let call = DeclarativeContext::new(MethodMetadata::new("echo", "POST", "echo")).with_parameter(
        Parameter::value("note", &"hello")
            .unwrap()
            .annotate(ParameterAnnotation::body_as("text/plain")),
    );
    let custom = [ConverterEntry::new::<ContentResult, _>(ContentResultConverter)];
    let result: ContentResult = client()
        .invoke_registered(call, &custom, &CancellationToken::new())
        .await
        .unwrap();
    match result {
        ContentResult::Text {
            status,
            content,
            content_type,
        } => {
            assert_eq!(status, 200);
            assert_eq!(content, "hello");
            assert!(content_type.starts_with("text/plain"), "{}", content_type);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[async_std::test]
async fn uploads_multipart_forms() {
    let client = client();
    let mut call = DeclarativeContext::new(MethodMetadata::new("upload", "POST", "echo"))
        .with_parameter(
            Parameter::value("title", &"report")
                .unwrap()
                .annotate(ParameterAnnotation::multipart()),
        )
        .with_parameter(
            Parameter::new(
                "file",
                Argument::File(FileContent::new("data.csv", b"a,b\n1,2\n".to_vec())),
            )
            .annotate(ParameterAnnotation::multipart()),
        );
    let builder = client.prepare(&mut call).unwrap();
    let cancel = CancellationToken::new();
    let mut envelope = client.send(builder, &cancel).await.unwrap();
    assert!(envelope
        .content_type()
        .unwrap()
        .starts_with("multipart/form-data; boundary="));
    let body = envelope.text(&cancel).await.unwrap().to_string();
    assert!(body.contains("name=\"title\""));
    assert!(body.contains("filename=\"data.csv\""));
    assert!(body.contains("1,2"));
}

#[async_std::test]
async fn asserts_over_live_responses() {
    let client = client();
    let cancel = CancellationToken::new();
    let builder = client.prepare(&mut get_user_call(1)).unwrap();
    let envelope = client.send(builder, &cancel).await.unwrap();
    let mut context = AssertionContext::new(envelope);

    AssertionBuilder::new()
        .success_status()
        .header_contains("content-type", "JSON")
        .body_contains("REMOTE-CALL-TEST")
        .duration_under(Duration::from_secs(30))
        .unwrap()
        .build()
        .evaluate(&mut context, &cancel)
        .await
        .unwrap();

    let err = AssertionBuilder::new()
        .header_equals("Content-Type", "APPLICATION/JSON")
        .build()
        .evaluate(&mut context, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AssertionFailed { .. }));
}
