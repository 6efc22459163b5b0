use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use httprelay::{create_server, ProxyOptions};
use tokio::net::TcpListener;

async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|req: Request<Incoming>| async move {
                    let path = req.uri().path().to_string();
                    Ok::<_, Infallible>(Response::new(Full::<Bytes>::from(path)))
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });
    addr
}

async fn start_proxy(options: ProxyOptions) -> SocketAddr {
    let server = create_server(options);
    let addr = server.listen(0, "127.0.0.1").await.unwrap();
    Box::leak(Box::new(server));
    addr
}

#[tokio::test]
async fn prepends_target_path() {
    let backend = start_echo_backend().await;
    let options = ProxyOptions::with_target(format!("http://{backend}/api"));
    let proxy = start_proxy(options).await;

    let body = reqwest::get(format!("http://{proxy}/v1/users"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "/api/v1/users");
}

#[tokio::test]
async fn ignore_path_drops_inbound_path() {
    let backend = start_echo_backend().await;
    let options = ProxyOptions {
        ignore_path: true,
        ..ProxyOptions::with_target(format!("http://{backend}/api"))
    };
    let proxy = start_proxy(options).await;

    let body = reqwest::get(format!("http://{proxy}/v1/users"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "/api");
}

#[tokio::test]
async fn delete_without_body_gets_content_length_zero() {
    let backend = start_echo_backend().await;
    let options = ProxyOptions::with_target(format!("http://{backend}/"));
    let proxy = start_proxy(options).await;

    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("http://{proxy}/x"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn missing_target_emits_error_and_returns_bad_gateway() {
    let options = ProxyOptions::default();
    let proxy = start_proxy(options).await;

    let resp = reqwest::get(format!("http://{proxy}/anything")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
}
