//! End-to-end tests: a real server, a real client and a real endpoint talking
//! over loopback TCP.

use std::{path::PathBuf, rc::Rc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::LocalSet,
    time::timeout,
};

use revgate::{
    client::TttClient,
    config::{ClientOption, HttpOption, Protocol, ServerOption, TunnelingOption},
    runtime::Runtime,
    server::TttServer,
};

fn run_local<F: std::future::Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    LocalSet::new().block_on(&runtime, future)
}

fn spill_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("revgate-e2e-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Bind-and-release: the port is free at the time of the call, which is as
/// good as it gets for tests that need fixed listen ports.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn tunneling_option(forward_port: u16, protocol: Protocol, endpoint_port: u16) -> TunnelingOption {
    TunnelingOption {
        forward_port,
        protocol,
        destination_address: "127.0.0.1".into(),
        destination_port: Some(endpoint_port),
        destination_tls: false,
        tls: false,
        cert_pem: None,
        key_pem: None,
        buffer_limit_on_server: -1,
        buffer_limit_on_client: -1,
        allowed_client_names: Vec::new(),
        inactive_on_timeout_secs: 0,
        http: HttpOption::default(),
    }
}

fn server_option(ctrl_port: u16, tunnels: Vec<TunnelingOption>) -> Rc<ServerOption> {
    Rc::new(ServerOption {
        ctrl_port,
        key: "e2e-secret".into(),
        tls: false,
        cert_pem: None,
        key_pem: None,
        global_memory_limit_mib: 128,
        tunnels,
    })
}

fn client_option(ctrl_port: u16) -> Rc<ClientOption> {
    Rc::new(ClientOption {
        host: "127.0.0.1".into(),
        port: ctrl_port,
        tls: false,
        name: "e2e-client".into(),
        key: "e2e-secret".into(),
        global_memory_limit_mib: 128,
    })
}

async fn wait_for_client(server: &TttServer) {
    for _ in 0..200 {
        if server.client_count() == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("tunnel client never registered");
}

#[test]
fn tcp_relay_round_trip() {
    run_local(async {
        // Echo endpoint.
        let endpoint = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint_port = endpoint.local_addr().unwrap().port();
        tokio::task::spawn_local(async move {
            loop {
                let (mut stream, _) = match endpoint.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::task::spawn_local(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        let ctrl_port = free_port();
        let forward_port = free_port();

        let server = TttServer::new(
            Runtime::new(spill_dir("tcp-server")),
            server_option(ctrl_port, vec![tunneling_option(forward_port, Protocol::Tcp, endpoint_port)]),
        );
        server.start().await.unwrap();

        let client = TttClient::new(Runtime::new(spill_dir("tcp-client")), client_option(ctrl_port));
        client.start();
        wait_for_client(&server).await;

        let mut public = TcpStream::connect(("127.0.0.1", forward_port)).await.unwrap();
        public.write_all(b"ping over the tunnel").await.unwrap();

        let mut echoed = [0u8; 20];
        timeout(Duration::from_secs(10), public.read_exact(&mut echoed))
            .await
            .expect("relay timed out")
            .unwrap();
        assert_eq!(&echoed, b"ping over the tunnel");

        // The session stays usable for a second round trip.
        public.write_all(b"again").await.unwrap();
        let mut echoed = [0u8; 5];
        timeout(Duration::from_secs(10), public.read_exact(&mut echoed))
            .await
            .expect("second relay timed out")
            .unwrap();
        assert_eq!(&echoed, b"again");

        drop(public);
        client.stop();
        server.stop();
    });
}

#[test]
fn http_headers_are_rewritten_both_ways() {
    run_local(async {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        let destination = format!("127.0.0.1:{backend_port}");

        // Backend: check the rewritten Host, answer with a redirect that
        // points at itself.
        let expected_host = destination.clone();
        let backend_task = tokio::task::spawn_local(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "backend saw EOF before the full request");
                request.extend_from_slice(&buf[..n]);
            }

            let request = String::from_utf8(request).unwrap();
            assert!(
                request.contains(&format!("Host: {expected_host}")),
                "host was not rewritten: {request}"
            );

            let response = format!(
                "HTTP/1.1 302 Found\r\nLocation: http://{expected_host}/login\r\nContent-Length: 0\r\n\r\n"
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            // Hold the connection open until the test is done reading.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let ctrl_port = free_port();
        let forward_port = free_port();

        let server = TttServer::new(
            Runtime::new(spill_dir("http-server")),
            server_option(ctrl_port, vec![tunneling_option(forward_port, Protocol::Http, backend_port)]),
        );
        server.start().await.unwrap();

        let client = TttClient::new(Runtime::new(spill_dir("http-client")), client_option(ctrl_port));
        client.start();
        wait_for_client(&server).await;

        let mut public = TcpStream::connect(("127.0.0.1", forward_port)).await.unwrap();
        public
            .write_all(b"GET /login HTTP/1.1\r\nHost: public.example\r\n\r\n")
            .await
            .unwrap();

        let response = timeout(Duration::from_secs(10), async {
            let mut response = Vec::new();
            let mut buf = [0u8; 4096];
            while !response.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = public.read(&mut buf).await.unwrap();
                assert!(n > 0, "public side saw EOF before the full response");
                response.extend_from_slice(&buf[..n]);
            }
            String::from_utf8(response).unwrap()
        })
        .await
        .expect("response timed out");

        assert!(response.starts_with("HTTP/1.1 302 Found"), "unexpected response: {response}");
        assert!(
            response.contains("Location: http://public.example/login"),
            "location was not rewritten back: {response}"
        );
        assert!(!response.contains(&destination), "destination leaked through: {response}");

        backend_task.abort();
        client.stop();
        server.stop();
    });
}
