#![deny(rust_2018_idioms)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use shoal::server::{
    upgrade, ConnectionProcessor, HttpServer, ServerDelegate, ServerOptions,
    ServerRequest, ServerResponse, SocketHandler,
};
use shoal::{BufferList, StatusCode};

/// A running server on an ephemeral port, shut down on drop.
struct Serve {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Serve {
    fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for Serve {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve_with(options: ServerOptions, delegate: Arc<dyn ServerDelegate>) -> Serve {
    let _ = pretty_env_logger::try_init();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        rt.block_on(async move {
            let mut server = HttpServer::new(delegate);
            server.set_options(options);
            server.listen(0).await.expect("listen");
            addr_tx
                .send(server.local_addr().expect("local addr"))
                .expect("send addr");
            let _ = tokio::task::spawn_blocking(move || shutdown_rx.recv()).await;
            server.stop();
        });
    });
    let addr = addr_rx.recv().expect("server addr");
    Serve {
        addr,
        shutdown_tx: Some(shutdown_tx),
        thread: Some(thread),
    }
}

fn serve(delegate: Arc<dyn ServerDelegate>) -> Serve {
    serve_with(ServerOptions::new(), delegate)
}

fn connect(addr: &SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

fn read_until_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read response");
    response
}

/// Reads until the headers and `body_len` body bytes have arrived,
/// without waiting for the connection to close.
fn read_response(stream: &mut TcpStream, body_len: usize) -> String {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(head_end) = find_blank_line(&raw) {
            if raw.len() >= head_end + body_len {
                break;
            }
        }
        let n = stream.read(&mut chunk).expect("read");
        assert!(n > 0, "connection closed mid-response");
        raw.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(raw).expect("utf8 response")
}

fn find_blank_line(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[test]
fn get_round_trip_has_exact_framing() {
    let server = serve(Arc::new(
        |req: &mut ServerRequest, res: &mut ServerResponse| {
            assert_eq!(req.method().as_str(), "GET");
            assert_eq!(req.target(), "/hello?x=1");
            res.set_header("Content-Type", "text/plain");
            res.write_str("hi").unwrap();
        },
    ));

    let mut stream = connect(&server.addr());
    stream
        .write_all(b"GET /hello?x=1 HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let response = String::from_utf8(read_until_eof(&mut stream)).unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\nDate: "), "{}", response);
    let date_end = response.find("GMT\r\n").expect("date header") + 5;
    assert_eq!(
        &response[date_end..],
        "Content-Type: text/plain\r\nConnection: Close\r\n\r\nhi"
    );
}

#[test]
fn request_data_reaches_delegate() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_delegate = seen.clone();
    let server = serve(Arc::new(
        move |req: &mut ServerRequest, res: &mut ServerResponse| {
            let body = req.read_string().unwrap();
            seen_in_delegate.lock().unwrap().push(format!(
                "{} {} {} {:?} {}",
                req.method(),
                req.url(),
                req.headers().get_first("x-token").unwrap_or("-"),
                req.query_parameters().get("q").cloned(),
                body,
            ));
            res.write_str("done").unwrap();
        },
    ));

    let mut stream = connect(&server.addr());
    stream
        .write_all(
            b"POST /submit?q=7 HTTP/1.1\r\nHost: example.org\r\n\
              X-Token: abc\r\nContent-Length: 5\r\n\r\nhello",
        )
        .unwrap();
    let _ = read_until_eof(&mut stream);

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen[..],
        ["POST http://example.org/submit?q=7 abc Some(\"7\") hello".to_owned()][..]
    );
}

#[test]
fn keep_alive_counts_down_then_closes() {
    let mut options = ServerOptions::new();
    options.keep_alive_max_requests = 2;
    let server = serve_with(
        options,
        Arc::new(|_req: &mut ServerRequest, res: &mut ServerResponse| {
            res.set_header("Content-Length", "2");
            res.write_str("ok").unwrap();
        }),
    );

    let mut stream = connect(&server.addr());
    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let first = read_response(&mut stream, 2);
    assert!(first.contains("\r\nConnection: Keep-Alive\r\n"), "{}", first);
    assert!(
        first.contains("\r\nKeep-Alive: timeout=60, max=1\r\n"),
        "{}",
        first
    );

    // the connection survives for a second request
    stream
        .write_all(b"GET /b HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let second = String::from_utf8(read_until_eof(&mut stream)).unwrap();
    assert!(second.contains("\r\nConnection: Close\r\n"), "{}", second);
    assert!(!second.contains("Keep-Alive:"), "{}", second);
}

#[test]
fn keep_alive_serves_requests_in_order() {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_in_delegate = counter.clone();
    let mut options = ServerOptions::new();
    options.keep_alive_max_requests = 10;
    let server = serve_with(
        options,
        Arc::new(move |_req: &mut ServerRequest, res: &mut ServerResponse| {
            let n = counter_in_delegate.fetch_add(1, Ordering::SeqCst);
            let body = format!("r{}", n);
            res.set_header("Content-Length", body.len().to_string());
            res.write_str(&body).unwrap();
        }),
    );

    let mut stream = connect(&server.addr());
    for expected in 0..3 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let response = read_response(&mut stream, 2);
        assert!(
            response.ends_with(&format!("r{}", expected)),
            "round {}: {}",
            expected,
            response
        );
    }
}

#[test]
fn oversize_request_rejected_with_413() {
    let mut options = ServerOptions::new();
    options.request_size_limit = Some(1000);
    let server = serve_with(
        options,
        Arc::new(|_req: &mut ServerRequest, _res: &mut ServerResponse| {
            panic!("delegate must not run for an oversize request");
        }),
    );

    let mut stream = connect(&server.addr());
    let body = vec![b'x'; 2000];
    stream
        .write_all(
            format!(
                "POST /big HTTP/1.1\r\nHost: h\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        )
        .unwrap();
    let _ = stream.write_all(&body);
    let response = String::from_utf8(read_until_eof(&mut stream)).unwrap();
    assert!(
        response.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"),
        "{}",
        response
    );
}

#[test]
fn connection_limit_rejected_with_503() {
    let mut options = ServerOptions::new();
    options.connection_limit = Some(1);
    let server = serve_with(
        options,
        Arc::new(|_req: &mut ServerRequest, res: &mut ServerResponse| {
            res.write_str("first").unwrap();
        }),
    );

    // the first connection occupies the single slot
    let _held = connect(&server.addr());
    thread::sleep(Duration::from_millis(100));

    let mut second = connect(&server.addr());
    let response = String::from_utf8(read_until_eof(&mut second)).unwrap();
    assert!(
        response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
        "{}",
        response
    );
}

#[test]
fn malformed_request_gets_400() {
    let server = serve(Arc::new(
        |_req: &mut ServerRequest, _res: &mut ServerResponse| {
            panic!("delegate must not run for garbage");
        },
    ));

    let mut stream = connect(&server.addr());
    stream.write_all(b"\0garbage that is not http\r\n\r\n").unwrap();
    let response = String::from_utf8(read_until_eof(&mut stream)).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);
}

// ===== upgrade support =====

/// Post-upgrade processor that echoes every byte back.
struct EchoProcessor {
    handler: Weak<SocketHandler>,
}

impl ConnectionProcessor for EchoProcessor {
    fn process(&mut self, buffer: &mut BufferList) -> bool {
        let mut data = Vec::new();
        buffer.fill_vec(&mut data);
        if let Some(handler) = self.handler.upgrade() {
            handler.write(&data);
        }
        true
    }
    fn socket_closed(&mut self) {}
    fn response_ended(&mut self, _keep_alive: bool) {}
    fn in_progress(&self) -> bool {
        true
    }
    fn keep_alive_until(&self) -> Option<Instant> {
        None
    }
    fn mark_inactive(&mut self) {}
    fn set_handler(&mut self, handler: Weak<SocketHandler>) {
        self.handler = handler;
    }
}

struct EchoUpgrader;

impl upgrade::ConnectionUpgradeFactory for EchoUpgrader {
    fn name(&self) -> &str {
        "chitchat"
    }
    fn upgrade(
        &self,
        _handler: &Arc<SocketHandler>,
        _request: &mut ServerRequest,
        _response: &mut ServerResponse,
    ) -> (Option<Box<dyn ConnectionProcessor>>, Option<Vec<u8>>) {
        (
            Some(Box::new(EchoProcessor {
                handler: Weak::new(),
            })),
            None,
        )
    }
}

#[test]
fn upgrade_swaps_processor_and_echoes() {
    upgrade::register(Arc::new(EchoUpgrader));
    let server = serve(Arc::new(
        |_req: &mut ServerRequest, _res: &mut ServerResponse| {
            panic!("upgrade requests must not reach the delegate");
        },
    ));

    let mut stream = connect(&server.addr());
    // early bytes ride in the same packet as the upgrade request and
    // must reach the new processor, not the HTTP parser
    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: h\r\n\
              Upgrade: chitchat\r\nConnection: Upgrade\r\n\r\nping-1",
        )
        .unwrap();

    let response = read_response(&mut stream, 6);
    assert!(
        response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "{}",
        response
    );
    assert!(response.contains("\r\nUpgrade: chitchat\r\n"), "{}", response);
    assert!(response.contains("\r\nConnection: Upgrade\r\n"), "{}", response);
    assert!(response.ends_with("ping-1"), "{}", response);

    // later bytes flow through the echo processor as well
    stream.write_all(b"ping-2").unwrap();
    let mut echoed = [0u8; 6];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"ping-2");
}

#[test]
fn upgrade_with_unknown_protocol_gets_404() {
    let server = serve(Arc::new(
        |_req: &mut ServerRequest, _res: &mut ServerResponse| {
            panic!("upgrade requests must not reach the delegate");
        },
    ));

    let mut stream = connect(&server.addr());
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: h\r\n\
              Upgrade: nonsense\r\nConnection: Upgrade\r\n\r\n",
        )
        .unwrap();
    let response = String::from_utf8(read_until_eof(&mut stream)).unwrap();
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", response);
    assert!(response.contains("not registered") || response.contains("nonsense"), "{}", response);
}

#[test]
fn custom_limit_response_generator_is_used() {
    let mut options = ServerOptions::new();
    options.request_size_limit = Some(100);
    options.set_request_size_response_generator(|limit, _client| {
        (
            StatusCode::RequestEntityTooLarge,
            format!("limit is {} bytes", limit),
        )
    });
    let server = serve_with(
        options,
        Arc::new(|_req: &mut ServerRequest, _res: &mut ServerResponse| {}),
    );

    let mut stream = connect(&server.addr());
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 500\r\n\r\n")
        .unwrap();
    // the server may close the moment the limit trips
    let _ = stream.write_all(&[b'y'; 500]);
    let response = String::from_utf8(read_until_eof(&mut stream)).unwrap();
    assert!(response.starts_with("HTTP/1.1 413 "), "{}", response);
    assert!(response.ends_with("limit is 100 bytes"), "{}", response);
}
