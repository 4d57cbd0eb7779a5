use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Minimal blocking HTTP/1.1 responder for integration tests. No mocking
/// crate exists anywhere in this workspace's dependency tree, so routes are
/// served by hand: one thread per connection, `Connection: close` on every
/// response so a keep-alive-capable client never waits on a second request.
pub struct TestServer {
    pub port: u16,
    pub hits: Arc<AtomicUsize>,
    routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>>,
    sequences: Arc<Mutex<HashMap<String, (Vec<(u16, Vec<u8>)>, usize)>>>,
}

impl TestServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let port = listener.local_addr().unwrap().port();
        let routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>> = Arc::new(Mutex::new(HashMap::new()));
        let sequences: Arc<Mutex<HashMap<String, (Vec<(u16, Vec<u8>)>, usize)>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let hits = Arc::new(AtomicUsize::new(0));

        let routes_for_thread = routes.clone();
        let sequences_for_thread = sequences.clone();
        let hits_for_thread = hits.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let routes = routes_for_thread.clone();
                let sequences = sequences_for_thread.clone();
                let hits = hits_for_thread.clone();
                std::thread::spawn(move || {
                    handle_connection(stream, &routes, &sequences, &hits);
                });
            }
        });

        Self {
            port,
            hits,
            routes,
            sequences,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn route(&self, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.into()));
    }

    /// Serves `responses[n]` on the `n`th request to `path` (0-indexed),
    /// repeating the last entry once exhausted. Lets a test drive a polling
    /// client (e.g. a live-recording poll loop) through a scripted sequence
    /// of playlist bodies without any wall-clock coordination.
    pub fn route_sequence(&self, path: &str, responses: Vec<(u16, Vec<u8>)>) {
        self.sequences
            .lock()
            .unwrap()
            .insert(path.to_string(), (responses, 0));
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn handle_connection(
    stream: TcpStream,
    routes: &Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>>,
    sequences: &Arc<Mutex<HashMap<String, (Vec<(u16, Vec<u8>)>, usize)>>>,
    hits: &Arc<AtomicUsize>,
) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    // Drain remaining header lines; bodyless GET requests are all this
    // server needs to support.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" || line.is_empty() {
            break;
        }
    }

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    hits.fetch_add(1, Ordering::SeqCst);

    let mut stream = stream;
    let sequenced = {
        let mut sequences = sequences.lock().unwrap();
        sequences.get_mut(&path).map(|(responses, next)| {
            let i = (*next).min(responses.len() - 1);
            *next += 1;
            responses[i].clone()
        })
    };
    let response = match sequenced {
        Some((status, body)) => build_response(status, &body),
        None => match routes.lock().unwrap().get(&path) {
            Some((status, body)) => build_response(*status, body),
            None => build_response(404, b"not found"),
        },
    };
    let _ = stream.write_all(&response);
}

fn build_response(status: u16, body: &[u8]) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}
