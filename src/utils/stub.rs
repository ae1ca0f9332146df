//! Canned-response HTTP upstream for tests; good enough for a blocking
//! client that sends one request per connection.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) fn stub_upstream(status: u16, body: &'static str) -> (String, Arc<AtomicUsize>) {
    stub_upstream_with_delay(status, body, std::time::Duration::ZERO)
}

pub(crate) fn stub_upstream_with_delay(
    status: u16,
    body: &'static str,
    delay: std::time::Duration,
) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let hits_counter = hits.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            hits_counter.fetch_add(1, Ordering::SeqCst);

            // One thread per connection so parallel fetches in tests do not
            // serialize behind the artificial delay.
            std::thread::spawn(move || {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }

                let mut buffer = [0u8; 4096];
                let _ = stream.read(&mut buffer);
                let reason = match status {
                    200 => "OK",
                    403 => "Forbidden",
                    404 => "Not Found",
                    500 => "Internal Server Error",
                    _ => "Unknown",
                };
                let _ = write!(
                    stream,
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
            });
        }
    });

    (format!("http://{addr}"), hits)
}
