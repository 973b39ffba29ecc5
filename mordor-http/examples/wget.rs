//! Minimal HTTP GET over a plain TCP stream.
//!
//!     cargo run --example wget -- example.com /

use std::sync::Arc;

use mordor::Scheduler;
use mordor::stream::TcpStream;
use mordor_http::{ClientConnection, Request};

fn main() {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "example.com".to_string());
    let path = args.next().unwrap_or_else(|| "/".to_string());

    let sched = Scheduler::hijack("wget", 1);
    sched.schedule(move || {
        if let Err(err) = fetch(&host, &path) {
            eprintln!("wget: {err}");
        }
    });
    sched.stop();
}

fn fetch(host: &str, path: &str) -> Result<(), mordor_http::HttpError> {
    let stream = Arc::new(TcpStream::connect((host, 80))?);
    let conn = ClientConnection::new(stream);

    let req = conn.request(
        Request::get(path)
            .header("Host", host)
            .header("User-Agent", "mordor-wget/0.1"),
    )?;

    let response = req.response()?;
    eprintln!("{} {} {}", response.version, response.status, response.reason);
    for (name, value) in response.headers.iter() {
        eprintln!("{name}: {value}");
    }

    if req.has_response_body()? {
        let body = req.response_stream()?;
        let mut buf = [0u8; 8 * 1024];
        loop {
            let n = body.read_body(&mut buf)?;
            if n == 0 {
                break;
            }
            use std::io::Write;
            let _ = std::io::stdout().write_all(&buf[..n]);
        }
    }
    Ok(())
}
