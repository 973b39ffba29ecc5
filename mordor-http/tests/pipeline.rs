//! End-to-end pipelining scenarios over scripted in-memory streams.
//!
//! Each test runs its client code inside a fiber on a single-worker
//! scheduler; the scripted stream plays the server side. The result is
//! shipped out over a channel so a panic inside the fiber fails the
//! test instead of vanishing into the dispatch loop.

use std::sync::Arc;

use mordor::stream::MemoryStream;
use mordor::{ErrorKind, Scheduler};
use mordor_http::{ClientConnection, ClientRequest, Headers, HttpError, Request, ResponseBody};

fn run_in_fiber<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let sched = Scheduler::hijack("pipeline-test", 1);
    let (tx, rx) = crossbeam_channel::bounded(1);
    sched.schedule(move || {
        let _ = tx.send(f());
    });
    sched.stop();
    rx.try_recv().expect("fiber did not run to completion")
}

fn scripted(input: &'static str) -> Arc<MemoryStream> {
    Arc::new(MemoryStream::with_input(input.as_bytes()))
}

fn read_all(body: &ResponseBody) -> Result<Vec<u8>, HttpError> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = body.read_body(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

// ── S1: simple GET ──────────────────────────────────────────────────────

#[test]
fn simple_get() {
    let stream = scripted("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
    let inner = stream.clone();
    run_in_fiber(move || {
        let conn = ClientConnection::new(inner);
        let req = conn.request(Request::get("/")).unwrap();
        let response = req.response().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert!(req.has_response_body().unwrap());

        let body = req.response_stream().unwrap();
        assert_eq!(read_all(&body).unwrap(), b"hello");
        assert!(req.request_complete());
        assert!(req.response_complete());
    });
    assert_eq!(&stream.output()[..], b"GET / HTTP/1.1\r\n\r\n");
}

// ── S2: pipelining preserves order ──────────────────────────────────────

#[test]
fn pipelined_responses_in_request_order() {
    let stream = scripted(
        "HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA\
         HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nBB\
         HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nCCC",
    );
    let inner = stream.clone();
    run_in_fiber(move || {
        let conn = ClientConnection::new(inner);
        let reqs: Vec<Arc<ClientRequest>> = (1..=3)
            .map(|i| conn.request(Request::get(format!("/{i}"))).unwrap())
            .collect();

        let expected: [&[u8]; 3] = [b"A", b"BB", b"CCC"];
        for (req, want) in reqs.iter().zip(expected) {
            let body = req.response_stream().unwrap();
            assert_eq!(read_all(&body).unwrap(), want);
            assert!(req.response_complete());
        }
    });
    assert_eq!(
        &stream.output()[..],
        b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\n" as &[u8]
    );
}

// ── S3: Connection: close fails still-pending requests ──────────────────

#[test]
fn connection_close_fails_pending_requests() {
    let stream = scripted("HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok");
    let inner = stream.clone();
    run_in_fiber(move || {
        let conn = ClientConnection::new(inner);
        // Request 1 holds the write slot open with an unfinished body,
        // so 2 and 3 are still pending when its response arrives.
        let r1 = conn
            .request(Request::post("/1").header("Content-Length", "5"))
            .unwrap();
        let r2 = conn.request(Request::get("/2")).unwrap();
        let r3 = conn.request(Request::get("/3")).unwrap();

        let body = r1.request_stream().unwrap();
        body.write_body(b"hello").unwrap();
        assert!(r1.request_complete());

        let response = r1.response().unwrap();
        assert_eq!(response.status, 200);
        r1.finish().unwrap();

        assert!(matches!(r2.response(), Err(HttpError::ConnectionClosing)));
        assert!(matches!(r3.response(), Err(HttpError::ConnectionClosing)));
        assert!(matches!(
            conn.request(Request::get("/4")),
            Err(HttpError::ConnectionClosing)
        ));
    });
    // Requests 2 and 3 never touched the wire.
    assert_eq!(
        &stream.output()[..],
        b"POST /1 HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello" as &[u8]
    );
}

// ── S4: abort mid-body ──────────────────────────────────────────────────

#[test]
fn abort_mid_body_fails_everything() {
    let stream = scripted(
        "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789\
         HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nX",
    );
    let inner = stream.clone();
    run_in_fiber(move || {
        let conn = ClientConnection::new(inner.clone());
        let r1 = conn.request(Request::get("/1")).unwrap();
        let r2 = conn.request(Request::get("/2")).unwrap();

        let body = r1.response_stream().unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(body.read_body(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"012");

        r1.cancel(true);

        assert!(matches!(body.read_body(&mut buf), Err(HttpError::Aborted)));
        assert!(matches!(r2.response(), Err(HttpError::Aborted)));
        assert!(inner.read_closed());
        assert!(inner.write_closed());
    });
}

// ── S5: prior-request failure ───────────────────────────────────────────

#[test]
fn request_side_failure_latches() {
    let stream = Arc::new(MemoryStream::new());
    let head = "POST /1 HTTP/1.1\r\nContent-Length: 10\r\n\r\n";
    stream.fail_writes_after(head.len(), ErrorKind::Reset);
    let inner = stream.clone();
    run_in_fiber(move || {
        let conn = ClientConnection::new(inner);
        let r1 = conn
            .request(Request::post("/1").header("Content-Length", "10"))
            .unwrap();
        let r2 = conn.request(Request::get("/2")).unwrap();

        let body = r1.request_stream().unwrap();
        assert!(matches!(
            body.write_body(b"12345"),
            Err(HttpError::Stream(mordor::Error::Reset))
        ));
        assert!(matches!(r2.response(), Err(HttpError::PriorRequestFailed)));
        assert!(matches!(
            conn.request(Request::get("/3")),
            Err(HttpError::ConnectionClosing)
        ));
    });
}

// ── Boundaries ──────────────────────────────────────────────────────────

#[test]
fn exact_content_length_completes_without_close() {
    let stream = scripted("HTTP/1.1 204 No Content\r\n\r\n");
    let inner = stream.clone();
    run_in_fiber(move || {
        let conn = ClientConnection::new(inner);
        let req = conn
            .request(Request::post("/upload").header("Content-Length", "3"))
            .unwrap();
        let body = req.request_stream().unwrap();
        body.write_body(b"ab").unwrap();
        assert!(!req.request_complete());
        body.write_body(b"c").unwrap();
        // The final declared byte ends the request side on its own.
        assert!(req.request_complete());

        let response = req.response().unwrap();
        assert_eq!(response.status, 204);
        assert!(!req.has_response_body().unwrap());
        assert!(req.response_complete());
    });
    assert_eq!(
        &stream.output()[..],
        b"POST /upload HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc" as &[u8]
    );
}

#[test]
fn chunked_response_without_trailer() {
    let stream = scripted(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
    );
    run_in_fiber(move || {
        let conn = ClientConnection::new(stream);
        let req = conn.request(Request::get("/")).unwrap();
        let body = req.response_stream().unwrap();
        assert_eq!(read_all(&body).unwrap(), b"abcde");
        assert!(req.response_complete());
        assert!(req.response_trailer().is_none());
    });
}

#[test]
fn chunked_response_with_trailer() {
    let stream =
        scripted("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\nX-Sum: 9\r\n\r\n");
    run_in_fiber(move || {
        let conn = ClientConnection::new(stream);
        let req = conn.request(Request::get("/")).unwrap();
        let body = req.response_stream().unwrap();
        assert_eq!(read_all(&body).unwrap(), b"hi");
        let trailer = req.response_trailer().expect("trailer");
        assert_eq!(trailer.get("X-Sum"), Some("9"));
    });
}

#[test]
fn cancel_before_promotion_leaves_stream_untouched() {
    let stream = scripted("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    let inner = stream.clone();
    run_in_fiber(move || {
        let conn = ClientConnection::new(inner);
        let r1 = conn
            .request(Request::post("/1").header("Content-Length", "2"))
            .unwrap();
        let r2 = conn.request(Request::get("/2")).unwrap();

        r2.cancel(false);
        assert!(matches!(r2.response(), Err(HttpError::Cancelled)));

        // The rest of the pipeline is unaffected.
        let body = r1.request_stream().unwrap();
        body.write_body(b"ok").unwrap();
        let response = r1.response().unwrap();
        assert_eq!(response.status, 200);
        assert!(r1.response_complete());
    });
    assert_eq!(
        &stream.output()[..],
        b"POST /1 HTTP/1.1\r\nContent-Length: 2\r\n\r\nok" as &[u8]
    );
}

#[test]
fn cancelled_sent_request_response_is_drained() {
    let stream = scripted(
        "HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA\
         HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nBB",
    );
    run_in_fiber(move || {
        let conn = ClientConnection::new(stream);
        let r1 = conn.request(Request::get("/1")).unwrap();
        let r2 = conn.request(Request::get("/2")).unwrap();

        // Fully sent, response never read: skipped with Cancelled.
        r1.cancel(false);
        assert!(matches!(r1.response(), Err(HttpError::Cancelled)));

        // The next reader transparently drains response 1 first.
        let body = r2.response_stream().unwrap();
        assert_eq!(read_all(&body).unwrap(), b"BB");
    });
}

#[test]
fn expect_continue_delays_body() {
    let stream = scripted(
        "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    );
    let inner = stream.clone();
    run_in_fiber(move || {
        let conn = ClientConnection::new(inner);
        let req = conn
            .request(
                Request::post("/upload")
                    .header("Content-Length", "5")
                    .header("Expect", "100-continue"),
            )
            .unwrap();
        let body = req.request_stream().unwrap();
        // The first write reads the interim response before sending.
        body.write_body(b"hello").unwrap();
        let response = req.response().unwrap();
        assert_eq!(response.status, 200);
        req.finish().unwrap();
    });
    let output = stream.output();
    let text = std::str::from_utf8(&output).unwrap();
    assert!(text.ends_with("\r\n\r\nhello"));
}

#[test]
fn head_response_has_no_body() {
    let stream = scripted("HTTP/1.1 200 OK\r\nContent-Length: 512\r\n\r\n");
    run_in_fiber(move || {
        let conn = ClientConnection::new(stream);
        let req = conn.request(Request::head("/big")).unwrap();
        let response = req.response().unwrap();
        assert_eq!(response.status, 200);
        // Content-Length describes the would-be body; none follows.
        assert!(!req.has_response_body().unwrap());
        assert!(req.response_complete());
    });
}

#[test]
fn until_close_body_retires_connection() {
    let stream = scripted("HTTP/1.1 200 OK\r\n\r\neverything until close");
    run_in_fiber(move || {
        let conn = ClientConnection::new(stream);
        let req = conn.request(Request::get("/")).unwrap();
        let body = req.response_stream().unwrap();
        assert_eq!(read_all(&body).unwrap(), b"everything until close");
        assert!(req.response_complete());
        assert!(matches!(
            conn.request(Request::get("/again")),
            Err(HttpError::ConnectionClosing)
        ));
    });
}

#[test]
fn chunked_request_body_with_trailer() {
    let stream = scripted("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    let inner = stream.clone();
    run_in_fiber(move || {
        let conn = ClientConnection::new(inner);
        let req = conn
            .request(Request::post("/chunks").header("Transfer-Encoding", "chunked"))
            .unwrap();
        let body = req.request_stream().unwrap();
        body.write_body(b"hello").unwrap();
        body.write_body(b" world").unwrap();
        let mut trailer = Headers::new();
        trailer.add("X-Len", "11");
        req.set_request_trailer(trailer);
        body.close_body().unwrap();
        assert!(req.request_complete());
        req.finish().unwrap();
    });
    assert_eq!(
        &stream.output()[..],
        b"POST /chunks HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
          5\r\nhello\r\n6\r\n world\r\n0\r\nX-Len: 11\r\n\r\n" as &[u8]
    );
}

// ── Multi-fiber pipelining ──────────────────────────────────────────────

#[test]
fn concurrent_fibers_pipeline_in_submission_order() {
    let stream = scripted(
        "HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA\
         HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nBB\
         HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nCCC",
    );
    let inner = stream.clone();

    let sched = Scheduler::hijack("pipeline-multi", 1);
    let (tx, rx) = crossbeam_channel::unbounded();
    {
        let sched2 = sched.clone();
        sched.schedule(move || {
            let conn = ClientConnection::new(inner);
            // Submit in order from the coordinating fiber, then let each
            // worker fiber push its own request through.
            for i in 1..=3 {
                let req = conn
                    .request(Request::post(format!("/{i}")).header("Content-Length", "1"))
                    .unwrap();
                let tx = tx.clone();
                sched2.schedule(move || {
                    let body = req.request_stream().unwrap();
                    body.write_body(b"x").unwrap();
                    let reply = req.response_stream().unwrap();
                    let data = read_all(&reply).unwrap();
                    tx.send((i, data)).unwrap();
                });
            }
        });
    }
    sched.stop();

    let mut results: Vec<(i32, Vec<u8>)> = rx.try_iter().collect();
    results.sort();
    assert_eq!(
        results,
        vec![
            (1, b"A".to_vec()),
            (2, b"BB".to_vec()),
            (3, b"CCC".to_vec()),
        ]
    );
    let output = stream.output();
    let text = std::str::from_utf8(&output).unwrap();
    let p1 = text.find("POST /1").unwrap();
    let p2 = text.find("POST /2").unwrap();
    let p3 = text.find("POST /3").unwrap();
    assert!(p1 < p2 && p2 < p3);
}
