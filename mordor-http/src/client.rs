//! Pipelined HTTP/1.x client.
//!
//! A [`ClientConnection`] serializes requests and responses over one
//! transport. Requests enter two queues at submission: the write queue
//! (front = the one request allowed to write) and the response queue
//! (front = the one request allowed to read). Wire order equals
//! submission order on both sides — strict HTTP/1.1 pipelining.
//!
//! One mutex guards the queues and admission flags. It is never held
//! across stream I/O: bookkeeping decides *who* may move, then the move
//! itself happens lock-free with respect to the connection state, with
//! per-request [`FiberEvent`]s to park and wake the fibers involved.
//!
//! Failure on either side latches once and fans out: the request (or
//! response) that hit the failure gets the real error, every later
//! request on that side gets [`HttpError::PriorRequestFailed`], and the
//! connection stops admitting new requests.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use mordor::log::{Log, Logger};
use mordor::scheduler::{FiberEvent, Scheduler};
use mordor::stream::{CloseHow, Stream};
use mordor::{log_debug, log_error, log_trace, log_verbose};

use crate::body::{ChunkedWriter, FramedReader, Framing, IdentityWriter};
use crate::conn::Connection;
use crate::error::{FailureKind, HttpError};
use crate::headers::Headers;
use crate::request::Request;
use crate::response::Response;

static LOG: LazyLock<Arc<Logger>> = LazyLock::new(|| Log::lookup("mordor:http:client"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadWrite {
    NotWritten,
    InProgress,
    Written,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    Queued,
    Writing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponsePhase {
    Pending,
    Headers,
    Body,
    Done,
}

struct ReqState {
    phase: WritePhase,
    head: HeadWrite,
    has_body: bool,
    body_done: bool,
    request_trailer: Headers,
    response_phase: ResponsePhase,
    response: Option<Response>,
    response_framing: Option<Framing>,
    response_trailer: Option<Headers>,
    body_stream_taken: bool,
    expecting_continue: bool,
    continue_received: bool,
    cancelled: bool,
    aborted: bool,
    /// Latched outcome delivered to every later operation on this
    /// request.
    error: Option<FailureKind>,
}

struct Inner {
    /// Requests that have not finished writing; front may write.
    write_queue: VecDeque<Arc<ClientRequest>>,
    /// Requests whose response is not yet consumed; front may read.
    response_queue: VecDeque<Arc<ClientRequest>>,
    allow_new_requests: bool,
    request_failed: Option<FailureKind>,
    response_failed: Option<FailureKind>,
    /// The front of the response queue is actively parsing a head or
    /// consuming a body.
    response_reading: bool,
}

/// A pipelining HTTP/1.x client over one stream.
pub struct ClientConnection {
    conn: Arc<Connection>,
    own_stream: bool,
    inner: Mutex<Inner>,
}

impl ClientConnection {
    /// Take ownership of the stream; it is closed when the connection is
    /// dropped.
    pub fn new(stream: Arc<dyn Stream>) -> Arc<ClientConnection> {
        Self::with_ownership(stream, true)
    }

    /// Borrow the stream; the caller remains responsible for closing it.
    pub fn borrowed(stream: Arc<dyn Stream>) -> Arc<ClientConnection> {
        Self::with_ownership(stream, false)
    }

    fn with_ownership(stream: Arc<dyn Stream>, own_stream: bool) -> Arc<ClientConnection> {
        Arc::new(ClientConnection {
            conn: Arc::new(Connection::new(stream)),
            own_stream,
            inner: Mutex::new(Inner {
                write_queue: VecDeque::new(),
                response_queue: VecDeque::new(),
                allow_new_requests: true,
                request_failed: None,
                response_failed: None,
                response_reading: false,
            }),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn allows_new_requests(&self) -> bool {
        lock(&self.inner).allow_new_requests
    }

    /// Submit a request. Returns immediately with the in-flight handle;
    /// if the write slot is free the head is written by the calling
    /// fiber before returning, otherwise writing is deferred until
    /// promotion.
    pub fn request(self: &Arc<Self>, request: Request) -> Result<Arc<ClientRequest>, HttpError> {
        let has_body = request.has_body();
        let expecting_continue = has_body && request.expects_continue();
        let cr = Arc::new(ClientRequest {
            conn: Arc::downgrade(self),
            scheduler: Mutex::new(Scheduler::current()),
            state: Mutex::new(ReqState {
                phase: WritePhase::Queued,
                head: HeadWrite::NotWritten,
                has_body,
                body_done: false,
                request_trailer: Headers::new(),
                response_phase: ResponsePhase::Pending,
                response: None,
                response_framing: None,
                response_trailer: None,
                body_stream_taken: false,
                expecting_continue,
                continue_received: false,
                cancelled: false,
                aborted: false,
                error: None,
            }),
            write_turn: FiberEvent::new(true),
            response_turn: FiberEvent::new(true),
            request,
        });

        let is_front = {
            let mut inner = lock(&self.inner);
            if !inner.allow_new_requests {
                return Err(HttpError::ConnectionClosing);
            }
            inner.write_queue.push_back(cr.clone());
            inner.response_queue.push_back(cr.clone());
            inner.write_queue.len() == 1
        };
        log_debug!(LOG, "queued {} {}", cr.request.method, cr.request.uri);

        if is_front {
            cr.advance_write()?;
        }
        Ok(cr)
    }

    /// Tear everything down: close the stream and fail every request
    /// that is not yet complete with `Aborted`.
    fn abort(self: &Arc<Self>) {
        log_verbose!(LOG, "aborting connection");
        let victims = {
            let mut inner = lock(&self.inner);
            inner.allow_new_requests = false;
            inner.request_failed = Some(FailureKind::Aborted);
            inner.response_failed = Some(FailureKind::Aborted);
            inner.response_reading = false;
            let mut victims: Vec<Arc<ClientRequest>> = inner.write_queue.drain(..).collect();
            for r in inner.response_queue.drain(..) {
                if !victims.iter().any(|v| Arc::ptr_eq(v, &r)) {
                    victims.push(r);
                }
            }
            victims
        };
        let _ = self.conn.close(CloseHow::Both);
        for victim in victims {
            {
                let mut state = lock(&victim.state);
                let done =
                    state.phase == WritePhase::Done && state.response_phase == ResponsePhase::Done;
                if !done {
                    state.aborted = true;
                    if state.error.is_none() {
                        state.error = Some(FailureKind::Aborted);
                    }
                }
            }
            victim.write_turn.set();
            victim.response_turn.set();
        }
    }

    /// Latch a request-side failure: the current writer keeps the real
    /// error, queued-but-unwritten requests fail with
    /// `PriorRequestFailed`, and admission closes.
    fn fail_request_side(self: &Arc<Self>, kind: FailureKind, current: Option<&Arc<ClientRequest>>) {
        log_error!(LOG, "request side failed: {:?}", kind);
        {
            let mut inner = lock(&self.inner);
            inner.allow_new_requests = false;
            if inner.request_failed.is_none() {
                inner.request_failed = Some(kind.clone());
            }
            if let Some(current) = current {
                inner.write_queue.retain(|r| !Arc::ptr_eq(r, current));
                inner.response_queue.retain(|r| !Arc::ptr_eq(r, current));
            }
        }
        if let Some(current) = current {
            let mut state = lock(&current.state);
            if state.error.is_none() {
                state.error = Some(kind);
            }
        }
        self.fail_queued_writers(FailureKind::PriorRequestFailed);
    }

    /// Latch a response-side failure; parked readers wake and observe
    /// `PriorRequestFailed`.
    fn fail_response_side(
        self: &Arc<Self>,
        kind: FailureKind,
        current: Option<&Arc<ClientRequest>>,
    ) {
        log_error!(LOG, "response side failed: {:?}", kind);
        let waiters = {
            let mut inner = lock(&self.inner);
            inner.allow_new_requests = false;
            inner.response_reading = false;
            if inner.response_failed.is_none() {
                inner.response_failed = Some(kind.clone());
            }
            if let Some(current) = current {
                inner.response_queue.retain(|r| !Arc::ptr_eq(r, current));
            }
            inner.response_queue.iter().cloned().collect::<Vec<_>>()
        };
        if let Some(current) = current {
            let mut state = lock(&current.state);
            if state.error.is_none() {
                state.error = Some(kind);
            }
            current.response_turn.set();
            current.write_turn.set();
        }
        for waiter in waiters {
            waiter.response_turn.set();
            waiter.write_turn.set();
        }
    }

    /// Fail every request still queued on the write side (head not yet
    /// written), leaving in-flight ones alone.
    fn fail_queued_writers(self: &Arc<Self>, kind: FailureKind) {
        let victims = {
            let mut inner = lock(&self.inner);
            let mut victims = Vec::new();
            inner.write_queue.retain(|r| {
                let keep = lock(&r.state).head != HeadWrite::NotWritten;
                if !keep {
                    victims.push(r.clone());
                }
                keep
            });
            inner
                .response_queue
                .retain(|r| !victims.iter().any(|v| Arc::ptr_eq(v, r)));
            victims
        };
        for victim in victims {
            log_verbose!(
                LOG,
                "failing queued request {} {}: {:?}",
                victim.request.method,
                victim.request.uri,
                kind
            );
            {
                let mut state = lock(&victim.state);
                if state.error.is_none() {
                    state.error = Some(kind.clone());
                }
            }
            victim.write_turn.set();
            victim.response_turn.set();
        }
    }

    /// Kick the new front of the write queue: wake a parked writer, and
    /// if its head is still unwritten, run the deferred head write on
    /// the request's captured scheduler (inline when there is none).
    fn promote_writer(self: &Arc<Self>, next: &Arc<ClientRequest>) {
        let needs_task = {
            let state = lock(&next.state);
            state.head == HeadWrite::NotWritten && state.error.is_none()
        };
        next.write_turn.set();
        if !needs_task {
            return;
        }
        let sched = lock(&next.scheduler).clone();
        match sched {
            Some(sched) => {
                let next = next.clone();
                sched.schedule(move || {
                    if let Err(err) = next.advance_write() {
                        log_debug!(LOG, "deferred request head write failed: {err}");
                    }
                });
            }
            None => {
                if let Err(err) = next.advance_write() {
                    log_debug!(LOG, "inline promoted head write failed: {err}");
                }
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        // Nothing can be promoted any more; wake anything still parked
        // so it observes the teardown instead of waiting forever.
        let victims = {
            let mut inner = lock(&self.inner);
            inner.allow_new_requests = false;
            let mut victims: Vec<Arc<ClientRequest>> = inner.write_queue.drain(..).collect();
            for r in inner.response_queue.drain(..) {
                if !victims.iter().any(|v| Arc::ptr_eq(v, &r)) {
                    victims.push(r);
                }
            }
            victims
        };
        for victim in victims {
            {
                let mut state = lock(&victim.state);
                if state.error.is_none() {
                    state.error = Some(FailureKind::Aborted);
                }
            }
            victim.write_turn.set();
            victim.response_turn.set();
        }
        if self.own_stream {
            let _ = self.conn.close(CloseHow::Both);
        }
    }
}

/// One in-flight request/response pair on a [`ClientConnection`].
pub struct ClientRequest {
    /// Non-owning back-reference; the connection's queues hold the
    /// owning references.
    conn: Weak<ClientConnection>,
    request: Request,
    /// Captured at submission, used to run deferred head writes.
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    state: Mutex<ReqState>,
    write_turn: FiberEvent,
    response_turn: FiberEvent,
}

enum Step {
    Ready,
    Act,
    Drain(Arc<ClientRequest>),
    Wait,
    Fail(HttpError),
}

impl ClientRequest {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_complete(&self) -> bool {
        lock(&self.state).phase == WritePhase::Done
    }

    pub fn response_complete(&self) -> bool {
        lock(&self.state).response_phase == ResponsePhase::Done
    }

    /// The response head, reading it (in pipeline order) if necessary.
    pub fn response(self: &Arc<Self>) -> Result<Response, HttpError> {
        self.ensure_response()?;
        let state = lock(&self.state);
        state
            .response
            .clone()
            .ok_or_else(|| HttpError::Protocol("response not available".into()))
    }

    pub fn has_response_body(self: &Arc<Self>) -> Result<bool, HttpError> {
        self.ensure_response()?;
        Ok(!matches!(
            lock(&self.state).response_framing,
            Some(Framing::None) | None
        ))
    }

    /// The request body stream. Only valid for requests that declared a
    /// body (`Content-Length` or `Transfer-Encoding`).
    pub fn request_stream(self: &Arc<Self>) -> Result<RequestBody, HttpError> {
        let conn = self.client_conn()?;
        let writer = {
            let mut state = lock(&self.state);
            if let Some(kind) = &state.error {
                return Err(kind.rehydrate());
            }
            if !state.has_body {
                return Err(HttpError::Protocol("request declares no body".into()));
            }
            if state.body_done {
                return Err(HttpError::Protocol("request body already complete".into()));
            }
            if self.request.is_chunked() {
                BodyWriter::Chunked(conn.conn.chunked_writer())
            } else {
                let length = self.request.content_length().unwrap_or(0);
                BodyWriter::Identity(conn.conn.identity_writer(length))
            }
        };
        Ok(RequestBody {
            req: self.clone(),
            writer: Mutex::new(writer),
        })
    }

    /// The response body stream, reading the head first if necessary.
    /// May be taken once.
    pub fn response_stream(self: &Arc<Self>) -> Result<ResponseBody, HttpError> {
        self.ensure_response()?;
        let conn = self.client_conn()?;
        let framing = {
            let mut state = lock(&self.state);
            if state.body_stream_taken {
                return Err(HttpError::Protocol("response body stream already taken".into()));
            }
            state.body_stream_taken = true;
            state.response_framing.unwrap_or(Framing::None)
        };
        Ok(ResponseBody {
            req: self.clone(),
            reader: Mutex::new(FramedReader::new(conn.conn.clone(), framing)),
        })
    }

    /// Trailer fields to send after a chunked request body.
    pub fn set_request_trailer(&self, trailer: Headers) {
        lock(&self.state).request_trailer = trailer;
    }

    /// Trailer fields received after a chunked response body, once the
    /// response is fully read.
    pub fn response_trailer(&self) -> Option<Headers> {
        lock(&self.state).response_trailer.clone()
    }

    /// Ensure the response is read and its body fully drained, leaving
    /// the connection ready for the next pipelined response.
    pub fn finish(self: &Arc<Self>) -> Result<(), HttpError> {
        self.ensure_response()?;
        {
            let state = lock(&self.state);
            if state.response_phase == ResponsePhase::Done {
                return Ok(());
            }
            if state.body_stream_taken {
                return Err(HttpError::Protocol(
                    "response body stream still outstanding".into(),
                ));
            }
        }
        let stream = self.response_stream()?;
        let mut scratch = [0u8; 4096];
        loop {
            if stream.read_body(&mut scratch)? == 0 {
                return Ok(());
            }
        }
    }

    /// Cancel this request.
    ///
    /// Cooperative (`abort == false`): a still-queued request is removed
    /// without touching the stream; a fully-sent one is marked so its
    /// response is skipped. A request cancelled in the middle of a
    /// message (either direction) cannot leave a resynchronizable
    /// connection, so it degenerates to an abort. Destructive
    /// (`abort == true`): tear down the stream and fail every
    /// not-yet-complete request on the connection.
    pub fn cancel(self: &Arc<Self>, abort: bool) {
        let Some(conn) = self.conn.upgrade() else {
            let mut state = lock(&self.state);
            state.cancelled = true;
            if state.error.is_none() {
                state.error = Some(FailureKind::Cancelled);
            }
            return;
        };
        if abort {
            conn.abort();
            return;
        }

        enum Action {
            Nothing,
            Removed { was_front: bool },
            MarkSent,
            Abort,
        }

        let action = {
            let mut inner = lock(&conn.inner);
            let mut state = lock(&self.state);
            if state.cancelled || state.aborted || state.error.is_some() {
                Action::Nothing
            } else if state.phase == WritePhase::Done
                && state.response_phase == ResponsePhase::Done
            {
                // Already complete; nothing to cancel.
                Action::Nothing
            } else {
                match (state.head, state.phase, state.response_phase) {
                    (HeadWrite::NotWritten, _, _) => {
                        state.cancelled = true;
                        state.error = Some(FailureKind::Cancelled);
                        let was_front =
                            matches!(inner.write_queue.front(), Some(f) if Arc::ptr_eq(f, self));
                        inner.write_queue.retain(|r| !Arc::ptr_eq(r, self));
                        inner.response_queue.retain(|r| !Arc::ptr_eq(r, self));
                        Action::Removed { was_front }
                    }
                    (_, WritePhase::Done, ResponsePhase::Pending) => {
                        state.cancelled = true;
                        state.error = Some(FailureKind::Cancelled);
                        Action::MarkSent
                    }
                    // Mid-head, mid-body, or mid-response: the wire
                    // cannot be resynchronized.
                    _ => Action::Abort,
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Removed { was_front } => {
                log_verbose!(LOG, "cancelled queued {} {}", self.request.method, self.request.uri);
                self.write_turn.set();
                self.response_turn.set();
                if was_front {
                    let next = lock(&conn.inner).write_queue.front().cloned();
                    if let Some(next) = next {
                        conn.promote_writer(&next);
                    }
                }
            }
            Action::MarkSent => {
                log_verbose!(LOG, "cancelled sent {} {}", self.request.method, self.request.uri);
                self.write_turn.set();
                self.response_turn.set();
                // Wake any reader parked behind us so it can drain our
                // response when it reaches the front.
                let waiters: Vec<_> = lock(&conn.inner).response_queue.iter().cloned().collect();
                for waiter in waiters {
                    waiter.response_turn.set();
                }
            }
            Action::Abort => conn.abort(),
        }
    }

    // ── request side ────────────────────────────────────────────────────

    /// Drive the request head out: wait for promotion to the front of
    /// the write queue, then write the request line and headers. For a
    /// bodyless request this completes the whole request side.
    fn advance_write(self: &Arc<Self>) -> Result<(), HttpError> {
        let conn = self.client_conn()?;
        loop {
            let step = {
                let inner = lock(&conn.inner);
                let mut state = lock(&self.state);
                if let Some(kind) = &state.error {
                    Step::Fail(kind.rehydrate())
                } else {
                    match state.head {
                        HeadWrite::Written => Step::Ready,
                        HeadWrite::InProgress => Step::Wait,
                        HeadWrite::NotWritten => {
                            if inner.request_failed.is_some() {
                                Step::Fail(HttpError::PriorRequestFailed)
                            } else if matches!(inner.write_queue.front(), Some(f) if Arc::ptr_eq(f, self))
                            {
                                state.head = HeadWrite::InProgress;
                                Step::Act
                            } else {
                                Step::Wait
                            }
                        }
                    }
                }
            };
            match step {
                Step::Ready => return Ok(()),
                Step::Fail(err) => return Err(err),
                Step::Wait => self.write_turn.wait(),
                Step::Drain(_) => unreachable!("write side never drains"),
                Step::Act => {
                    log_debug!(LOG, "sending {} {}", self.request.method, self.request.uri);
                    match conn.conn.write_request_head(&self.request) {
                        Ok(()) => {
                            let bodyless = {
                                let mut state = lock(&self.state);
                                state.head = HeadWrite::Written;
                                state.phase = WritePhase::Writing;
                                !state.has_body
                            };
                            self.write_turn.set();
                            if bodyless {
                                self.request_done()?;
                            }
                            return Ok(());
                        }
                        Err(err) => {
                            let kind = FailureKind::of(&err);
                            conn.fail_request_side(kind, Some(self));
                            self.write_turn.set();
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// The request side is complete: flush, leave the write queue, and
    /// promote the next writer.
    fn request_done(self: &Arc<Self>) -> Result<(), HttpError> {
        let conn = self.client_conn()?;
        {
            lock(&self.state).phase = WritePhase::Done;
        }
        if let Err(err) = conn.conn.flush() {
            let kind = FailureKind::of(&err);
            conn.fail_request_side(kind, Some(self));
            return Err(err);
        }
        log_trace!(LOG, "sent {} {}", self.request.method, self.request.uri);
        let next = {
            let mut inner = lock(&conn.inner);
            if matches!(inner.write_queue.front(), Some(f) if Arc::ptr_eq(f, self)) {
                inner.write_queue.pop_front();
            }
            inner.write_queue.front().cloned()
        };
        if let Some(next) = next {
            conn.promote_writer(&next);
        }
        Ok(())
    }

    /// Block until a `100 Continue` arrives, or fail with
    /// `ConnectionClosing` if a final response arrives first.
    fn wait_for_continue(self: &Arc<Self>) -> Result<(), HttpError> {
        let conn = self.client_conn()?;
        loop {
            let step = {
                let mut inner = lock(&conn.inner);
                let state = lock(&self.state);
                if let Some(kind) = &state.error {
                    Step::Fail(kind.rehydrate())
                } else if state.continue_received {
                    Step::Ready
                } else if state.response.is_some() {
                    // A final response arrived first: give the body up.
                    Step::Fail(HttpError::ConnectionClosing)
                } else if matches!(inner.response_queue.front(), Some(f) if Arc::ptr_eq(f, self))
                    && !inner.response_reading
                {
                    inner.response_reading = true;
                    Step::Act
                } else {
                    Step::Wait
                }
            };
            match step {
                Step::Ready => return Ok(()),
                Step::Fail(err) => return Err(err),
                Step::Wait => self.write_turn.wait(),
                Step::Act => {
                    self.read_response_head(true)?;
                }
                Step::Drain(_) => unreachable!("continue wait never drains"),
            }
        }
    }

    // ── response side ───────────────────────────────────────────────────

    /// Block until this request's response head has been read (strictly
    /// in request order), reading it ourselves once we are the front of
    /// the response queue.
    fn ensure_response(self: &Arc<Self>) -> Result<(), HttpError> {
        let conn = self.client_conn()?;
        loop {
            let step = {
                let mut inner = lock(&conn.inner);
                let own = {
                    let state = lock(&self.state);
                    if let Some(kind) = &state.error {
                        Some(Step::Fail(kind.rehydrate()))
                    } else if state.response.is_some() {
                        Some(Step::Ready)
                    } else {
                        None
                    }
                };
                match own {
                    Some(step) => step,
                    None => {
                        if inner.response_failed.is_some() {
                            Step::Fail(HttpError::PriorRequestFailed)
                        } else {
                            match inner.response_queue.front().cloned() {
                                None => Step::Fail(HttpError::Protocol(
                                    "request is not awaiting a response".into(),
                                )),
                                Some(front) if Arc::ptr_eq(&front, self) => {
                                    if inner.response_reading {
                                        Step::Wait
                                    } else {
                                        inner.response_reading = true;
                                        Step::Act
                                    }
                                }
                                Some(front) => {
                                    let drainable = !inner.response_reading && {
                                        let fs = lock(&front.state);
                                        fs.cancelled
                                            && fs.response_phase == ResponsePhase::Pending
                                    };
                                    if drainable {
                                        inner.response_reading = true;
                                        Step::Drain(front)
                                    } else {
                                        Step::Wait
                                    }
                                }
                            }
                        }
                    }
                }
            };
            match step {
                Step::Ready => return Ok(()),
                Step::Fail(err) => return Err(err),
                Step::Wait => self.response_turn.wait(),
                Step::Act => {
                    self.read_response_head(false)?;
                    return Ok(());
                }
                Step::Drain(victim) => {
                    drain_cancelled(&conn, &victim)?;
                }
            }
        }
    }

    /// Parse response heads off the wire. Interim (1xx) responses are
    /// consumed here: a `100` releases a body writer waiting on
    /// `Expect: 100-continue`. With `stop_at_continue` the call returns
    /// after such an interim head instead of reading on to the final
    /// response.
    ///
    /// The caller must have claimed `response_reading` for this request.
    fn read_response_head(self: &Arc<Self>, stop_at_continue: bool) -> Result<bool, HttpError> {
        let conn = self.client_conn()?;
        let response = loop {
            let head = {
                let mut reader = conn.conn.reader();
                Connection::read_response_head(&mut reader)
            };
            let head = match head {
                Ok(head) => head,
                Err(err) => {
                    let kind = FailureKind::of(&err);
                    conn.fail_response_side(kind, Some(self));
                    return Err(err);
                }
            };
            log_debug!(
                LOG,
                "response {} for {} {}",
                head.status,
                self.request.method,
                self.request.uri
            );
            if head.is_informational() {
                if head.status == 100 {
                    lock(&self.state).continue_received = true;
                    self.write_turn.set();
                    if stop_at_continue {
                        lock(&conn.inner).response_reading = false;
                        return Ok(false);
                    }
                }
                continue;
            }
            break head;
        };
        self.install_response(&conn, response)?;
        Ok(true)
    }

    /// Record a final response head: decide body framing, apply
    /// admission decisions, and hand the response to the caller side.
    fn install_response(
        self: &Arc<Self>,
        conn: &Arc<ClientConnection>,
        response: Response,
    ) -> Result<(), HttpError> {
        let framing = match self.decide_framing(&response) {
            Ok(framing) => framing,
            Err(err) => {
                let kind = FailureKind::of(&err);
                conn.fail_response_side(kind, Some(self));
                return Err(err);
            }
        };
        let retire = response.closes_connection() || framing == Framing::UntilClose;

        {
            let mut inner = lock(&conn.inner);
            let mut state = lock(&self.state);
            if retire {
                inner.allow_new_requests = false;
            }
            state.response = Some(response);
            state.response_framing = Some(framing);
            state.response_phase = ResponsePhase::Headers;
        }
        if retire {
            log_verbose!(LOG, "connection retiring after this response");
            conn.fail_queued_writers(FailureKind::ConnectionClosing);
        }
        // Wake a continue-waiter: either the 100 already released it or
        // this final response tells it to give up.
        self.write_turn.set();
        if framing == Framing::None {
            self.response_done()?;
        }
        Ok(())
    }

    fn decide_framing(&self, response: &Response) -> Result<Framing, HttpError> {
        if self.request.method.eq_ignore_ascii_case("HEAD")
            || response.status == 204
            || response.status == 304
        {
            return Ok(Framing::None);
        }
        if response.is_chunked() {
            return Ok(Framing::Chunked);
        }
        if let Some(value) = response.header("Content-Length") {
            let length: u64 = value.trim().parse().map_err(|_| {
                HttpError::Protocol(format!("malformed Content-Length {value:?}"))
            })?;
            return Ok(if length == 0 {
                Framing::None
            } else {
                Framing::Identity(length)
            });
        }
        Ok(Framing::UntilClose)
    }

    /// The response is fully consumed: leave the response queue and wake
    /// the next reader.
    fn response_done(self: &Arc<Self>) -> Result<(), HttpError> {
        let conn = self.client_conn()?;
        let (next, close_read) = {
            let mut inner = lock(&conn.inner);
            if matches!(inner.response_queue.front(), Some(f) if Arc::ptr_eq(f, self)) {
                inner.response_queue.pop_front();
                inner.response_reading = false;
                let close_read = !inner.allow_new_requests && inner.response_queue.is_empty();
                (inner.response_queue.front().cloned(), close_read)
            } else {
                (None, false)
            }
        };
        {
            lock(&self.state).response_phase = ResponsePhase::Done;
        }
        log_trace!(
            LOG,
            "response consumed for {} {}",
            self.request.method,
            self.request.uri
        );
        if close_read {
            let _ = conn.conn.close(CloseHow::Read);
        }
        if let Some(next) = next {
            next.response_turn.set();
            next.write_turn.set();
        }
        Ok(())
    }

    fn client_conn(&self) -> Result<Arc<ClientConnection>, HttpError> {
        self.conn.upgrade().ok_or(HttpError::Aborted)
    }
}

/// Read and discard the response belonging to a cancelled (but sent)
/// request so the wire stays in sync for the next reader.
fn drain_cancelled(
    conn: &Arc<ClientConnection>,
    victim: &Arc<ClientRequest>,
) -> Result<(), HttpError> {
    log_verbose!(
        LOG,
        "draining response of cancelled {} {}",
        victim.request.method,
        victim.request.uri
    );
    victim.read_response_head(false)?;
    if lock(&victim.state).response_phase == ResponsePhase::Done {
        return Ok(());
    }
    let framing = lock(&victim.state)
        .response_framing
        .unwrap_or(Framing::None);
    let mut reader = FramedReader::new(conn.conn.clone(), framing);
    let mut scratch = [0u8; 4096];
    loop {
        match reader.read(&mut scratch) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                let kind = FailureKind::of(&err);
                conn.fail_response_side(kind, Some(victim));
                return Err(err);
            }
        }
    }
    lock(&victim.state).response_trailer = reader.take_trailer();
    victim.response_done()
}

enum BodyWriter {
    Identity(IdentityWriter),
    Chunked(ChunkedWriter),
}

/// Writable request body stream handed to the caller.
///
/// Writes park until the owning request is promoted to the write slot
/// (and, with `Expect: 100-continue`, until the interim response
/// arrives). Writing the final `Content-Length` byte completes the
/// request side without an extra call; chunked bodies complete on
/// [`close_body`](Self::close_body).
pub struct RequestBody {
    req: Arc<ClientRequest>,
    writer: Mutex<BodyWriter>,
}

impl RequestBody {
    pub fn write_body(&self, buf: &[u8]) -> Result<usize, HttpError> {
        self.req.advance_write()?;
        {
            let state = lock(&self.req.state);
            if let Some(kind) = &state.error {
                return Err(kind.rehydrate());
            }
            if state.body_done {
                return Err(HttpError::Protocol("request body already complete".into()));
            }
            if state.expecting_continue && !state.continue_received {
                drop(state);
                self.req.wait_for_continue()?;
            }
        }
        let mut writer = lock(&self.writer);
        let result = match &mut *writer {
            BodyWriter::Identity(w) => w.write(buf),
            BodyWriter::Chunked(w) => w.write(buf),
        };
        match result {
            Ok(n) => {
                let finished = matches!(&*writer, BodyWriter::Identity(w) if w.remaining() == 0);
                drop(writer);
                if finished {
                    lock(&self.req.state).body_done = true;
                    self.req.request_done()?;
                }
                Ok(n)
            }
            Err(HttpError::Protocol(msg)) => Err(HttpError::Protocol(msg)),
            Err(err) => {
                drop(writer);
                self.fail_write(err)
            }
        }
    }

    /// Close the body: for identity framing the declared length must be
    /// fully written; for chunked framing this emits the last chunk and
    /// any trailer.
    pub fn close_body(&self) -> Result<(), HttpError> {
        if lock(&self.req.state).body_done {
            return Ok(());
        }
        self.req.advance_write()?;
        let mut writer = lock(&self.writer);
        match &mut *writer {
            BodyWriter::Identity(w) => {
                if w.remaining() > 0 {
                    let err = HttpError::Protocol("request body shorter than Content-Length".into());
                    drop(writer);
                    if let Ok(conn) = self.req.client_conn() {
                        conn.fail_request_side(FailureKind::of(&err), Some(&self.req));
                    }
                    return Err(err);
                }
                // Completion already ran from the final write.
                Ok(())
            }
            BodyWriter::Chunked(w) => {
                let trailer = lock(&self.req.state).request_trailer.clone();
                match w.finish(&trailer) {
                    Ok(()) => {
                        drop(writer);
                        lock(&self.req.state).body_done = true;
                        self.req.request_done()
                    }
                    Err(err) => {
                        drop(writer);
                        self.fail_write(err).map(|_| ())
                    }
                }
            }
        }
    }

    fn fail_write(&self, err: HttpError) -> Result<usize, HttpError> {
        if lock(&self.req.state).aborted {
            return Err(HttpError::Aborted);
        }
        if let Ok(conn) = self.req.client_conn() {
            conn.fail_request_side(FailureKind::of(&err), Some(&self.req));
        }
        Err(err)
    }
}

impl Stream for RequestBody {
    fn read(&self, _buf: &mut [u8]) -> mordor::Result<usize> {
        Err(mordor::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "request body is write-only",
        )))
    }

    fn write(&self, buf: &[u8]) -> mordor::Result<usize> {
        self.write_body(buf).map_err(HttpError::into_stream_error)
    }

    fn close(&self, how: CloseHow) -> mordor::Result<()> {
        match how {
            CloseHow::Read => Ok(()),
            CloseHow::Write | CloseHow::Both => {
                self.close_body().map_err(HttpError::into_stream_error)
            }
        }
    }

    fn flush(&self) -> mordor::Result<()> {
        let conn = self
            .req
            .client_conn()
            .map_err(HttpError::into_stream_error)?;
        conn.conn.flush().map_err(HttpError::into_stream_error)
    }
}

/// Readable response body stream handed to the caller.
///
/// EOF is the message boundary; reading it to the end releases the next
/// pipelined response.
pub struct ResponseBody {
    req: Arc<ClientRequest>,
    reader: Mutex<FramedReader>,
}

impl ResponseBody {
    pub fn read_body(&self, buf: &mut [u8]) -> Result<usize, HttpError> {
        {
            let state = lock(&self.req.state);
            if state.aborted {
                return Err(HttpError::Aborted);
            }
            if state.cancelled {
                return Err(HttpError::Cancelled);
            }
            if state.response_phase == ResponsePhase::Done {
                return Ok(0);
            }
        }
        let mut reader = lock(&self.reader);
        match reader.read(buf) {
            Ok(0) => {
                let trailer = reader.take_trailer();
                drop(reader);
                lock(&self.req.state).response_trailer = trailer;
                self.req.response_done()?;
                Ok(0)
            }
            Ok(n) => {
                let mut state = lock(&self.req.state);
                if state.response_phase == ResponsePhase::Headers {
                    state.response_phase = ResponsePhase::Body;
                }
                Ok(n)
            }
            Err(err) => {
                drop(reader);
                if lock(&self.req.state).aborted {
                    return Err(HttpError::Aborted);
                }
                if let Ok(conn) = self.req.client_conn() {
                    conn.fail_response_side(FailureKind::of(&err), Some(&self.req));
                }
                Err(err)
            }
        }
    }
}

impl Stream for ResponseBody {
    fn read(&self, buf: &mut [u8]) -> mordor::Result<usize> {
        self.read_body(buf).map_err(HttpError::into_stream_error)
    }

    fn write(&self, _buf: &[u8]) -> mordor::Result<usize> {
        Err(mordor::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "response body is read-only",
        )))
    }

    fn close(&self, _how: CloseHow) -> mordor::Result<()> {
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
