//! Raw ESP-IDF httpd plumbing for `POST /ws`.
//!
//! `EspHttpServer` completes every response before its handler returns, so the
//! LED route is registered directly with httpd. The handler hands the socket
//! to `httpd_queue_work` and the acknowledgment is written from the httpd task
//! with `httpd_socket_send` once the job runs.

use std::{
    ffi::{c_char, c_int, c_void, CString},
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use esp_idf_svc::sys::{
    esp_err_t, http_method_HTTP_POST, httpd_handle_t, httpd_queue_work, httpd_register_uri_handler,
    httpd_req_recv, httpd_req_t, httpd_req_to_sockfd, httpd_resp_send, httpd_resp_set_hdr,
    httpd_resp_set_status, httpd_resp_set_type, httpd_socket_send, httpd_uri_t, EspError,
    ESP_FAIL, ESP_OK, HTTPD_SOCK_ERR_TIMEOUT,
};
use log::{debug, info, warn};

use climate_common::{
    deferred::Counters,
    http::{read_body, reason_phrase},
    DeferredResponseJob, DeliveryError, Dispatcher, QueueCounters, Response, ResponseSink,
    SubmitError, WorkQueue,
};

/// Open client socket on the httpd server, identified by its descriptor.
pub struct HttpdSocket {
    handle: httpd_handle_t,
    fd: c_int,
}

// The handle is only passed back into httpd calls, which are safe from any task.
unsafe impl Send for HttpdSocket {}

impl ResponseSink for HttpdSocket {
    fn deliver(self, response: Response) -> Result<(), DeliveryError> {
        let bytes = response.to_http_bytes();
        let mut sent = 0;

        while sent < bytes.len() {
            let rest = &bytes[sent..];
            let rc = unsafe {
                httpd_socket_send(
                    self.handle,
                    self.fd,
                    rest.as_ptr() as *const c_char,
                    rest.len() as _,
                    0,
                )
            };
            if rc <= 0 {
                return Err(DeliveryError::Send(format!("httpd_socket_send returned {rc}")));
            }
            sent += rc as usize;
        }
        Ok(())
    }
}

struct Envelope<C> {
    job: DeferredResponseJob<C>,
    counters: Arc<Counters>,
    pending: Arc<AtomicUsize>,
}

/// Deferred work executed on the httpd task through its control socket.
///
/// httpd does not bound its work queue, so at most `capacity` jobs are allowed
/// in flight and anything beyond that is refused.
pub struct HttpdWorkQueue {
    handle: httpd_handle_t,
    capacity: usize,
    pending: Arc<AtomicUsize>,
    counters: Arc<Counters>,
}

unsafe impl Send for HttpdWorkQueue {}
unsafe impl Sync for HttpdWorkQueue {}

impl HttpdWorkQueue {
    pub fn new(handle: httpd_handle_t, capacity: usize) -> Self {
        Self {
            handle,
            capacity: capacity.max(1),
            pending: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(Counters::default()),
        }
    }
}

impl WorkQueue<HttpdSocket> for HttpdWorkQueue {
    fn submit(
        &self,
        job: DeferredResponseJob<HttpdSocket>,
    ) -> Result<(), SubmitError<DeferredResponseJob<HttpdSocket>>> {
        let capacity = self.capacity;
        if self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_err()
        {
            self.counters.record_rejected();
            return Err(SubmitError::Full(job));
        }

        let envelope = Box::new(Envelope {
            job,
            counters: Arc::clone(&self.counters),
            pending: Arc::clone(&self.pending),
        });
        let arg = Box::into_raw(envelope);

        let rc = unsafe {
            httpd_queue_work(self.handle, Some(run_envelope::<HttpdSocket>), arg as *mut c_void)
        };
        if rc != ESP_OK {
            // httpd never saw the pointer; take ownership back.
            let envelope = unsafe { Box::from_raw(arg) };
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.counters.record_rejected();
            warn!("httpd_queue_work failed: esp_err_t={rc}");
            return Err(SubmitError::Full(envelope.job));
        }

        self.counters.record_submitted();
        debug!("queued deferred response");
        Ok(())
    }

    fn counters(&self) -> QueueCounters {
        self.counters.snapshot()
    }
}

unsafe extern "C" fn run_envelope<C: ResponseSink>(arg: *mut c_void) {
    let envelope = unsafe { Box::from_raw(arg as *mut Envelope<C>) };
    let Envelope {
        job,
        counters,
        pending,
    } = *envelope;

    let status = job.payload().status;
    match job.complete() {
        Ok(()) => info!("executed queued work, status {status}"),
        Err(err) => warn!("deferred response not delivered: {err}"),
    }
    pending.fetch_sub(1, Ordering::AcqRel);
    counters.record_completed();
}

/// State reachable from the raw `/ws` handler through `user_ctx`.
pub struct LedRoute {
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<HttpdWorkQueue>,
}

/// Registers `POST /ws` on a running server. The route lives as long as the
/// server, so its context is leaked.
pub fn register_led_route(handle: httpd_handle_t, route: LedRoute) -> Result<(), EspError> {
    let ctx = Box::into_raw(Box::new(route));
    let uri = httpd_uri_t {
        uri: c"/ws".as_ptr(),
        method: http_method_HTTP_POST,
        handler: Some(handle_led_post),
        user_ctx: ctx as *mut c_void,
        ..Default::default()
    };

    let rc = unsafe { httpd_register_uri_handler(handle, &uri) };
    if let Some(err) = EspError::from(rc) {
        drop(unsafe { Box::from_raw(ctx) });
        return Err(err);
    }
    Ok(())
}

/// Body of an in-progress httpd request.
struct RequestBody(*mut httpd_req_t);

impl io::Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe { httpd_req_recv(self.0, buf.as_mut_ptr() as *mut c_char, buf.len()) };
        match rc {
            n if n >= 0 => Ok(n as usize),
            HTTPD_SOCK_ERR_TIMEOUT => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out receiving request body",
            )),
            n => Err(io::Error::other(format!("httpd_req_recv returned {n}"))),
        }
    }
}

unsafe extern "C" fn handle_led_post(req: *mut httpd_req_t) -> esp_err_t {
    let route = unsafe { &*((*req).user_ctx as *const LedRoute) };
    let declared_len = unsafe { (*req).content_len };

    let mut buf = route.dispatcher.body_buffer();
    let received = match read_body(&mut RequestBody(req), declared_len, &mut buf) {
        Ok(received) => received,
        Err(err) => {
            warn!("failed to read request body: {err}");
            return unsafe { send_now(req, &Response::text(400, "unreadable body")) };
        }
    };

    let connection = HttpdSocket {
        handle: unsafe { (*req).handle },
        fd: unsafe { httpd_req_to_sockfd(req) },
    };

    match route
        .dispatcher
        .post_led(&buf[..received], connection, route.queue.as_ref())
    {
        Ok(()) => ESP_OK,
        Err(response) => unsafe { send_now(req, &response) },
    }
}

/// Answers on the request itself, before the handler returns.
unsafe fn send_now(req: *mut httpd_req_t, response: &Response) -> esp_err_t {
    let (Ok(status), Ok(content_type)) = (
        CString::new(format!("{} {}", response.status, reason_phrase(response.status))),
        CString::new(response.content_type),
    ) else {
        return ESP_FAIL;
    };
    let retry_after = response
        .retry_after_secs
        .and_then(|secs| CString::new(secs.to_string()).ok());

    unsafe {
        httpd_resp_set_status(req, status.as_ptr());
        httpd_resp_set_type(req, content_type.as_ptr());
        if let Some(retry_after) = &retry_after {
            httpd_resp_set_hdr(req, c"Retry-After".as_ptr(), retry_after.as_ptr());
        }
        httpd_resp_send(
            req,
            response.body.as_ptr() as *const c_char,
            response.body.len() as _,
        )
    }
}
