//! Interceptors: cross-cutting wrappers around calls.
//!
//! Interceptors add logic around every call regardless of protocol, such as:
//! - Adding authentication headers
//! - Logging and metrics
//! - Validating requests
//!
//! They compose as an onion: the first interceptor supplied is outermost, so
//! it sees the request first and the response last.
//!
//! # Example
//!
//! ```ignore
//! use scalpel::{FnInterceptor, HandlerOption, with_interceptors};
//!
//! let logging = FnInterceptor::unary(|ctx, req, next| {
//!     Box::pin(async move {
//!         tracing::info!(procedure = %req.spec().procedure, "calling");
//!         next.call(ctx, req).await
//!     })
//! });
//! let option: HandlerOption = with_interceptors(vec![Arc::new(logging)]).into();
//! ```

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use scalpel_core::{CallContext, Code, Error, Message};

use crate::spec::Spec;

/// A unary request with an erased message.
pub struct AnyRequest {
    spec: Spec,
    header: HeaderMap,
    http_method: Method,
    message: Box<dyn Message>,
}

impl AnyRequest {
    /// A POST request for `spec` carrying `message`.
    pub fn new(spec: Spec, message: Box<dyn Message>) -> Self {
        Self {
            spec,
            header: HeaderMap::new(),
            http_method: Method::POST,
            message,
        }
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    /// The HTTP method the request was (or will be) sent with.
    pub fn http_method(&self) -> &Method {
        &self.http_method
    }

    pub fn set_http_method(&mut self, method: Method) {
        self.http_method = method;
    }

    pub fn message(&self) -> &dyn Message {
        self.message.as_ref()
    }

    pub fn message_mut(&mut self) -> &mut dyn Message {
        self.message.as_mut()
    }

    pub fn into_message(self) -> Box<dyn Message> {
        self.message
    }
}

impl fmt::Debug for AnyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyRequest")
            .field("spec", &self.spec)
            .field("header", &self.header)
            .field("http_method", &self.http_method)
            .finish_non_exhaustive()
    }
}

/// A unary response with an erased message.
pub struct AnyResponse {
    header: HeaderMap,
    trailer: HeaderMap,
    message: Box<dyn Message>,
}

impl AnyResponse {
    pub fn new(message: Box<dyn Message>) -> Self {
        Self {
            header: HeaderMap::new(),
            trailer: HeaderMap::new(),
            message,
        }
    }

    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    pub fn trailer(&self) -> &HeaderMap {
        &self.trailer
    }

    pub fn trailer_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailer
    }

    pub fn message(&self) -> &dyn Message {
        self.message.as_ref()
    }

    pub fn into_message(self) -> Box<dyn Message> {
        self.message
    }
}

impl fmt::Debug for AnyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyResponse")
            .field("header", &self.header)
            .field("trailer", &self.trailer)
            .finish_non_exhaustive()
    }
}

/// The client's side of a streaming call.
pub trait StreamingClientConn: Send {
    fn spec(&self) -> &Spec;

    /// Headers sent with the request. Only effective before the first send.
    fn request_header(&mut self) -> &mut HeaderMap;

    fn send<'a>(&'a mut self, message: &'a dyn Message) -> BoxFuture<'a, Result<(), Error>>;

    fn close_request(&mut self) -> BoxFuture<'_, Result<(), Error>>;

    /// Receive the next message. `Ok(false)` once the stream is exhausted.
    fn receive<'a>(&'a mut self, message: &'a mut dyn Message)
    -> BoxFuture<'a, Result<bool, Error>>;

    fn response_header(&self) -> &HeaderMap;

    fn response_trailer(&self) -> &HeaderMap;

    fn close_response(&mut self) -> BoxFuture<'_, Result<(), Error>>;
}

/// The handler's side of a streaming call.
pub trait StreamingHandlerConn: Send {
    fn spec(&self) -> &Spec;

    fn request_header(&self) -> &HeaderMap;

    /// Receive the next message. `Ok(false)` once the client closed its side.
    fn receive<'a>(&'a mut self, message: &'a mut dyn Message)
    -> BoxFuture<'a, Result<bool, Error>>;

    /// Headers sent with the response. Only effective before the first send.
    fn response_header(&mut self) -> &mut HeaderMap;

    fn response_trailer(&mut self) -> &mut HeaderMap;

    fn send<'a>(&'a mut self, message: &'a dyn Message) -> BoxFuture<'a, Result<(), Error>>;
}

/// The signature of a unary call.
///
/// Interceptors wrap this function to add logic before and after the call.
pub type UnaryFunc = Arc<
    dyn Fn(CallContext, AnyRequest) -> BoxFuture<'static, Result<AnyResponse, Error>>
        + Send
        + Sync,
>;

/// Opens a streaming call from the client's side.
pub type StreamingClientFunc =
    Arc<dyn Fn(CallContext, Spec) -> Box<dyn StreamingClientConn> + Send + Sync>;

/// Runs a streaming call on the handler's side.
///
/// The connection is borrowed so the caller can finish the stream after the
/// handler returns.
pub type StreamingHandlerFunc = Arc<
    dyn for<'a> Fn(CallContext, &'a mut dyn StreamingHandlerConn) -> BoxFuture<'a, Result<(), Error>>
        + Send
        + Sync,
>;

/// Build a [`StreamingHandlerFunc`] from a closure.
pub fn streaming_handler_func<F>(func: F) -> StreamingHandlerFunc
where
    F: for<'a> Fn(CallContext, &'a mut dyn StreamingHandlerConn) -> BoxFuture<'a, Result<(), Error>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(func)
}

/// Wraps unary and streaming calls.
///
/// Every method defaults to passing the call through unchanged, so an
/// interceptor only implements the kinds of calls it cares about.
pub trait Interceptor: Send + Sync + 'static {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        next
    }

    fn wrap_streaming_client(&self, next: StreamingClientFunc) -> StreamingClientFunc {
        next
    }

    fn wrap_streaming_handler(&self, next: StreamingHandlerFunc) -> StreamingHandlerFunc {
        next
    }
}

/// Interceptors applied as one, first supplied outermost.
#[derive(Clone)]
pub struct Chain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Chain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("count", &self.interceptors.len())
            .finish()
    }
}

// Wrapping runs back to front so the first interceptor ends up outermost.
impl Interceptor for Chain {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        self.interceptors
            .iter()
            .rev()
            .fold(next, |next, interceptor| interceptor.wrap_unary(next))
    }

    fn wrap_streaming_client(&self, next: StreamingClientFunc) -> StreamingClientFunc {
        self.interceptors
            .iter()
            .rev()
            .fold(next, |next, interceptor| interceptor.wrap_streaming_client(next))
    }

    fn wrap_streaming_handler(&self, next: StreamingHandlerFunc) -> StreamingHandlerFunc {
        self.interceptors
            .iter()
            .rev()
            .fold(next, |next, interceptor| interceptor.wrap_streaming_handler(next))
    }
}

/// Append `new` to `existing`.
///
/// Appending nothing returns `existing` unchanged, and a single interceptor
/// appended to nothing is returned as-is rather than wrapped in a [`Chain`].
pub fn chain(
    existing: Option<Arc<dyn Interceptor>>,
    new: Vec<Arc<dyn Interceptor>>,
) -> Option<Arc<dyn Interceptor>> {
    if new.is_empty() {
        return existing;
    }
    let mut interceptors = Vec::with_capacity(new.len() + 1);
    interceptors.extend(existing);
    interceptors.extend(new);
    if interceptors.len() == 1 {
        return interceptors.pop();
    }
    Some(Arc::new(Chain::new(interceptors)))
}

/// The rest of the unary chain, as seen from a [`FnInterceptor`].
#[derive(Clone)]
pub struct UnaryNext {
    inner: UnaryFunc,
}

impl UnaryNext {
    pub(crate) fn new(inner: UnaryFunc) -> Self {
        Self { inner }
    }

    /// Call the next interceptor or the actual RPC.
    pub async fn call(self, ctx: CallContext, request: AnyRequest) -> Result<AnyResponse, Error> {
        (self.inner)(ctx, request).await
    }
}

/// A function-based unary interceptor.
///
/// # Example
///
/// ```ignore
/// use scalpel::FnInterceptor;
///
/// let auth = FnInterceptor::unary(|ctx, req, next| {
///     Box::pin(async move {
///         if req.header().get("authorization").is_none() {
///             return Err(Error::new(Code::Unauthenticated, "missing token"));
///         }
///         next.call(ctx, req).await
///     })
/// });
/// ```
#[derive(Clone)]
pub struct FnInterceptor<F> {
    func: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(CallContext, AnyRequest, UnaryNext) -> BoxFuture<'static, Result<AnyResponse, Error>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    pub fn unary(func: F) -> Self {
        Self { func }
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(CallContext, AnyRequest, UnaryNext) -> BoxFuture<'static, Result<AnyResponse, Error>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let func = self.func.clone();
        Arc::new(move |ctx, request| func(ctx, request, UnaryNext::new(next.clone())))
    }
}

/// Convenience alias for closures wrapping unary calls.
pub type UnaryInterceptorFunc<F> = FnInterceptor<F>;

/// Adds a header to every outgoing unary request and client stream.
#[derive(Clone, Debug)]
pub struct HeaderInterceptor {
    name: HeaderName,
    value: HeaderValue,
}

impl HeaderInterceptor {
    pub fn try_new(name: &str, value: &str) -> Result<Self, Error> {
        let name = name.parse().map_err(|_| {
            Error::new(Code::InvalidArgument, format!("invalid header name: {name}"))
        })?;
        let value = value.parse().map_err(|_| {
            Error::new(Code::InvalidArgument, format!("invalid header value: {value}"))
        })?;
        Ok(Self { name, value })
    }

    pub fn from_parts(name: HeaderName, value: HeaderValue) -> Self {
        Self { name, value }
    }
}

impl Interceptor for HeaderInterceptor {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let name = self.name.clone();
        let value = self.value.clone();
        Arc::new(move |ctx, mut request: AnyRequest| {
            request.header_mut().insert(name.clone(), value.clone());
            next(ctx, request)
        })
    }

    fn wrap_streaming_client(&self, next: StreamingClientFunc) -> StreamingClientFunc {
        let name = self.name.clone();
        let value = self.value.clone();
        Arc::new(move |ctx, spec| {
            let mut conn = next(ctx, spec);
            conn.request_header().insert(name.clone(), value.clone());
            conn
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Ping;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
    }

    fn recorder(name: &'static str, log: &Log) -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
        })
    }

    impl Interceptor for Recorder {
        fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
            let name = self.name;
            let log = self.log.clone();
            Arc::new(move |ctx, request| {
                let next = next.clone();
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{name} before"));
                    let result = next(ctx, request).await;
                    log.lock().unwrap().push(format!("{name} after"));
                    result
                })
            })
        }

        fn wrap_streaming_client(&self, next: StreamingClientFunc) -> StreamingClientFunc {
            let name = self.name;
            let log = self.log.clone();
            Arc::new(move |ctx, spec| {
                log.lock().unwrap().push(format!("{name} open"));
                next(ctx, spec)
            })
        }

        fn wrap_streaming_handler(&self, next: StreamingHandlerFunc) -> StreamingHandlerFunc {
            let name = self.name;
            let log = self.log.clone();
            streaming_handler_func(move |ctx, conn| {
                let next = next.clone();
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{name} before"));
                    let result = next(ctx, conn).await;
                    log.lock().unwrap().push(format!("{name} after"));
                    result
                })
            })
        }
    }

    fn unary_call(log: &Log) -> UnaryFunc {
        let log = log.clone();
        Arc::new(move |_ctx, request: AnyRequest| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push("call".to_string());
                Ok(AnyResponse::new(request.into_message()))
            })
        })
    }

    async fn run_unary(interceptor: Option<Arc<dyn Interceptor>>, log: &Log) -> Vec<String> {
        let mut call = unary_call(log);
        if let Some(interceptor) = interceptor {
            call = interceptor.wrap_unary(call);
        }
        let request = AnyRequest::new(Spec::default(), Box::new(Ping::default()));
        call(CallContext::background(), request).await.unwrap();
        std::mem::take(&mut *log.lock().unwrap())
    }

    #[tokio::test]
    async fn test_first_interceptor_is_outermost() {
        let log = Log::default();
        let interceptors = vec![recorder("a", &log), recorder("b", &log)];
        let seen = run_unary(chain(None, interceptors), &log).await;
        assert_eq!(seen, ["a before", "b before", "call", "b after", "a after"]);
    }

    #[tokio::test]
    async fn test_chaining_is_concatenation() {
        let log = Log::default();
        let split = chain(
            chain(None, vec![recorder("a", &log)]),
            vec![recorder("b", &log), recorder("c", &log)],
        );
        let split_order = run_unary(split, &log).await;

        let whole = chain(
            None,
            vec![recorder("a", &log), recorder("b", &log), recorder("c", &log)],
        );
        let whole_order = run_unary(whole, &log).await;

        assert_eq!(split_order, whole_order);
        assert_eq!(split_order.len(), 7);
    }

    #[test]
    fn test_chain_edge_cases() {
        let log = Log::default();
        assert!(chain(None, Vec::new()).is_none());

        let existing = recorder("a", &log);
        let unchanged = chain(Some(existing.clone()), Vec::new()).unwrap();
        assert!(Arc::ptr_eq(&existing, &unchanged));

        let single = recorder("b", &log);
        let direct = chain(None, vec![single.clone()]).unwrap();
        assert!(Arc::ptr_eq(&single, &direct));
    }

    struct NoopHandlerConn {
        spec: Spec,
        header: HeaderMap,
        trailer: HeaderMap,
    }

    impl StreamingHandlerConn for NoopHandlerConn {
        fn spec(&self) -> &Spec {
            &self.spec
        }

        fn request_header(&self) -> &HeaderMap {
            &self.header
        }

        fn receive<'a>(
            &'a mut self,
            _message: &'a mut dyn Message,
        ) -> BoxFuture<'a, Result<bool, Error>> {
            Box::pin(async { Ok(false) })
        }

        fn response_header(&mut self) -> &mut HeaderMap {
            &mut self.header
        }

        fn response_trailer(&mut self) -> &mut HeaderMap {
            &mut self.trailer
        }

        fn send<'a>(&'a mut self, _message: &'a dyn Message) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_streaming_handler_onion() {
        let log = Log::default();
        let interceptor = chain(None, vec![recorder("a", &log), recorder("b", &log)]).unwrap();
        let inner_log = log.clone();
        let handler = interceptor.wrap_streaming_handler(streaming_handler_func(
            move |_ctx, conn| {
                let log = inner_log.clone();
                Box::pin(async move {
                    let mut msg = Ping::default();
                    while conn.receive(&mut msg).await? {}
                    conn.response_trailer()
                        .insert("x-done", HeaderValue::from_static("1"));
                    log.lock().unwrap().push("handler".to_string());
                    Ok(())
                })
            },
        ));

        let mut conn = NoopHandlerConn {
            spec: Spec::default(),
            header: HeaderMap::new(),
            trailer: HeaderMap::new(),
        };
        handler(CallContext::background(), &mut conn).await.unwrap();
        assert_eq!(conn.trailer.get("x-done").unwrap(), "1");
        assert_eq!(
            *log.lock().unwrap(),
            ["a before", "b before", "handler", "b after", "a after"]
        );
    }

    /// The transport end: replays `pending` empty messages.
    struct WireClientConn {
        spec: Spec,
        header: HeaderMap,
        pending: usize,
        log: Log,
    }

    impl StreamingClientConn for WireClientConn {
        fn spec(&self) -> &Spec {
            &self.spec
        }

        fn request_header(&mut self) -> &mut HeaderMap {
            &mut self.header
        }

        fn send<'a>(&'a mut self, _message: &'a dyn Message) -> BoxFuture<'a, Result<(), Error>> {
            self.log.lock().unwrap().push("conn send".to_string());
            Box::pin(async { Ok(()) })
        }

        fn close_request(&mut self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn receive<'a>(
            &'a mut self,
            _message: &'a mut dyn Message,
        ) -> BoxFuture<'a, Result<bool, Error>> {
            Box::pin(async move {
                if self.pending == 0 {
                    return Ok(false);
                }
                self.pending -= 1;
                self.log.lock().unwrap().push("conn receive".to_string());
                Ok(true)
            })
        }

        fn response_header(&self) -> &HeaderMap {
            &self.header
        }

        fn response_trailer(&self) -> &HeaderMap {
            &self.header
        }

        fn close_response(&mut self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct RecordingClientConn {
        name: &'static str,
        log: Log,
        inner: Box<dyn StreamingClientConn>,
    }

    impl StreamingClientConn for RecordingClientConn {
        fn spec(&self) -> &Spec {
            self.inner.spec()
        }

        fn request_header(&mut self) -> &mut HeaderMap {
            self.inner.request_header()
        }

        fn send<'a>(&'a mut self, message: &'a dyn Message) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("{} send", self.name));
                self.inner.send(message).await
            })
        }

        fn close_request(&mut self) -> BoxFuture<'_, Result<(), Error>> {
            self.inner.close_request()
        }

        fn receive<'a>(
            &'a mut self,
            message: &'a mut dyn Message,
        ) -> BoxFuture<'a, Result<bool, Error>> {
            Box::pin(async move {
                let more = self.inner.receive(message).await?;
                if more {
                    self.log.lock().unwrap().push(format!("{} receive", self.name));
                }
                Ok(more)
            })
        }

        fn response_header(&self) -> &HeaderMap {
            self.inner.response_header()
        }

        fn response_trailer(&self) -> &HeaderMap {
            self.inner.response_trailer()
        }

        fn close_response(&mut self) -> BoxFuture<'_, Result<(), Error>> {
            self.inner.close_response()
        }
    }

    struct ConnRecorder {
        name: &'static str,
        log: Log,
    }

    impl Interceptor for ConnRecorder {
        fn wrap_streaming_client(&self, next: StreamingClientFunc) -> StreamingClientFunc {
            let name = self.name;
            let log = self.log.clone();
            Arc::new(move |ctx, spec| -> Box<dyn StreamingClientConn> {
                Box::new(RecordingClientConn {
                    name,
                    log: log.clone(),
                    inner: next(ctx, spec),
                })
            })
        }
    }

    #[tokio::test]
    async fn test_streaming_client_message_order() {
        let log = Log::default();
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(ConnRecorder {
                name: "a",
                log: log.clone(),
            }),
            Arc::new(ConnRecorder {
                name: "b",
                log: log.clone(),
            }),
        ];
        let wire_log = log.clone();
        let open: StreamingClientFunc = Arc::new(move |_ctx, spec| -> Box<dyn StreamingClientConn> {
            Box::new(WireClientConn {
                spec,
                header: HeaderMap::new(),
                pending: 1,
                log: wire_log.clone(),
            })
        });
        let open = chain(None, interceptors).unwrap().wrap_streaming_client(open);
        let mut conn = open(CallContext::background(), Spec::default());

        conn.send(&Ping::default()).await.unwrap();
        assert_eq!(
            std::mem::take(&mut *log.lock().unwrap()),
            ["a send", "b send", "conn send"]
        );

        let mut reply = Ping::default();
        assert!(conn.receive(&mut reply).await.unwrap());
        assert!(!conn.receive(&mut reply).await.unwrap());
        assert_eq!(
            *log.lock().unwrap(),
            ["conn receive", "b receive", "a receive"]
        );
    }

    #[tokio::test]
    async fn test_fn_interceptor_can_short_circuit() {
        let log = Log::default();
        let deny = FnInterceptor::unary(|ctx, request: AnyRequest, next: UnaryNext| {
            Box::pin(async move {
                if request.header().get("authorization").is_none() {
                    return Err(Error::new(Code::Unauthenticated, "missing token"));
                }
                next.call(ctx, request).await
            })
        });
        let call = deny.wrap_unary(unary_call(&log));

        let request = AnyRequest::new(Spec::default(), Box::new(Ping::default()));
        let err = call(CallContext::background(), request).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert!(log.lock().unwrap().is_empty());

        let call = HeaderInterceptor::try_new("authorization", "Bearer t")
            .unwrap()
            .wrap_unary(deny.wrap_unary(unary_call(&log)));
        let request = AnyRequest::new(Spec::default(), Box::new(Ping::default()));
        call(CallContext::background(), request).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["call"]);
    }

    #[test]
    fn test_header_interceptor_rejects_invalid_names() {
        let err = HeaderInterceptor::try_new("bad header", "v").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
