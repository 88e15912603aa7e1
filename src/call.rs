use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error};
use tokio::runtime::Handle;

use crate::bridge::{lock, Cancelable};
use crate::converter::{RawResult, RequestBody, ResponseConverter};
use crate::errors::{Error, ErrorKind};
use crate::executor::Execute;
use crate::model::{OperationRequest, RequestFactory};

/// The live state of one execution: single-use flag, cancellation flag and the wait in flight
#[derive(Default)]
pub struct PendingOperation {
    executed: Mutex<bool>,
    canceled: AtomicBool,
    in_flight: Mutex<Option<Arc<dyn Cancelable>>>,
}

impl PendingOperation {
    fn mark_executed(&self) -> Result<(), Error> {
        let mut executed = lock(&self.executed);
        if *executed {
            return Err(Error::new(ErrorKind::AlreadyExecuted, "Already executed."));
        }
        *executed = true;
        Ok(())
    }

    /// Whether `execute` or `enqueue` ran already
    pub fn is_executed(&self) -> bool {
        *lock(&self.executed)
    }

    /// Whether the operation was canceled
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Make `wait` the target of a later cancellation. Cancels it right away if the operation
    /// was canceled already.
    pub(crate) fn attach(&self, wait: Arc<dyn Cancelable>) {
        *lock(&self.in_flight) = Some(wait.clone());
        if self.is_canceled() {
            wait.cancel();
        }
    }

    pub(crate) fn detach(&self) {
        lock(&self.in_flight).take();
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        let in_flight = lock(&self.in_flight).clone();
        if let Some(wait) = in_flight {
            wait.cancel();
        }
    }
}

/// Cancels a call from anywhere, e.g. from another task while the call is awaited
#[derive(Clone)]
pub struct CancelHandle {
    operation: Arc<PendingOperation>,
}

impl CancelHandle {
    /// Cancel the call this handle belongs to
    pub fn cancel(&self) {
        self.operation.cancel()
    }

    /// Whether the call was canceled
    pub fn is_canceled(&self) -> bool {
        self.operation.is_canceled()
    }
}

/// Where calls run and where their callbacks are delivered
#[derive(Clone)]
pub(crate) struct CallContext {
    pub(crate) executor: Arc<dyn Execute + Send + Sync>,
    pub(crate) runtime: Handle,
    pub(crate) callbacks: Handle,
}

enum Payload<T> {
    Body(T),
    Error(RawResult),
}

/// The typed outcome of a completed call. Holds either a decoded body or an error body.
pub struct Response<T> {
    raw: RawResult,
    payload: Payload<T>,
}

impl<T> Response<T> {
    /// A successful response carrying the decoded body
    pub fn success(raw: RawResult, body: T) -> Self {
        Self {raw, payload: Payload::Body(body)}
    }

    /// A failed response carrying the error payload
    pub fn error(raw: RawResult, error_body: RawResult) -> Self {
        Self {raw, payload: Payload::Error(error_body)}
    }

    /// The bytes the device returned
    pub fn raw(&self) -> &RawResult {
        &self.raw
    }

    /// Whether the response carries a body
    pub fn is_success(&self) -> bool {
        matches!(self.payload, Payload::Body(_))
    }

    /// The decoded body of a successful response
    pub fn body(&self) -> Option<&T> {
        match &self.payload {
            Payload::Body(body) => Some(body),
            Payload::Error(_) => None,
        }
    }

    /// Take the decoded body of a successful response
    pub fn into_body(self) -> Option<T> {
        match self.payload {
            Payload::Body(body) => Some(body),
            Payload::Error(_) => None,
        }
    }

    /// The error payload of a failed response
    pub fn error_body(&self) -> Option<&RawResult> {
        match &self.payload {
            Payload::Body(_) => None,
            Payload::Error(error_body) => Some(error_body),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Response<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match &self.payload {
            Payload::Body(body) => f.debug_struct("Response").field("raw", &self.raw).field("body", body).finish(),
            Payload::Error(error_body) => f.debug_struct("Response").field("raw", &self.raw).field("error_body", error_body).finish(),
        }
    }
}

/// Receives the outcome of an enqueued call. Exactly one of the methods is invoked.
pub trait Callback<T>: Send {
    /// The call completed and its payload was decoded
    fn on_response(self, response: Response<T>);
    /// The call failed, timed out or was canceled
    fn on_failure(self, error: Error);
}

impl<T, F> Callback<T> for F where F: FnOnce(Result<Response<T>, Error>) + Send {
    fn on_response(self, response: Response<T>) {
        self(Ok(response))
    }

    fn on_failure(self, error: Error) {
        self(Err(error))
    }
}

/// A single-use invocation of a declared method.
///
/// Run it with [`execute`](Call::execute) or [`enqueue`](Call::enqueue), but only once.
/// [`Clone`] gives a fresh call for the same method.
pub struct Call<T> {
    factory: Arc<RequestFactory>,
    body: Result<Option<RequestBody>, Error>,
    decoder: Arc<dyn ResponseConverter<T>>,
    context: CallContext,
    timeout: Option<Duration>,
    operation: Arc<PendingOperation>,
}

impl<T> Clone for Call<T> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            body: self.body.clone(),
            decoder: self.decoder.clone(),
            context: self.context.clone(),
            timeout: self.timeout,
            operation: Arc::new(PendingOperation::default()),
        }
    }
}

impl<T: Send + 'static> Call<T> {
    pub(crate) fn new(factory: Arc<RequestFactory>, body: Result<Option<RequestBody>, Error>,
                      decoder: Arc<dyn ResponseConverter<T>>, context: CallContext) -> Self {
        Self {
            factory,
            body,
            decoder,
            context,
            timeout: None,
            operation: Arc::new(PendingOperation::default()),
        }
    }

    /// Override the client's operation timeout for this call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// A fresh request as this call would send it
    pub fn request(&self) -> Result<OperationRequest, Error> {
        self.factory.create(self.body.clone()?, self.timeout)
    }

    /// Run the call and wait for its response
    pub async fn execute(&self) -> Result<Response<T>, Error> {
        self.operation.mark_executed()?;
        self.perform().await
    }

    /// Run the call in the background. `callback` is invoked exactly once on the callback runtime.
    pub fn enqueue<C>(&self, callback: C) -> Result<(), Error> where C: Callback<T> + 'static {
        self.operation.mark_executed()?;
        let call = Self {
            factory: self.factory.clone(),
            body: self.body.clone(),
            decoder: self.decoder.clone(),
            context: self.context.clone(),
            timeout: self.timeout,
            operation: self.operation.clone(),
        };
        self.context.runtime.spawn(async move {
            let result = call.perform().await;
            call.context.callbacks.spawn(async move { deliver(callback, result) });
        });
        Ok(())
    }

    /// Cancel the call. A waiting execution returns a canceled failure, the hardware operation itself is not undone.
    pub fn cancel(&self) {
        self.operation.cancel()
    }

    /// A handle cancelling this call from elsewhere
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {operation: self.operation.clone()}
    }

    /// Whether the call was executed or enqueued
    pub fn is_executed(&self) -> bool {
        self.operation.is_executed()
    }

    /// Whether the call was canceled
    pub fn is_canceled(&self) -> bool {
        self.operation.is_canceled()
    }

    async fn perform(&self) -> Result<Response<T>, Error> {
        if self.operation.is_canceled() {
            return Err(Error::canceled());
        }
        let request = self.request()?;
        debug!("Executing {request}");
        let raw = self.context.executor.execute(&request, &self.operation).await?;
        if self.operation.is_canceled() {
            return Err(Error::canceled());
        }
        let body = self.decode(raw.clone())?;
        Ok(Response::success(raw, body))
    }

    /// A panicking converter fails the call like any other conversion error
    fn decode(&self, raw: RawResult) -> Result<T, Error> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.decoder.convert(raw))) {
            Ok(body) => Ok(body?),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Response converter panicked: {message}");
                Err(Error::new(ErrorKind::Conversion, &format!("Response converter panicked: {message}")))
            }
        }
    }
}

fn deliver<T, C: Callback<T>>(callback: C, result: Result<Response<T>, Error>) {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || match result {
        Ok(response) => callback.on_response(response),
        Err(error) => callback.on_failure(error),
    }));
    if let Err(panic) = outcome {
        error!("Callback panicked: {}", panic_message(panic.as_ref()));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// A call awaited like any other future. Nothing is sent to the device until it is first polled.
pub struct ResponseFuture<T> {
    inner: BoxFuture<'static, Result<Response<T>, Error>>,
    cancel: CancelHandle,
}

impl<T: Send + 'static> ResponseFuture<T> {
    pub(crate) fn new(call: Call<T>) -> Self {
        let cancel = call.cancel_handle();
        Self {
            inner: async move { call.execute().await }.boxed(),
            cancel,
        }
    }

    /// A handle cancelling the underlying call
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<Response<T>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::{Outcome, ResultBridge};
    use crate::converter::{BuiltInConverterFactory, ConverterFactory, resolve_response_converter};
    use crate::errors::ConvertError;
    use crate::executor::MockExecute;
    use crate::model::{parse_uuid, OperationKind};
    use std::sync::atomic::AtomicUsize;

    /// Waits until canceled, like a device that never answers
    struct Unanswered;

    #[async_trait::async_trait]
    impl Execute for Unanswered {
        async fn execute(&self, _request: &OperationRequest, operation: &PendingOperation) -> Result<RawResult, Error> {
            let bridge: Arc<ResultBridge<Vec<u8>>> = Arc::new(ResultBridge::new());
            operation.attach(bridge.clone());
            let outcome = bridge.wait(Duration::from_secs(5)).await;
            operation.detach();
            match outcome {
                Outcome::Complete(bytes) => Ok(RawResult::new(bytes)),
                Outcome::TimedOut => Err(ErrorKind::Timeout.into()),
                Outcome::Canceled => Err(Error::canceled()),
            }
        }
    }

    fn call_with(executor: Arc<dyn Execute + Send + Sync>) -> Call<String> {
        let factories: Vec<Arc<dyn ConverterFactory>> = vec![Arc::new(BuiltInConverterFactory)];
        let decoder = resolve_response_converter::<String>(&factories).expect("Unable to resolve converter");
        call_decoding(executor, decoder)
    }

    fn call_decoding(executor: Arc<dyn Execute + Send + Sync>, decoder: Arc<dyn ResponseConverter<String>>) -> Call<String> {
        let factory = RequestFactory::new(
            parse_uuid("180d").expect("Unable to parse service"),
            parse_uuid("2a38").expect("Unable to parse characteristic"),
            OperationKind::Read,
        );
        let context = CallContext {executor, runtime: Handle::current(), callbacks: Handle::current()};
        Call::new(Arc::new(factory), Ok(None), decoder, context)
    }

    fn answering(bytes: Vec<u8>, times: usize) -> Arc<dyn Execute + Send + Sync> {
        let mut mock = MockExecute::new();
        mock.expect_execute()
            .times(times)
            .returning(move |_, _| Ok(RawResult::new(bytes.clone())));
        Arc::new(mock)
    }

    #[tokio::test]
    async fn execute_decodes_response() {
        let call = call_with(answering(vec![0x01], 1));
        let response = call.execute().await.expect("Unable to execute call");
        assert!(response.is_success());
        assert_eq!(response.raw().bytes(), &[0x01]);
        assert_eq!(response.body().map(String::as_str), Some("0x01"));
        assert!(call.is_executed());
    }

    #[tokio::test]
    async fn second_execution_fails() {
        let call = call_with(answering(vec![], 1));
        call.execute().await.expect("Unable to execute call");
        let error = call.execute().await.expect_err("Second execute should fail");
        assert_eq!(error.kind(), ErrorKind::AlreadyExecuted);
        let error = call.enqueue(|_: Result<Response<String>, Error>| {}).expect_err("Enqueue should fail");
        assert_eq!(error.kind(), ErrorKind::AlreadyExecuted);
    }

    #[tokio::test]
    async fn clone_is_fresh() {
        let call = call_with(answering(vec![0x02], 2));
        call.execute().await.expect("Unable to execute call");
        let fresh = call.clone();
        assert!(!fresh.is_executed());
        let response = fresh.execute().await.expect("Unable to execute cloned call");
        assert_eq!(response.into_body(), Some("0x02".to_string()));
    }

    #[tokio::test]
    async fn canceled_before_execution_never_reaches_executor() {
        let call = call_with(answering(vec![], 0));
        call.cancel();
        assert!(call.is_canceled());
        let error = call.execute().await.expect_err("Canceled call should fail");
        assert!(error.is_canceled());
    }

    #[tokio::test]
    async fn cancel_interrupts_waiting_call() {
        let call = call_with(Arc::new(Unanswered));
        let handle = call.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        let error = call.execute().await.expect_err("Canceled call should fail");
        assert!(error.is_canceled());
    }

    #[tokio::test]
    async fn cancel_after_enqueue_fails_once() {
        let call = call_with(Arc::new(Unanswered));
        let failures = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let counter = failures.clone();
        call.enqueue(move |result: Result<Response<String>, Error>| {
            if let Err(error) = result {
                assert!(error.is_canceled());
                counter.fetch_add(1, Ordering::SeqCst);
            }
            let _ = sender.send(());
        }).expect("Unable to enqueue call");
        tokio::time::sleep(Duration::from_millis(10)).await;
        call.cancel();
        tokio::time::timeout(Duration::from_secs(2), receiver).await
            .expect("Callback was not invoked")
            .expect("Callback dropped without sending");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    struct Recorder {
        responses: Arc<AtomicUsize>,
        done: tokio::sync::oneshot::Sender<String>,
    }

    impl Callback<String> for Recorder {
        fn on_response(self, response: Response<String>) {
            self.responses.fetch_add(1, Ordering::SeqCst);
            let _ = self.done.send(response.into_body().unwrap_or_default());
        }

        fn on_failure(self, error: Error) {
            let _ = self.done.send(error.to_string());
        }
    }

    #[tokio::test]
    async fn enqueue_delivers_response_to_callback() {
        let call = call_with(answering(vec![0xab], 1));
        let responses = Arc::new(AtomicUsize::new(0));
        let (done, receiver) = tokio::sync::oneshot::channel();
        call.enqueue(Recorder {responses: responses.clone(), done}).expect("Unable to enqueue call");
        let body = tokio::time::timeout(Duration::from_secs(2), receiver).await
            .expect("Callback was not invoked")
            .expect("Callback dropped without sending");
        assert_eq!(body, "0xAB");
        assert_eq!(responses.load(Ordering::SeqCst), 1);
    }

    fn broken_decoder(_raw: RawResult) -> Result<String, ConvertError> {
        panic!("decoder bug")
    }

    #[tokio::test]
    async fn panicking_converter_fails_enqueued_call_once() {
        let call = call_decoding(answering(vec![0x01], 1), Arc::new(broken_decoder));
        let invocations = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let counter = invocations.clone();
        call.enqueue(move |result: Result<Response<String>, Error>| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = sender.send(result.map(|_| ()));
        }).expect("Unable to enqueue call");
        let result = tokio::time::timeout(Duration::from_secs(2), receiver).await
            .expect("Callback was not invoked")
            .expect("Callback dropped without sending");
        let error = result.expect_err("Panicking converter should fail the call");
        assert_eq!(error.kind(), ErrorKind::Conversion);
        assert!(error.message().contains("decoder bug"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_converter_fails_execute() {
        let call = call_decoding(answering(vec![0x01], 1), Arc::new(broken_decoder));
        let error = call.execute().await.expect_err("Panicking converter should fail the call");
        assert_eq!(error.kind(), ErrorKind::Conversion);
    }

    #[tokio::test]
    async fn panicking_callback_is_contained() {
        let call = call_with(answering(vec![1], 1));
        call.enqueue(|_: Result<Response<String>, Error>| panic!("callback failure"))
            .expect("Unable to enqueue call");
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the runtime keeps serving calls afterwards
        let response = call_with(answering(vec![2], 1)).execute().await.expect("Unable to execute call");
        assert_eq!(response.raw().bytes(), &[2]);
    }

    #[tokio::test]
    async fn response_future_resolves() {
        let future = ResponseFuture::new(call_with(answering(vec![0x10], 1)));
        let response = future.await.expect("Unable to await call");
        assert_eq!(response.body().map(String::as_str), Some("0x10"));
    }

    #[tokio::test]
    async fn response_future_waits_for_first_poll() {
        let executions = Arc::new(AtomicUsize::new(0));
        let counter = executions.clone();
        let mut mock = MockExecute::new();
        mock.expect_execute()
            .times(1)
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(RawResult::new(vec![0x20]))
            });
        let future = ResponseFuture::new(call_with(Arc::new(mock)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executions.load(Ordering::SeqCst), 0);
        future.await.expect("Unable to await call");
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn response_holds_exactly_one_payload() {
        let success = Response::success(RawResult::new(vec![1]), 5u8);
        assert!(success.is_success());
        assert_eq!(success.body(), Some(&5));
        assert!(success.error_body().is_none());

        let failure: Response<u8> = Response::error(RawResult::new(vec![1]), RawResult::new(vec![0xff]));
        assert!(!failure.is_success());
        assert!(failure.body().is_none());
        assert_eq!(failure.error_body().map(RawResult::bytes), Some(&[0xff][..]));
        assert_eq!(failure.into_body(), None);
    }
}
