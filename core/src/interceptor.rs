//! Interceptor chain around each network exchange.
//!
//! # Design
//! The chain is an immutable slice of interceptors plus the terminal
//! exchange function. An `InvocationTarget` is a cursor into that slice:
//! calling `proceed` runs the next interceptor with a cursor one step
//! further along, and past the end performs the exchange. Interceptors are
//! therefore free to call `proceed` zero times (answer or abort on their
//! own), once, or several times (retry).

use std::sync::Arc;

use crate::error::RequestError;
use crate::request::RequestDescriptor;
use crate::response::RawResponse;

/// Hook run around every request hop, including each redirect hop.
pub trait Interceptor: Send + Sync {
    fn intercept(
        &self,
        target: InvocationTarget<'_>,
        request: &RequestDescriptor,
    ) -> Result<RawResponse, RequestError>;
}

pub(crate) type Exchange<'a> = dyn Fn(&RequestDescriptor) -> Result<RawResponse, RequestError> + 'a;

/// The rest of the chain as seen from one interceptor.
#[derive(Clone, Copy)]
pub struct InvocationTarget<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    exchange: &'a Exchange<'a>,
}

impl<'a> InvocationTarget<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Interceptor>], exchange: &'a Exchange<'a>) -> Self {
        InvocationTarget { chain, exchange }
    }

    /// Hand `request` to the next interceptor, or to the network when none
    /// is left.
    pub fn proceed(&self, request: &RequestDescriptor) -> Result<RawResponse, RequestError> {
        match self.chain.split_first() {
            Some((next, rest)) => next.intercept(
                InvocationTarget {
                    chain: rest,
                    exchange: self.exchange,
                },
                request,
            ),
            None => (self.exchange)(request),
        }
    }

    /// Interceptors still to run after the current one.
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}

/// Adapter that turns a closure into an `Interceptor`.
pub struct FnInterceptor<F>(F);

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(InvocationTarget<'_>, &RequestDescriptor) -> Result<RawResponse, RequestError> + Send + Sync,
{
    fn intercept(
        &self,
        target: InvocationTarget<'_>,
        request: &RequestDescriptor,
    ) -> Result<RawResponse, RequestError> {
        (self.0)(target, request)
    }
}

pub fn from_fn<F>(f: F) -> FnInterceptor<F>
where
    F: Fn(InvocationTarget<'_>, &RequestDescriptor) -> Result<RawResponse, RequestError> + Send + Sync,
{
    FnInterceptor(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, HttpMethod};
    use std::sync::Mutex;
    use url::Url;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Interceptor for Recorder {
        fn intercept(
            &self,
            target: InvocationTarget<'_>,
            request: &RequestDescriptor,
        ) -> Result<RawResponse, RequestError> {
            self.log.lock().unwrap().push(format!("{}-before", self.name));
            let response = target.proceed(request);
            self.log.lock().unwrap().push(format!("{}-after", self.name));
            response
        }
    }

    fn request() -> RequestDescriptor {
        RequestDescriptor::builder(HttpMethod::Get, "http://h/").build().unwrap()
    }

    fn ok(request: &RequestDescriptor) -> RawResponse {
        RawResponse::synthetic(request.url().clone(), 200, Headers::new(), "net")
    }

    #[test]
    fn runs_in_order_around_exchange() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recorder { name: "A", log: log.clone() }),
            Arc::new(Recorder { name: "B", log: log.clone() }),
        ];
        let exchange_log = log.clone();
        let exchange = move |req: &RequestDescriptor| -> Result<RawResponse, RequestError> {
            exchange_log.lock().unwrap().push("network".to_string());
            Ok(ok(req))
        };
        let target = InvocationTarget::new(&chain, &exchange);
        target.proceed(&request()).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["A-before", "B-before", "network", "B-after", "A-after"]
        );
    }

    #[test]
    fn short_circuit_skips_network() {
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(from_fn(|_, req: &RequestDescriptor| {
            Ok(RawResponse::synthetic(req.url().clone(), 203, Headers::new(), "cached"))
        }))];
        let exchange = |_: &RequestDescriptor| -> Result<RawResponse, RequestError> {
            panic!("network must not be reached")
        };
        let mut response = InvocationTarget::new(&chain, &exchange).proceed(&request()).unwrap();
        assert_eq!(response.status(), 203);
        assert_eq!(response.read_to_text().unwrap(), "cached");
    }

    #[test]
    fn abort_propagates_unchanged() {
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(from_fn(|_, req: &RequestDescriptor| {
            Err(RequestError::interceptor_aborted(req.url().as_str(), "blocked"))
        }))];
        let exchange = |req: &RequestDescriptor| -> Result<RawResponse, RequestError> { Ok(ok(req)) };
        let err = InvocationTarget::new(&chain, &exchange).proceed(&request()).unwrap_err();
        assert!(matches!(err, RequestError::InterceptorAborted { ref reason, .. } if reason == "blocked"));
    }

    #[test]
    fn interceptor_may_retry() {
        let calls = Arc::new(Mutex::new(0));
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(from_fn(|target, req: &RequestDescriptor| {
            let first = target.proceed(req)?;
            if first.status() == 503 {
                return target.proceed(req);
            }
            Ok(first)
        }))];
        let counter = calls.clone();
        let exchange = move |req: &RequestDescriptor| -> Result<RawResponse, RequestError> {
            let mut n = counter.lock().unwrap();
            *n += 1;
            let status = if *n == 1 { 503 } else { 200 };
            Ok(RawResponse::synthetic(req.url().clone(), status, Headers::new(), ""))
        };
        let response = InvocationTarget::new(&chain, &exchange).proceed(&request()).unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn request_rewrite_reaches_network() {
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(from_fn(|target, req: &RequestDescriptor| {
            target.proceed(&req.with_header("X-Trace", "1"))
        }))];
        let exchange = |req: &RequestDescriptor| -> Result<RawResponse, RequestError> {
            let seen = req.headers().get("x-trace").unwrap_or("missing").to_string();
            Ok(RawResponse::synthetic(Url::parse("http://h/").unwrap(), 200, Headers::new(), seen))
        };
        let mut response = InvocationTarget::new(&chain, &exchange).proceed(&request()).unwrap();
        assert_eq!(response.read_to_text().unwrap(), "1");
    }
}
