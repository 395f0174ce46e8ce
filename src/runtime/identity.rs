//! Service identity headers.

use http::{HeaderName, HeaderValue};

use crate::rpc::{stream_fn, unary_fn, CallContext, InterceptorSet, StreamNext, UnaryNext};

pub const SERVICE_NAME_HEADER: HeaderName = HeaderName::from_static("grpc-service-name");
pub const SERVICE_VERSION_HEADER: HeaderName = HeaderName::from_static("grpc-service-version");

type Stamp = Vec<(HeaderName, HeaderValue)>;

/// Server interceptors stamping `name` and `version` on every response.
pub fn interceptors(name: &str, version: &str) -> InterceptorSet {
    let headers: Stamp = [(SERVICE_NAME_HEADER, name), (SERVICE_VERSION_HEADER, version)]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .filter_map(|(header, value)| HeaderValue::from_str(value).ok().map(|v| (header, v)))
        .collect();

    let unary_headers = headers.clone();
    let stream_headers = headers;
    InterceptorSet::default()
        .with_unary_server(unary_fn(move |ctx: CallContext, request, next: UnaryNext| {
            stamp(&ctx, &unary_headers);
            next.run(ctx, request)
        }))
        .with_stream_server(stream_fn(move |ctx: CallContext, input, next: StreamNext| {
            stamp(&ctx, &stream_headers);
            next.run(ctx, input)
        }))
}

fn stamp(ctx: &CallContext, headers: &Stamp) {
    for (name, value) in headers {
        ctx.set_response_header(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Interceptors;

    #[test]
    fn only_server_slots_are_filled() {
        let set = interceptors("echo", "");
        assert!(set.unary_server().is_some());
        assert!(set.stream_server().is_some());
        assert!(set.unary_client().is_none());
        assert!(set.stream_client().is_none());
    }
}
