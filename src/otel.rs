// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in message headers: it is injected on publish and
//! extracted on delivery, where a consumer span is opened for the message.

use crate::message::MessageProperties;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into the message headers.
pub(crate) fn inject_context(ctx: &Context, props: &mut MessageProperties) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            ctx,
            &mut HeaderInjector {
                headers: &mut props.headers,
            },
        )
    });
}

/// Creates a consumer span for a delivery, parented on the context carried
/// in its headers.
pub(crate) fn new_span(
    props: &MessageProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor {
            headers: &props.headers,
        })
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractor_reads_string_headers() {
        let props = MessageProperties::default().with_header("traceparent", "00-abc-def-01");
        let extractor = HeaderExtractor {
            headers: &props.headers,
        };

        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.keys(), vec!["traceparent"]);
        assert_eq!(extractor.get("missing"), None);
    }

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        HeaderInjector {
            headers: &mut headers,
        }
        .set("TraceParent", "value".to_owned());

        assert_eq!(headers.get("traceparent").map(String::as_str), Some("value"));
    }
}
