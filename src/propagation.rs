//! # Trace Context Propagation
//!
//! Serializes a [`SpanContext`] into a single request header so a
//! downstream process can continue the same trace, and parses it back on
//! the receiving side. The header value is ASCII in the fixed form
//!
//! `{version}-{trace_id}-{span_id}-{flags}`
//!
//! e.g. `00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`, where the
//! ids are fixed-width lowercase hex and the least significant bit of the
//! flags is the sampled flag. This is the one bit-exact wire contract of
//! the crate: two independent implementations interoperate exactly when
//! they agree on this format.
//!
//! Extraction never fails the caller's request. A missing, malformed or
//! unknown-version header decodes to `None` and the receiver simply starts
//! a new root trace.

use crate::trace_context::{SpanContext, SpanId, TraceFlags, TraceId};
use std::collections::HashMap;

const SUPPORTED_VERSION: u8 = 0;
/// The header carrying the serialized span context.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Injector provides an interface for adding fields into an outgoing
/// carrier, such as a map of HTTP request headers.
pub trait Injector {
    /// Add a key and value to the carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Extractor provides an interface for reading fields from an incoming
/// carrier.
pub trait Extractor {
    /// Get a value for a key from the carrier.
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the HashMap.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the HashMap.
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(|v| v.as_str())
    }
}

/// Propagates [`SpanContext`]s in the `traceparent` header format.
#[derive(Clone, Debug, Default)]
pub struct TraceContextPropagator {
    _private: (),
}

impl TraceContextPropagator {
    /// Create a new `TraceContextPropagator`.
    pub fn new() -> Self {
        TraceContextPropagator { _private: () }
    }

    /// Encodes the `SpanContext` into the carrier. Invalid contexts are not
    /// injected.
    pub fn inject(&self, span_context: &SpanContext, injector: &mut dyn Injector) {
        if span_context.is_valid() {
            let header_value = format!(
                "{:02x}-{:032x}-{:016x}-{:02x}",
                SUPPORTED_VERSION,
                span_context.trace_id(),
                span_context.span_id(),
                span_context.trace_flags() & TraceFlags::SAMPLED
            );
            injector.set(TRACEPARENT_HEADER, header_value);
        }
    }

    /// Decodes a `SpanContext` from the carrier.
    ///
    /// Returns `None` when the header is absent or malformed in any way;
    /// decode problems are deliberately indistinguishable from "no parent"
    /// so that propagation can never abort the caller's request. A decoded
    /// context is marked remote and keeps only the sampled flag.
    pub fn extract(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let header_value = extractor.get(TRACEPARENT_HEADER)?.trim();
        let parts = header_value.split_terminator('-').collect::<Vec<&str>>();
        if parts.len() != 4 {
            return None;
        }

        // Only the version this crate writes is accepted; unknown versions
        // decode as "no parent" rather than failing the request.
        if parts[0].len() != 2 {
            return None;
        }
        let version = u8::from_str_radix(parts[0], 16).ok()?;
        if version != SUPPORTED_VERSION {
            return None;
        }

        // Field widths are fixed and hex must be lowercase.
        if parts[1].len() != 32 || parts[2].len() != 16 || parts[3].len() != 2 {
            return None;
        }
        if parts
            .iter()
            .any(|part| part.chars().any(|c| c.is_ascii_uppercase()))
        {
            return None;
        }

        let trace_id = TraceId::from_hex(parts[1]).ok()?;
        let span_id = SpanId::from_hex(parts[2]).ok()?;

        let opts = u8::from_str_radix(parts[3], 16).ok()?;
        // Version 0 defines only the sampled bit.
        if opts > 2 {
            return None;
        }
        let trace_flags = TraceFlags::new(opts) & TraceFlags::SAMPLED;

        let span_context = SpanContext::new(trace_id, span_id, trace_flags, true);
        if span_context.is_valid() {
            Some(span_context)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    fn extract_data() -> Vec<(&'static str, SpanContext)> {
        vec![
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736), SpanId::from(0x00f0_67aa_0ba9_02b7), TraceFlags::default(), true)),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736), SpanId::from(0x00f0_67aa_0ba9_02b7), TraceFlags::SAMPLED, true)),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-02", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736), SpanId::from(0x00f0_67aa_0ba9_02b7), TraceFlags::default(), true)),
            (" 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01 ", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736), SpanId::from(0x00f0_67aa_0ba9_02b7), TraceFlags::SAMPLED, true)),
        ]
    }

    #[rustfmt::skip]
    fn extract_data_invalid() -> Vec<(&'static str, &'static str)> {
        vec![
            ("0000-00000000000000000000000000000000-0000000000000000-01", "wrong version length"),
            ("00-ab00000000000000000000000000000000-cd00000000000000-01", "wrong trace ID length"),
            ("00-ab000000000000000000000000000000-cd0000000000000000-01", "wrong span ID length"),
            ("00-ab000000000000000000000000000000-cd00000000000000-0100", "wrong trace flag length"),
            ("qw-00000000000000000000000000000000-0000000000000000-01",   "bogus version"),
            ("00-qw000000000000000000000000000000-cd00000000000000-01",   "bogus trace ID"),
            ("00-ab000000000000000000000000000000-qw00000000000000-01",   "bogus span ID"),
            ("00-ab000000000000000000000000000000-cd00000000000000-qw",   "bogus trace flag"),
            ("A0-00000000000000000000000000000000-0000000000000000-01",   "upper case version"),
            ("00-AB000000000000000000000000000000-cd00000000000000-01",   "upper case trace ID"),
            ("00-ab000000000000000000000000000000-CD00000000000000-01",   "upper case span ID"),
            ("00-ab000000000000000000000000000000-cd00000000000000-A1",   "upper case trace flag"),
            ("00-00000000000000000000000000000000-0000000000000000-01",   "zero trace ID and span ID"),
            ("00-ab000000000000000000000000000000-cd00000000000000-09",   "trace-flag unused bits set"),
            ("01-ab000000000000000000000000000000-cd00000000000000-01",   "unknown version"),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",      "missing options"),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-",     "empty options"),
            ("",                                                          "empty header"),
            ("garbage",                                                   "not a traceparent at all"),
            ("00--00",                                                    "missing ids"),
        ]
    }

    #[test]
    fn extract_traceparent() {
        let propagator = TraceContextPropagator::new();

        for (trace_parent, expected_context) in extract_data() {
            let mut extractor = HashMap::new();
            extractor.insert(TRACEPARENT_HEADER.to_string(), trace_parent.to_string());

            assert_eq!(propagator.extract(&extractor), Some(expected_context));
        }
    }

    #[test]
    fn extract_traceparent_reject_invalid() {
        let propagator = TraceContextPropagator::new();

        for (invalid_header, reason) in extract_data_invalid() {
            let mut extractor = HashMap::new();
            extractor.insert(TRACEPARENT_HEADER.to_string(), invalid_header.to_string());

            assert_eq!(propagator.extract(&extractor), None, "{reason}");
        }
    }

    #[test]
    fn extract_without_header_is_no_parent() {
        let propagator = TraceContextPropagator::new();
        let extractor: HashMap<String, String> = HashMap::new();
        assert_eq!(propagator.extract(&extractor), None);
    }

    #[test]
    fn inject_traceparent() {
        let propagator = TraceContextPropagator::new();
        let test_cases = vec![
            (
                SpanContext::new(
                    TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736),
                    SpanId::from(0x00f0_67aa_0ba9_02b7),
                    TraceFlags::SAMPLED,
                    false,
                ),
                Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            ),
            (
                SpanContext::new(
                    TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736),
                    SpanId::from(0x00f0_67aa_0ba9_02b7),
                    TraceFlags::default(),
                    false,
                ),
                Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00"),
            ),
            (
                // flags other than sampled are not propagated
                SpanContext::new(
                    TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736),
                    SpanId::from(0x00f0_67aa_0ba9_02b7),
                    TraceFlags::new(0xff),
                    false,
                ),
                Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            ),
            (SpanContext::empty_context(), None),
        ];

        for (context, expected) in test_cases {
            let mut injector: HashMap<String, String> = HashMap::new();
            propagator.inject(&context, &mut injector);
            assert_eq!(
                Extractor::get(&injector, TRACEPARENT_HEADER),
                expected
            );
        }
    }

    #[test]
    fn inject_extract_round_trip() {
        let propagator = TraceContextPropagator::new();
        for sampled in [true, false] {
            let context = SpanContext::new(
                TraceId::from(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10),
                SpanId::from(0x1122_3344_5566_7788),
                TraceFlags::default().with_sampled(sampled),
                false,
            );

            let mut carrier: HashMap<String, String> = HashMap::new();
            propagator.inject(&context, &mut carrier);
            let extracted = propagator.extract(&carrier).expect("round trip failed");

            assert_eq!(extracted.trace_id(), context.trace_id());
            assert_eq!(extracted.span_id(), context.span_id());
            assert_eq!(extracted.is_sampled(), sampled);
            assert!(extracted.is_remote());
        }
    }
}
