//! Sampling policies for root spans.
//!
//! Sampling controls the volume of telemetry shipped to the collector. The
//! decision is made once, when a root span is created, and is then carried
//! to every descendant through the `sampled` flag of the propagated
//! [`SpanContext`], so a trace is either exported whole or not at all.
//! Spans started with a parent always inherit the parent's decision and the
//! sampler is not consulted.
//!
//! [`SpanContext`]: crate::SpanContext

use crate::trace_context::TraceId;
use std::fmt;

/// The decision produced by a [`ShouldSample`] implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingDecision {
    /// The span will be created but not exported.
    Drop,
    /// The span is recorded and exported.
    RecordAndSample,
}

/// The interface for deciding whether a new root span is sampled.
///
/// Built-in policies are provided by [`Sampler`]; implement this trait for
/// custom policies.
pub trait ShouldSample: CloneShouldSample + Send + Sync + fmt::Debug {
    /// Returns the sampling decision for a root span about to be created.
    fn should_sample(&self, trace_id: TraceId, name: &str) -> SamplingDecision;
}

/// This trait should not be used directly, instead users should use [`ShouldSample`].
pub trait CloneShouldSample {
    /// Clone into a new boxed trait object.
    fn box_clone(&self) -> Box<dyn ShouldSample>;
}

impl<T> CloneShouldSample for T
where
    T: ShouldSample + Clone + 'static,
{
    fn box_clone(&self) -> Box<dyn ShouldSample> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn ShouldSample> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Built-in sampling policies.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Sampler {
    /// Always sample the trace
    AlwaysOn,
    /// Never sample the trace
    AlwaysOff,
    /// Sample a given fraction of traces. Fractions >= 1 will always sample.
    /// Fractions < 0 are treated as zero. The decision is a pure function of
    /// the trace id, so independent processes agree on it.
    TraceIdRatioBased(f64),
}

impl ShouldSample for Sampler {
    fn should_sample(&self, trace_id: TraceId, _name: &str) -> SamplingDecision {
        let sampled = match self {
            Sampler::AlwaysOn => true,
            Sampler::AlwaysOff => false,
            Sampler::TraceIdRatioBased(prob) => sample_based_on_probability(prob, trace_id),
        };

        if sampled {
            SamplingDecision::RecordAndSample
        } else {
            SamplingDecision::Drop
        }
    }
}

pub(crate) fn sample_based_on_probability(prob: &f64, trace_id: TraceId) -> bool {
    if *prob >= 1f64 {
        true
    } else {
        let prob_upper_bound = (prob.max(0.0) * (1u64 << 63) as f64) as u64;
        // The trace id is already a random number, so the lower 64 bits
        // (minus the sign bit) serve as the sample.
        let bytes = trace_id.to_bytes();
        let (_, low) = bytes.split_at(8);
        let trace_id_low = u64::from_be_bytes(low.try_into().unwrap());
        let rnd_from_trace_id = trace_id_low >> 1;

        rnd_from_trace_id < prob_upper_bound
    }
}
