//! Tracer configuration.

use crate::id_generator::{IdGenerator, RandomIdGenerator};
use crate::sampler::{Sampler, ShouldSample};
use std::borrow::Cow;

/// Default service name attached to exported spans when none is configured.
pub const DEFAULT_SERVICE_NAME: &str = "unknown_service";

/// Tracer configuration: the service identity plus the policies consulted
/// when spans are created.
#[derive(Debug)]
pub struct Config {
    /// Service name reported with every exported span.
    pub service_name: Cow<'static, str>,

    /// The sampler that the tracer should use.
    pub sampler: Box<dyn ShouldSample>,

    /// The id generator that the tracer should use.
    pub id_generator: Box<dyn IdGenerator>,
}

impl Config {
    /// Specify the service name of the tracer.
    pub fn with_service_name(mut self, service_name: impl Into<Cow<'static, str>>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Specify the sampler to be used.
    pub fn with_sampler<T: ShouldSample + 'static>(mut self, sampler: T) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Specify the id generator to be used.
    pub fn with_id_generator<T: IdGenerator + 'static>(mut self, id_generator: T) -> Self {
        self.id_generator = Box::new(id_generator);
        self
    }
}

impl Default for Config {
    /// Create default global sdk configuration.
    fn default() -> Self {
        Config {
            service_name: Cow::Borrowed(DEFAULT_SERVICE_NAME),
            sampler: Box::new(Sampler::AlwaysOn),
            id_generator: Box::<RandomIdGenerator>::default(),
        }
    }
}
