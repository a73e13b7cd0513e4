use std::{cell::RefCell, cmp::Ordering, fmt};

use allocator_api2::{
    alloc::{Allocator, Global},
    vec::Vec,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::Config,
    metrics::{stack_trace::StackTrace, table::MetricsTable, text::MetricsString},
    util::num::format_decimal,
};

/// Writes an annotation for the sample being taken, returning `false` if
/// there's nothing to say
pub type AnnotationHandler = Box<dyn FnMut(&mut dyn fmt::Write) -> bool>;

thread_local! {
    static ANNOTATION_HANDLER: RefCell<Option<AnnotationHandler>> = const { RefCell::new(None) };
}

/// Install (or with `None`, remove) the calling thread's annotation handler,
/// returning the previous one
pub fn set_annotation_handler(handler: Option<AnnotationHandler>) -> Option<AnnotationHandler> {
    ANNOTATION_HANDLER
        .try_with(|slot| slot.replace(handler))
        .ok()
        .flatten()
}

pub const SAMPLE_NAME_SIZE: usize = 64;

pub struct StackTraceSample<A: Allocator + Clone = Global> {
    pub name: MetricsString<A>,
    pub number_of_hits: usize,
    pub stack_trace: StackTrace<A>,
}

/// Most hits first, then by name
fn by_hits<A: Allocator + Clone>(a: &StackTraceSample<A>, b: &StackTraceSample<A>) -> Ordering {
    b.number_of_hits
        .cmp(&a.number_of_hits)
        .then_with(|| a.name.as_str().cmp(b.name.as_str()))
}

/// Records where instances were created, for a random subset of them.
/// Identical call stacks share one sample and count hits.
pub struct StackTraceSampler<A: Allocator + Clone = Global> {
    traces: MetricsTable<StackTraceSample<A>, A>,
    /// instance address -> trace hash key
    instances: MetricsTable<MetricsString<A>, A>,
    rng: StdRng,
    sample_interval: u32,
    annotation_size: usize,
}

impl StackTraceSampler<Global> {
    pub fn new(config: &Config) -> Self {
        Self::new_in(config, Global)
    }
}

fn instance_key(instance: usize, buf: &mut [u8; 20]) -> &str {
    // SAFETY: Nothing but ASCII digits
    unsafe { std::str::from_utf8_unchecked(format_decimal(instance, buf)) }
}

impl<A: Allocator + Clone> StackTraceSampler<A> {
    pub fn new_in(config: &Config, alloc: A) -> Self {
        Self {
            traces: MetricsTable::new_in(alloc.clone()),
            instances: MetricsTable::new_in(alloc),
            rng: StdRng::seed_from_u64(0xbadc0de ^ u64::from(std::process::id())),
            sample_interval: config.stack_trace_sample_interval.max(1),
            annotation_size: config.stack_trace_annotation_size,
        }
    }

    fn annotate(&self, stack_trace: &mut StackTrace<A>) {
        if self.annotation_size == 0 {
            return;
        }
        let mut annotation = MetricsString::new_in(self.traces.allocator().clone());
        let annotated = ANNOTATION_HANDLER
            .try_with(|slot| match slot.try_borrow_mut() {
                Ok(mut handler) => handler.as_mut().is_some_and(|handler| handler(&mut annotation)),
                Err(_) => false,
            })
            .unwrap_or(false);
        if annotated {
            annotation.truncate(self.annotation_size - 1);
            stack_trace.set_annotation(&annotation);
        }
    }

    /// With probability `1 / stack_trace_sample_interval`, record the
    /// caller's stack as where `instance` came from
    pub fn take_sample(&mut self, name: &str, instance: usize) {
        if self.rng.gen_range(0..self.sample_interval) != 0 {
            return;
        }
        self.remove_sample(instance);

        let alloc = self.traces.allocator().clone();
        let mut stack_trace = StackTrace::capture_in(4, 5, " -> ", alloc.clone());
        self.annotate(&mut stack_trace);
        let key = MetricsString::from_str_in(stack_trace.hash_key(), alloc.clone());

        let sample = self.traces.get_or_insert_with(&key, || {
            let mut sample_name = MetricsString::from_str_in(name, alloc);
            sample_name.truncate(SAMPLE_NAME_SIZE - 1);
            StackTraceSample {
                name: sample_name,
                number_of_hits: 0,
                stack_trace,
            }
        });
        sample.number_of_hits += 1;

        let mut buf = [0; 20];
        self.instances.set(instance_key(instance, &mut buf), key);
    }

    /// Forget `instance`, dropping its sample once nothing else hits it
    pub fn remove_sample(&mut self, instance: usize) {
        let mut buf = [0; 20];
        let Some(key) = self.instances.remove(instance_key(instance, &mut buf)) else {
            return;
        };
        let Some(sample) = self.traces.get_mut(&key) else {
            return;
        };
        sample.number_of_hits -= 1;
        if sample.number_of_hits == 0 {
            self.traces.remove(&key);
        }
    }

    pub fn clear(&mut self) {
        self.traces.clear();
        self.instances.clear();
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Samples, most hit first
    pub fn iter(&self) -> Vec<&StackTraceSample<A>, A> {
        let mut samples = Vec::with_capacity_in(self.traces.len(), self.traces.allocator().clone());
        samples.extend(self.traces.iter().map(|(_, sample)| sample));
        samples.sort_by(|a, b| by_hits(a, b));
        samples
    }

    /// Like [`StackTraceSampler::iter()`], but mutable so stack traces can be
    /// rendered
    pub fn iter_mut(&mut self) -> Vec<&mut StackTraceSample<A>, A> {
        let mut samples = Vec::with_capacity_in(self.traces.len(), self.traces.allocator().clone());
        samples.extend(self.traces.iter_mut().map(|(_, sample)| sample));
        samples.sort_by(|a, b| by_hits(a, b));
        samples
    }
}
