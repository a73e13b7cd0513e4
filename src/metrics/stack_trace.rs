use std::{ffi::c_void, fmt::Write};

use allocator_api2::{
    alloc::{Allocator, Global},
    vec::Vec,
};

use crate::{metrics::text::MetricsString, util::num::format_decimal};

/// A captured call stack. Capturing only records instruction pointers;
/// symbols are resolved the first time [`StackTrace::output()`] is asked for.
pub struct StackTrace<A: Allocator + Clone = Global> {
    frames: Vec<usize, A>,
    delimiter: &'static str,
    annotation: Option<MetricsString<A>>,
    hash_key: Option<MetricsString<A>>,
    output: Option<MetricsString<A>>,
}

impl StackTrace<Global> {
    pub fn capture(start_frame: usize, number_of_frames: usize, delimiter: &'static str) -> Self {
        Self::capture_in(start_frame, number_of_frames, delimiter, Global)
    }
}

impl<A: Allocator + Clone> StackTrace<A> {
    /// Record up to `number_of_frames` frames, skipping the innermost
    /// `start_frame` (this function among them).
    pub fn capture_in(
        start_frame: usize,
        number_of_frames: usize,
        delimiter: &'static str,
        alloc: A,
    ) -> Self {
        let mut frames = Vec::with_capacity_in(number_of_frames, alloc);
        let mut skipped = 0;
        if number_of_frames > 0 {
            backtrace::trace(|frame| {
                if skipped < start_frame {
                    skipped += 1;
                    return true;
                }
                frames.push(frame.ip() as usize);
                frames.len() < number_of_frames
            });
        }
        Self {
            frames,
            delimiter,
            annotation: None,
            hash_key: None,
            output: None,
        }
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn annotation(&self) -> Option<&str> {
        self.annotation.as_deref()
    }

    pub fn set_annotation(&mut self, annotation: &str) {
        let alloc = self.frames.allocator().clone();
        self.annotation = Some(MetricsString::from_str_in(annotation, alloc));
        self.hash_key = None;
        self.output = None;
    }

    /// Identifies the call site: every frame address in decimal, then the
    /// annotation. Two traces with the same key came from the same place.
    pub fn hash_key(&mut self) -> &str {
        if self.hash_key.is_none() {
            let mut key = MetricsString::new_in(self.frames.allocator().clone());
            let mut buf = [0; 20];
            for &frame in self.frames.iter() {
                // SAFETY: Nothing but ASCII digits
                key.push_str(unsafe { std::str::from_utf8_unchecked(format_decimal(frame, &mut buf)) });
            }
            if let Some(annotation) = &self.annotation {
                key.push_str(annotation);
            }
            self.hash_key = Some(key);
        }
        self.hash_key.as_deref().unwrap_or_default()
    }

    /// `"<annotation>: "` (if any), then every symbol followed by the
    /// delimiter
    pub fn output(&mut self) -> &str {
        if self.output.is_none() {
            let mut output = MetricsString::new_in(self.frames.allocator().clone());
            if let Some(annotation) = &self.annotation {
                _ = write!(output, "{annotation}: ");
            }
            for &frame in self.frames.iter() {
                let mut resolved = false;
                backtrace::resolve(frame as *mut c_void, |symbol| {
                    if resolved {
                        return;
                    }
                    if let Some(name) = symbol.name() {
                        _ = write!(output, "{name:#}");
                        resolved = true;
                    }
                });
                if !resolved {
                    _ = write!(output, "{frame:#x}");
                }
                output.push_str(self.delimiter);
            }
            self.output = Some(output);
        }
        self.output.as_deref().unwrap_or_default()
    }
}
