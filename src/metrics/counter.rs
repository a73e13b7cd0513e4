use std::cmp::Ordering;

use allocator_api2::{
    alloc::{Allocator, Global},
    vec::Vec,
};

use crate::{
    config::{list_tokens, Config},
    metrics::{table::MetricsTable, text::MetricsString, Generation},
};

pub const COMMENT_SIZE: usize = 64;

/// Per-name population numbers for one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceMetrics {
    comment: [u8; COMMENT_SIZE],
    comment_len: u8,
    pub instance_count: usize,
    pub instance_change: i64,
    pub instance_watermark: usize,
    pub average_instance_change: i64,
    pub number_of_samples: u64,
    pub total_memory_usage: usize,
}

impl Default for InstanceMetrics {
    fn default() -> Self {
        Self {
            comment: [0; COMMENT_SIZE],
            comment_len: 0,
            instance_count: 0,
            instance_change: 0,
            instance_watermark: 0,
            average_instance_change: 0,
            number_of_samples: 0,
            total_memory_usage: 0,
        }
    }
}

impl InstanceMetrics {
    pub fn comment(&self) -> Option<&str> {
        let comment = std::str::from_utf8(&self.comment[..self.comment_len as usize]).ok()?;
        (!comment.is_empty()).then_some(comment)
    }

    fn set_comment(&mut self, comment: &str) {
        let mut len = comment.len().min(COMMENT_SIZE - 1);
        while !comment.is_char_boundary(len) {
            len -= 1;
        }
        self.comment[..len].copy_from_slice(&comment.as_bytes()[..len]);
        self.comment_len = len as u8;
    }
}

/// Biggest average growth first, then biggest usage, then most instances
fn by_trend(a: &InstanceMetrics, b: &InstanceMetrics) -> Ordering {
    b.average_instance_change
        .cmp(&a.average_instance_change)
        .then(b.total_memory_usage.cmp(&a.total_memory_usage))
        .then(b.instance_count.cmp(&a.instance_count))
}

/// Counts instances per name across two alternating generations, to tell
/// which populations keep growing.
///
/// Each collection goes `start_record()`, any number of `add_instances()`,
/// then `end_record()`.
pub struct InstanceCounter<A: Allocator + Clone = Global> {
    tables: [MetricsTable<InstanceMetrics, A>; 2],
    current: usize,
    last: Option<usize>,
    recording: bool,
    generation: Generation,
    generations_to_settle: u64,
    average_window: u64,
    number_of_interesting_instances: usize,
    include_list: MetricsString<A>,
    ignore_list: MetricsString<A>,
}

impl InstanceCounter<Global> {
    pub fn new(config: &Config, generation: Generation) -> Self {
        Self::new_in(config, generation, Global)
    }
}

impl<A: Allocator + Clone> InstanceCounter<A> {
    pub fn new_in(config: &Config, generation: Generation, alloc: A) -> Self {
        Self {
            tables: [
                MetricsTable::new_in(alloc.clone()),
                MetricsTable::new_in(alloc.clone()),
            ],
            current: 0,
            last: None,
            recording: false,
            generation,
            generations_to_settle: config.generations_to_settle,
            average_window: config.generations_to_reset_average_window.max(1),
            number_of_interesting_instances: config.number_of_interesting_instances,
            include_list: MetricsString::from_str_in(&config.collection_include_list, alloc.clone()),
            ignore_list: MetricsString::from_str_in(&config.collection_ignore_list, alloc),
        }
    }

    /// Switch to the other table, emptied
    pub fn start_record(&mut self) {
        self.current = self.last.map_or(0, |last| (last + 1) % self.tables.len());
        self.tables[self.current].clear();
        self.recording = true;
    }

    fn last_table(&self) -> Option<&MetricsTable<InstanceMetrics, A>> {
        self.last.map(|last| &self.tables[last])
    }

    /// Count `number_of_instances` more of `name`, using `total_usage` bytes
    pub fn add_instances(
        &mut self,
        name: &str,
        comment: Option<&str>,
        number_of_instances: usize,
        total_usage: usize,
    ) {
        if !self.recording {
            self.start_record();
        }
        let old = self.last_table().and_then(|table| table.get(name)).copied().unwrap_or_default();
        let generation = self.generation.get();
        let settled = generation > self.generations_to_settle;
        let window = self.average_window;

        let metrics = self.tables[self.current].get_or_insert_with(name, || {
            let mut metrics = InstanceMetrics::default();
            if let Some(comment) = comment {
                metrics.set_comment(comment);
            }
            metrics
        });
        metrics.instance_count += number_of_instances;
        metrics.instance_change = metrics.instance_count as i64 - old.instance_count as i64;

        if settled && metrics.instance_change != 0 {
            if old.number_of_samples != 0 {
                let samples = old.number_of_samples.min(window) as i64;
                let average = old.average_instance_change;
                metrics.average_instance_change =
                    (average * samples + (metrics.instance_change - average)) / samples;
                metrics.number_of_samples = old.number_of_samples + 1;
            } else {
                metrics.average_instance_change = metrics.instance_change;
                metrics.number_of_samples = 1;
            }
        } else {
            metrics.average_instance_change = old.average_instance_change;
            metrics.number_of_samples = old.number_of_samples;
        }

        metrics.instance_watermark = metrics
            .instance_watermark
            .max(metrics.instance_count)
            .max(old.instance_watermark);
        metrics.total_memory_usage += total_usage;
    }

    pub fn add_instance(&mut self, name: &str, memory_usage: usize) {
        self.add_instances(name, None, 1, memory_usage);
    }

    /// Names that were counted last time but not this time are recorded as
    /// having dropped to zero. This generation then becomes the one
    /// [`InstanceCounter::iter()`] reports on.
    pub fn end_record(&mut self) {
        if !self.recording {
            return;
        }
        if let Some(last) = self.last.filter(|&last| last != self.current) {
            let [a, b] = &mut self.tables;
            let (old, new) = if last == 0 { (a, b) } else { (b, a) };
            for (name, old_metrics) in old.iter() {
                if !new.contains(name) {
                    let gone = InstanceMetrics {
                        instance_change: -(old_metrics.instance_count as i64),
                        ..InstanceMetrics::default()
                    };
                    new.set(name, gone);
                }
            }
            old.clear();
        }
        self.last = Some(self.current);
        self.recording = false;
    }

    /// The last finished generation, most interesting first. Names that
    /// didn't change are left out.
    pub fn iter(&self) -> Vec<(&str, &InstanceMetrics), A> {
        let alloc = self.include_list.allocator().clone();
        let Some(table) = self.last_table() else {
            return Vec::new_in(alloc);
        };
        let mut entries = Vec::with_capacity_in(table.len(), alloc);
        entries.extend(table.iter().filter(|(_, metrics)| metrics.instance_change != 0));
        entries.sort_by(|(_, a), (_, b)| by_trend(a, b));
        entries
    }

    /// Whether `name` deserves a closer look: it matches the include list,
    /// or it is one of the top growers and not on the ignore list
    pub fn is_interesting(&self, name: &str) -> bool {
        if list_tokens(&self.include_list).any(|token| name.contains(token)) {
            return true;
        }
        if list_tokens(&self.ignore_list).any(|token| name.contains(token)) {
            return false;
        }
        self.iter()
            .iter()
            .take(self.number_of_interesting_instances)
            .any(|(instance, metrics)| *instance == name && metrics.average_instance_change > 0)
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(settle: u64) -> InstanceCounter {
        let config = Config::default()
            .with_generations_to_settle(settle)
            .with_average_window(4)
            .with_interesting_instances(2)
            .with_instance_lists("Always", "Never");
        InstanceCounter::new(&config, Generation::new())
    }

    fn record(counter: &mut InstanceCounter, counts: &[(&str, usize)]) {
        counter.start_record();
        for &(name, n) in counts {
            counter.add_instances(name, Some("comment"), n, n * 16);
        }
        counter.end_record();
        counter.generation().advance();
    }

    #[test]
    fn changes_are_relative_to_the_previous_generation() {
        let mut counter = counter(0);
        record(&mut counter, &[("Widget", 3)]);
        record(&mut counter, &[("Widget", 5)]);
        let entries = counter.iter();
        let (name, metrics) = entries[0];
        assert_eq!(name, "Widget");
        assert_eq!(metrics.instance_count, 5);
        assert_eq!(metrics.instance_change, 2);
        assert_eq!(metrics.instance_watermark, 5);
        assert_eq!(metrics.comment(), Some("comment"));
    }

    #[test]
    fn averages_wait_for_the_settling_period() {
        let mut counter = counter(1);
        // generation 0 and 1 are still settling
        record(&mut counter, &[("Widget", 2)]);
        record(&mut counter, &[("Widget", 4)]);
        assert_eq!(counter.iter()[0].1.number_of_samples, 0);

        record(&mut counter, &[("Widget", 10)]);
        let metrics = *counter.iter()[0].1;
        assert_eq!(metrics.instance_change, 6);
        assert_eq!(metrics.average_instance_change, 6);
        assert_eq!(metrics.number_of_samples, 1);

        record(&mut counter, &[("Widget", 12)]);
        let metrics = *counter.iter()[0].1;
        // (6 * 1 + (2 - 6)) / 1
        assert_eq!(metrics.average_instance_change, 2);
        assert_eq!(metrics.number_of_samples, 2);
    }

    #[test]
    fn vanished_names_drop_to_zero() {
        let mut counter = counter(0);
        record(&mut counter, &[("Widget", 3), ("Gadget", 1)]);
        record(&mut counter, &[("Gadget", 1)]);
        let entries = counter.iter();
        // Gadget didn't change, so only Widget is reported
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "Widget");
        assert_eq!(entries[0].1.instance_change, -3);
    }

    #[test]
    fn interesting_means_growing_or_included() {
        let mut counter = counter(0);
        record(&mut counter, &[("Grower", 1), ("NeverMind", 1), ("AlwaysHere", 1)]);
        record(&mut counter, &[("Grower", 5), ("NeverMind", 9), ("AlwaysHere", 1)]);
        assert!(counter.is_interesting("Grower"));
        assert!(!counter.is_interesting("NeverMind"));
        assert!(counter.is_interesting("AlwaysHere"));
        assert!(!counter.is_interesting("Unknown"));
    }
}
