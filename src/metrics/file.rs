use std::{
    fmt::{self, Write as _},
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use allocator_api2::alloc::{Allocator, Global};
use flate2::{write::GzEncoder, Compression};

use crate::{
    error::Error,
    metrics::{collector, text::MetricsString, Generation},
};

/// Generations between sync flushes when nobody asked for a full one
pub const FLUSH_EVERY: u64 = 10;

/// A gzipped CSV file, one row per record per generation. Every row starts
/// with the generation and the time the record was started.
pub struct MetricsFile<A: Allocator + Clone = Global> {
    name: String,
    path: PathBuf,
    encoder: GzEncoder<File>,
    columns: usize,
    timestamp: f64,
    generation: Generation,
    row: MetricsString<A>,
    field: MetricsString<A>,
}

/// Append `field` to `row`, quoted if it would otherwise break the row
fn push_field<A: Allocator>(row: &mut MetricsString<A>, field: &str) {
    if !field.contains([',', '"', '\n']) {
        row.push_str(field);
        return;
    }
    row.push('"');
    for c in field.chars() {
        if c == '"' {
            row.push('"');
        }
        row.push(c);
    }
    row.push('"');
}

impl MetricsFile<Global> {
    pub fn create(
        log_dir: &Path,
        name: &str,
        columns: &[&str],
        generation: Generation,
    ) -> Result<Self, Error> {
        Self::create_in(log_dir, name, columns, generation, Global)
    }
}

impl<A: Allocator + Clone> MetricsFile<A> {
    /// Create `<log_dir>/<name>.csv.gz` (and `log_dir`, if needed) and write
    /// the header
    pub fn create_in(
        log_dir: &Path,
        name: &str,
        columns: &[&str],
        generation: Generation,
        alloc: A,
    ) -> Result<Self, Error> {
        collector::install_flush_signal_handler();
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("{name}.csv.gz"));
        let file = File::create(&path)?;
        log::debug!("writing {name} metrics to {}", path.display());

        let mut metrics_file = Self {
            name: name.to_owned(),
            path,
            encoder: GzEncoder::new(file, Compression::default()),
            columns: columns.len(),
            timestamp: 0.0,
            generation,
            row: MetricsString::new_in(alloc.clone()),
            field: MetricsString::new_in(alloc),
        };
        metrics_file.row.push_str("generation,timestamp");
        for column in columns {
            metrics_file.row.push(',');
            push_field(&mut metrics_file.row, column);
        }
        metrics_file.row.push('\n');
        metrics_file.encoder.write_all(metrics_file.row.as_bytes())?;
        Ok(metrics_file)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamp the rows that follow with the current time
    pub fn start_record(&mut self) {
        self.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |since| since.as_secs_f64());
    }

    /// Write one row. There must be exactly one value per column.
    pub fn add_row(&mut self, values: &[&dyn fmt::Display]) -> Result<(), Error> {
        if values.len() != self.columns {
            return Err(Error::ColumnCount {
                file: self.name.clone(),
                expected: self.columns,
                actual: values.len(),
            });
        }
        self.row.clear();
        _ = write!(self.row, "{},{:.6}", self.generation.get(), self.timestamp);
        for value in values {
            self.field.clear();
            _ = write!(self.field, "{value}");
            self.row.push(',');
            push_field(&mut self.row, &self.field);
        }
        self.row.push('\n');
        self.encoder.write_all(self.row.as_bytes())?;
        Ok(())
    }

    /// Get the rows onto disk: all the way (fsync) if a flush was requested,
    /// otherwise a sync flush every [`FLUSH_EVERY`] generations
    pub fn end_record(&mut self) -> Result<(), Error> {
        if collector::flush_requested() {
            self.encoder.flush()?;
            self.encoder.get_ref().sync_all()?;
        } else if self.generation.get() % FLUSH_EVERY == 0 {
            self.encoder.flush()?;
        }
        Ok(())
    }
}

impl<A: Allocator + Clone> Drop for MetricsFile<A> {
    fn drop(&mut self) {
        if let Err(err) = self.encoder.try_finish() {
            log::warn!("could not finish {}: {err}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    fn read_back(path: &Path) -> String {
        let mut contents = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut contents)
            .unwrap();
        contents
    }

    #[test]
    fn rows_carry_generation_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let generation = Generation::new();
        let mut file = MetricsFile::create(
            dir.path(),
            "widgets",
            &["name", "count"],
            generation.clone(),
        )
        .unwrap();
        file.start_record();
        file.add_row(&[&"button", &3]).unwrap();
        file.end_record().unwrap();
        generation.advance();
        file.start_record();
        file.add_row(&[&"label", &5]).unwrap();
        file.end_record().unwrap();
        let path = file.path().to_owned();
        drop(file);

        let contents = read_back(&path);
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines[0], "generation,timestamp,name,count");
        let fields: Vec<_> = lines[1].split(',').collect();
        assert_eq!(fields[0], "0");
        assert_eq!(fields[1].split('.').nth(1).map(str::len), Some(6));
        assert_eq!(&fields[2..], ["button", "3"]);
        assert!(lines[2].starts_with("1,"));
        assert!(lines[2].ends_with(",label,5"));
    }

    #[test]
    fn awkward_fields_are_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let mut file =
            MetricsFile::create(dir.path(), "quoting", &["trace"], Generation::new()).unwrap();
        file.start_record();
        file.add_row(&[&"a -> b, c"]).unwrap();
        file.add_row(&[&"say \"hi\""]).unwrap();
        let path = file.path().to_owned();
        drop(file);

        let contents = read_back(&path);
        let lines: Vec<_> = contents.lines().collect();
        assert!(lines[1].ends_with(",\"a -> b, c\""));
        assert!(lines[2].ends_with(",\"say \"\"hi\"\"\""));
    }

    #[test]
    fn wrong_column_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut file =
            MetricsFile::create(dir.path(), "narrow", &["a", "b"], Generation::new()).unwrap();
        file.start_record();
        let err = file.add_row(&[&1]).unwrap_err();
        assert!(matches!(
            err,
            Error::ColumnCount {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }
}
