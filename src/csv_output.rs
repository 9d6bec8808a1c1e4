//! Flat-file sink
//!
//! One fixed header line, then one event per line. Fields are
//! double-quoted with embedded quotes doubled; extra attributes are
//! appended in emission order after the positional columns. An optional
//! leading ordinal column numbers the written events.

use std::io::{self, Write};

use crate::dispatch::EventSink;
use crate::error::SinkError;
use crate::event::{CanonicalEvent, EVENT_TIME_FORMAT};

/// Positional column names of the flat-file output.
const HEADER: [&str; 7] = [
    "datetime",
    "type",
    "user",
    "application",
    "invocation",
    "aux1",
    "aux2",
];

/// Flat-file sink. An empty destination writes to stdout.
pub struct CsvSink {
    out: Box<dyn Write>,
    print_ordinal: bool,
    counter: u64,
}

impl CsvSink {
    /// Open the destination and write the header line.
    pub fn create(output_file: &str, print_ordinal: bool) -> Result<Self, SinkError> {
        let out: Box<dyn Write> = if output_file.is_empty() {
            Box::new(io::stdout())
        } else {
            let file = std::fs::File::create(output_file).map_err(|err| SinkError::Open {
                dest: output_file.to_string(),
                source: err,
            })?;
            Box::new(io::BufWriter::new(file))
        };
        let mut sink = Self {
            out,
            print_ordinal,
            counter: 0,
        };
        sink.write_header()?;
        Ok(sink)
    }

    fn write_header(&mut self) -> Result<(), SinkError> {
        let mut columns: Vec<&str> = HEADER.to_vec();
        if self.print_ordinal {
            columns.insert(0, "n");
        }
        writeln!(self.out, "{}", columns.join(","))?;
        Ok(())
    }

    /// Quote a field, doubling embedded quotes.
    fn quote(field: &str) -> String {
        format!("\"{}\"", field.replace('"', "\"\""))
    }
}

impl EventSink for CsvSink {
    fn write_event(&mut self, event: &CanonicalEvent, _hash: &str) -> Result<(), SinkError> {
        self.counter += 1;

        let mut fields = vec![
            event.datetime.format(EVENT_TIME_FORMAT).to_string(),
            Self::quote(&event.name),
            Self::quote(&event.user),
        ];
        for (_, value) in &event.attributes {
            fields.push(Self::quote(value.trim()));
        }
        if self.print_ordinal {
            fields.insert(0, self.counter.to_string());
        }
        writeln!(self.out, "{}", fields.join(","))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}
