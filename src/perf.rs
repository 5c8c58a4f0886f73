//! Chrome trace output for profiling the tool itself.
//!
//! Opt in with `-d trace`; load the resulting json in a trace viewer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

struct Perf {
    start: Instant,
    w: BufWriter<File>,
    first: bool,
}

static PERF: Mutex<Option<Perf>> = Mutex::new(None);

impl Perf {
    fn event(&mut self, name: &str, start: Instant, end: Instant) -> std::io::Result<()> {
        let sep = if self.first { "" } else { ",\n" };
        self.first = false;
        write!(
            self.w,
            "{}{{\"pid\": 0, \"name\": {:?}, \"ph\": \"X\", \"ts\": {}, \"dur\": {}}}",
            sep,
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros(),
        )
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write!(w, "[\n")?;
    *PERF.lock().unwrap() = Some(Perf {
        start: Instant::now(),
        w,
        first: true,
    });
    Ok(())
}

/// Run `f`, recording its duration as a complete event when tracing is on.
pub fn scope<T>(name: &str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    let end = Instant::now();
    if let Some(perf) = PERF.lock().unwrap().as_mut() {
        let _ = perf.event(name, start, end);
    }
    result
}

pub fn close() -> std::io::Result<()> {
    if let Some(mut perf) = PERF.lock().unwrap().take() {
        let now = Instant::now();
        let start = perf.start;
        perf.event("main", start, now)?;
        write!(perf.w, "\n]\n")?;
        perf.w.flush()?;
    }
    Ok(())
}
