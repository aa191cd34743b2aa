use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use nalgebra::UnitQuaternion;
use tracing::warn;

use crate::chart::{ChartFeed, PlottedSample};
use crate::eventlog::EventLog;
use crate::normalize::NormalizedRecord;
use crate::orientation::HudAngles;
use crate::ranges::ErrorState;

/// Snapshot handed to subscribers on every render tick
pub struct RenderFrame<'a> {
    pub local_elapsed: f64,
    pub drift: f64,
    /// Visible chart interval `[start, end]`
    pub window: (f64, f64),
    pub charts: &'a ChartFeed,
    /// Smoothed attitude, once any has been received
    pub orientation: Option<UnitQuaternion<f64>>,
    pub hud: Option<HudAngles>,
    pub errors: &'a ErrorState,
    pub log: &'a EventLog,
    pub connected: bool,
}

/// Display-side consumer of the telemetry pipeline
///
/// Every hook has an empty default so a subscriber implements only what it shows.
pub trait TelemetrySubscriber: Send {
    /// Once per normalized, non-dropped packet
    fn on_record(&mut self, _record: &NormalizedRecord) {}

    /// Samples that were added to chart buffers for the last record
    fn on_plotted(&mut self, _samples: &[PlottedSample]) {}

    /// A packet delivered a valid attitude target
    fn on_orientation_sample(&mut self, _target: &UnitQuaternion<f64>) {}

    /// Fixed-rate tick; must tolerate being called with no new data
    fn on_render_tick(&mut self, _frame: &RenderFrame<'_>) {}

    fn on_link_state(&mut self, _connected: bool) {}
}

/// Line-oriented console display
pub struct ConsoleOutput {
    out: Box<dyn Write + Send>,
    records: bool,
    /// Print the status line every this many render ticks
    status_every: u32,
    ticks: u32,
}

impl ConsoleOutput {
    pub fn new(records: bool, status_every: u32) -> Self {
        Self::with_writer(Box::new(io::stdout()), records, status_every)
    }

    pub fn with_writer(out: Box<dyn Write + Send>, records: bool, status_every: u32) -> Self {
        ConsoleOutput {
            out,
            records,
            status_every: status_every.max(1),
            ticks: 0,
        }
    }

    pub fn format_status(frame: &RenderFrame<'_>) -> String {
        let mut line = format!(
            "t={:.1}s drift={:+.3}s points={} link={}",
            frame.local_elapsed,
            frame.drift,
            frame.charts.total_points(),
            if frame.connected { "up" } else { "down" },
        );
        if let Some(hud) = frame.hud {
            line.push_str(&format!(
                " rpy=({:.1},{:.1},{:.1})",
                hud.roll_deg, hud.pitch_deg, hud.yaw_deg
            ));
        }
        if !frame.errors.is_empty() {
            let active: Vec<&str> = frame.errors.active().collect();
            line.push_str(&format!(" errors=[{}]", active.join(",")));
        }
        line
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            warn!("Failed to write console output: {}", e);
        }
    }
}

impl TelemetrySubscriber for ConsoleOutput {
    fn on_record(&mut self, record: &NormalizedRecord) {
        if !self.records {
            return;
        }
        match serde_json::to_string(record) {
            Ok(json) => self.write_line(&json),
            Err(e) => warn!("Failed to encode record: {}", e),
        }
    }

    fn on_render_tick(&mut self, frame: &RenderFrame<'_>) {
        self.ticks += 1;
        if self.ticks % self.status_every != 0 {
            return;
        }
        let line = Self::format_status(frame);
        self.write_line(&line);
    }

    fn on_link_state(&mut self, connected: bool) {
        self.write_line(if connected { "# connected" } else { "# disconnected" });
    }
}

/// CSV export of every plotted sample: `time,channel,value`
pub struct CsvOutput<W: Write = BufWriter<File>> {
    writer: W,
}

impl CsvOutput<BufWriter<File>> {
    /// Append to `path`, writing the header only when the file is new or empty.
    pub fn new(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut output = CsvOutput { writer: BufWriter::new(file) };
        if fresh {
            output.write_header()?;
        }
        Ok(output)
    }
}

impl<W: Write> CsvOutput<W> {
    pub fn from_writer(writer: W) -> io::Result<Self> {
        let mut output = CsvOutput { writer };
        output.write_header()?;
        Ok(output)
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.writer, "time,channel,value")
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TelemetrySubscriber for CsvOutput<W> {
    fn on_plotted(&mut self, samples: &[PlottedSample]) {
        for sample in samples {
            if let Err(e) = writeln!(self.writer, "{:.6},{},{}", sample.x, sample.channel, sample.y) {
                warn!("Failed to write CSV: {}", e);
                return;
            }
        }
    }

    fn on_render_tick(&mut self, _frame: &RenderFrame<'_>) {
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush CSV: {}", e);
        }
    }
}
