// Time-series buffers and the chart feed
//
// Each plotted channel owns a buffer kept sorted by x even though packets can
// arrive out of order. Buffers are bounded both by the rolling time window and
// by a hard point capacity.

use std::collections::VecDeque;
use std::ops::Range;

use crate::constants::SERIES_CAPACITY;
use crate::normalize::NormalizedRecord;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSeriesPoint {
    pub x: f64,
    pub y: f64,
}

/// Ordered samples for one channel
#[derive(Debug, Clone)]
pub struct TimeSeriesBuffer {
    points: VecDeque<TimeSeriesPoint>,
    capacity: usize,
}

impl TimeSeriesBuffer {
    pub fn new(capacity: usize) -> Self {
        TimeSeriesBuffer {
            points: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert a sample in x order. Returns false if it was rejected.
    ///
    /// The insertion point is found by scanning back from the tail, which is
    /// cheap for the usual nearly-monotonic arrival. Equal x values keep their
    /// arrival order.
    pub fn insert(&mut self, x: f64, y: f64) -> bool {
        if !x.is_finite() || x < 0.0 || !y.is_finite() {
            return false;
        }

        let mut idx = self.points.len();
        while idx > 0 && self.points[idx - 1].x > x {
            idx -= 1;
        }
        self.points.insert(idx, TimeSeriesPoint { x, y });

        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
        true
    }

    /// Drop points older than `window_start - grace`. Returns how many were removed.
    pub fn prune(&mut self, window_start: f64, grace: f64) -> usize {
        let cutoff = window_start - grace;
        let mut removed = 0;
        while self.points.front().map_or(false, |p| p.x < cutoff) {
            self.points.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<TimeSeriesPoint> {
        self.points.get(i).copied()
    }

    pub fn points(&self) -> impl Iterator<Item = &TimeSeriesPoint> + '_ {
        self.points.iter()
    }

    pub fn latest_x(&self) -> Option<f64> {
        self.points.back().map(|p| p.x)
    }

    /// Whether point `i` connects to its predecessor with a line.
    pub fn is_joined(&self, i: usize, max_gap: f64) -> bool {
        if i == 0 {
            return false;
        }
        match (self.points.get(i - 1), self.points.get(i)) {
            (Some(prev), Some(cur)) => (cur.x - prev.x).abs() <= max_gap,
            _ => false,
        }
    }

    /// A point with no joined neighbour on either side, drawn as a lone marker.
    pub fn is_isolated(&self, i: usize, max_gap: f64) -> bool {
        i < self.points.len() && !self.is_joined(i, max_gap) && !self.is_joined(i + 1, max_gap)
    }

    /// Maximal runs of joined points. A run of one is an isolated marker.
    pub fn segments(&self, max_gap: f64) -> Vec<Range<usize>> {
        let mut segments = Vec::new();
        let mut start = 0;
        for i in 1..=self.points.len() {
            if i == self.points.len() || !self.is_joined(i, max_gap) {
                segments.push(start..i);
                start = i;
            }
        }
        segments
    }
}

/// One plot: a title and the channels drawn on it
#[derive(Debug, Clone)]
pub struct Chart {
    pub name: String,
    channels: Vec<String>,
    buffers: Vec<TimeSeriesBuffer>,
}

impl Chart {
    pub fn new(name: &str, channels: &[&str], capacity: usize) -> Self {
        Chart {
            name: name.to_string(),
            channels: channels.iter().map(|s| s.to_string()).collect(),
            buffers: channels.iter().map(|_| TimeSeriesBuffer::new(capacity)).collect(),
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn buffer(&self, channel_index: usize) -> Option<&TimeSeriesBuffer> {
        self.buffers.get(channel_index)
    }

    pub fn series(&self) -> impl Iterator<Item = (&str, &TimeSeriesBuffer)> + '_ {
        self.channels.iter().map(String::as_str).zip(self.buffers.iter())
    }

    pub fn insert(&mut self, channel_index: usize, x: f64, y: f64) -> bool {
        match self.buffers.get_mut(channel_index) {
            Some(buffer) => buffer.insert(x, y),
            None => false,
        }
    }

    fn latest_x(&self) -> Option<f64> {
        self.buffers
            .iter()
            .filter_map(TimeSeriesBuffer::latest_x)
            .reduce(f64::max)
    }
}

/// Window and gap tuning shared by every chart
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartSettings {
    pub window_seconds: f64,
    pub max_gap_seconds: f64,
    pub gap_grace_seconds: f64,
    pub capacity: usize,
}

impl Default for ChartSettings {
    fn default() -> Self {
        ChartSettings {
            window_seconds: 30.0,
            max_gap_seconds: 2.0,
            gap_grace_seconds: 2.0,
            capacity: SERIES_CAPACITY,
        }
    }
}

/// A sample that made it into a chart buffer
#[derive(Debug, Clone, PartialEq)]
pub struct PlottedSample {
    pub channel: String,
    pub x: f64,
    pub y: f64,
}

/// Routes normalized records into the configured charts
#[derive(Debug, Clone)]
pub struct ChartFeed {
    charts: Vec<Chart>,
    settings: ChartSettings,
}

impl ChartFeed {
    pub fn new(charts: Vec<Chart>, settings: ChartSettings) -> Self {
        ChartFeed { charts, settings }
    }

    /// The ground station's standard plots.
    pub fn with_default_layout(settings: ChartSettings) -> Self {
        let cap = settings.capacity;
        let charts = vec![
            Chart::new("acceleration", &["accelX", "accelY", "accelZ"], cap),
            Chart::new("gyroscope", &["gyroX", "gyroY", "gyroZ"], cap),
            Chart::new("velocity", &["velocity"], cap),
            Chart::new("altitude", &["altitude"], cap),
            Chart::new("transducers", &["transducer1", "transducer2", "transducer3"], cap),
            Chart::new(
                "thermocouples",
                &["thermocouple1", "thermocouple2", "thermocouple3", "thermocouple4"],
                cap,
            ),
            Chart::new("internal-temperature", &["internalTemp"], cap),
            Chart::new("gas-bottles", &["gasBottleWeight1", "gasBottleWeight2"], cap),
        ];
        Self::new(charts, settings)
    }

    pub fn settings(&self) -> &ChartSettings {
        &self.settings
    }

    pub fn charts(&self) -> &[Chart] {
        &self.charts
    }

    pub fn chart(&self, name: &str) -> Option<&Chart> {
        self.charts.iter().find(|c| c.name == name)
    }

    /// Plot every charted channel the record carries at x. Invalid readings
    /// (including discarded ones) are never plotted.
    pub fn ingest(&mut self, record: &NormalizedRecord, x: f64) -> Vec<PlottedSample> {
        let mut plotted = Vec::new();
        for chart in &mut self.charts {
            for idx in 0..chart.channels.len() {
                let value = match record.value(&chart.channels[idx]) {
                    Some(v) => v,
                    None => continue,
                };
                if chart.insert(idx, x, value) {
                    plotted.push(PlottedSample {
                        channel: chart.channels[idx].clone(),
                        x,
                        y: value,
                    });
                }
            }
        }
        plotted
    }

    /// Latest time on the plots; keeps advancing with the local clock during a stall.
    pub fn now(&self, local_elapsed: f64) -> f64 {
        self.charts
            .iter()
            .filter_map(Chart::latest_x)
            .fold(local_elapsed, f64::max)
    }

    /// Current visible interval `[now - window, now]`.
    pub fn window(&self, local_elapsed: f64) -> (f64, f64) {
        let now = self.now(local_elapsed);
        (now - self.settings.window_seconds, now)
    }

    /// Drop points that have scrolled out of the window (plus grace).
    pub fn prune(&mut self, local_elapsed: f64) -> usize {
        let (start, _) = self.window(local_elapsed);
        let grace = self.settings.gap_grace_seconds;
        self.charts
            .iter_mut()
            .flat_map(|c| c.buffers.iter_mut())
            .map(|b| b.prune(start, grace))
            .sum()
    }

    pub fn clear(&mut self) {
        for buffer in self.charts.iter_mut().flat_map(|c| c.buffers.iter_mut()) {
            buffer.clear();
        }
    }

    pub fn total_points(&self) -> usize {
        self.charts
            .iter()
            .flat_map(|c| c.buffers.iter())
            .map(TimeSeriesBuffer::len)
            .sum()
    }
}
