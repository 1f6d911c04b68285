use medians::Medianf64;
use rolling_stats;
use statistical;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptiveStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

// Tracks the per-frame mean ADU of the flats captured in a run. `recent`
// covers the last few frames, `session` covers the whole run.
pub struct AduStatsAccumulator {
    pub recent: DescriptiveStats,
    pub session: DescriptiveStats,

    // State for `recent`.
    circular_buffer: CircularBuffer,

    // State for `session`.
    rolling_stats: rolling_stats::Stats<f64>,
}

impl AduStatsAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: DescriptiveStats::default(),
            session: DescriptiveStats::default(),
            circular_buffer: CircularBuffer::new(capacity),
            rolling_stats: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn add_value(&mut self, value: f64) {
        self.circular_buffer.push(value);
        self.rolling_stats.update(value);

        let recent_values = self.circular_buffer.unordered_contents();
        let recent = &mut self.recent;
        recent.count = recent_values.len();
        recent.min = recent_values.iter().copied().fold(f64::INFINITY, f64::min);
        recent.max = recent_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        recent.mean = statistical::mean(recent_values);
        if recent_values.len() > 1 {
            recent.stddev = statistical::standard_deviation(
                recent_values, Some(recent.mean));
        }
        let median = recent_values.medf_unchecked();
        recent.median = Some(median);
        recent.median_absolute_deviation = Some(recent_values.madf(median));

        let session = &mut self.session;
        session.count += 1;
        session.min = self.rolling_stats.min;
        session.max = self.rolling_stats.max;
        session.mean = self.rolling_stats.mean;
        session.stddev = self.rolling_stats.std_dev;
        // No median or median_absolute_deviation for session stats.
    }

    pub fn reset_session(&mut self) {
        self.session = DescriptiveStats::default();
        self.rolling_stats = rolling_stats::Stats::<f64>::new();
    }
}

// We use a Vec<f64> to implement a ring buffer. We don't use VecDeque or
// similar because we want a view of all elements as a single slice, and we
// don't care about their order.
#[derive(Debug)]
struct CircularBuffer {
    start: usize,
    capacity: usize,
    data: Vec<f64>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            capacity,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: f64) {
        if self.data.len() < self.capacity {
            self.data.push(item);
        } else {
            self.data[self.start] = item;
            self.start += 1;
            self.start %= self.capacity;
        }
    }

    pub fn unordered_contents(&self) -> &[f64] {
        self.data.as_slice()
    }
}

// mod tests.
