//! Rolling-window stop-string detection.
//!
//! Decoded text arrives in small increments and a stop string may straddle
//! two of them, so emission is held back by `longest_stop - 1` bytes until
//! the window proves no stop can still complete. On a match the visible text
//! is cut at the match start; the stop string itself is never delivered.

/// Result of feeding one text increment through the stop window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopScan {
    /// Text cleared for delivery by this increment.
    pub emit: String,
    /// Set when a stop string completed inside the window.
    pub matched: bool,
}

/// Incremental stop-string matcher for one sequence.
#[derive(Debug, Clone)]
pub struct StopState {
    /// Stop strings, matched on decoded output text.
    stops: Vec<String>,
    /// Bytes withheld from emission; `longest_stop - 1`.
    holdback: usize,
    /// Decoded but not yet emitted text.
    pending: String,
    matched: bool,
}

impl StopState {
    pub fn new(stops: &[String]) -> Self {
        let holdback = stops
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .saturating_sub(1);
        Self {
            stops: stops.to_vec(),
            holdback,
            pending: String::new(),
            matched: false,
        }
    }

    /// Whether a stop string has already matched.
    pub fn matched(&self) -> bool {
        self.matched
    }

    /// Feed newly decoded text; returns what may be emitted now.
    ///
    /// After a match every further push emits nothing.
    pub fn push(&mut self, text: &str) -> StopScan {
        if self.matched {
            return StopScan {
                emit: String::new(),
                matched: true,
            };
        }
        self.pending.push_str(text);

        if let Some(at) = self.earliest_match() {
            self.matched = true;
            let emit = self.pending[..at].to_string();
            self.pending.clear();
            return StopScan {
                emit,
                matched: true,
            };
        }

        let keep_from = floor_char_boundary(&self.pending, self.pending.len() - self.holdback.min(self.pending.len()));
        let emit = self.pending[..keep_from].to_string();
        self.pending.drain(..keep_from);
        StopScan {
            emit,
            matched: false,
        }
    }

    /// Flush the held-back tail when the sequence finishes for another
    /// reason (length, token stop, cancellation).
    pub fn finish(&mut self) -> String {
        if self.matched {
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }

    /// Forget all buffered text, e.g. when a preempted sequence recomputes.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.matched = false;
    }

    fn earliest_match(&self) -> Option<usize> {
        self.stops
            .iter()
            .filter_map(|stop| self.pending.find(stop.as_str()))
            .min()
    }
}

/// Largest byte index `<= at` that lands on a char boundary.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    let mut at = at.min(s.len());
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}
