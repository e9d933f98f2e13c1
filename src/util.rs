use std::collections::BTreeMap;

/// Data object name for `number` under the journal's object prefix.
pub fn object_name(prefix: &str, number: u64) -> String {
    format!("{}{}", prefix, number)
}

/// Sparse set of byte ranges, used to track the not-yet-written extents of
/// an in-flight image event. Ranges are half-open `[start, end)` and kept
/// coalesced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    ranges: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn span(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }

    pub fn insert(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + length;

        // absorb any overlapping or adjacent predecessor
        if let Some((&prev_start, &prev_end)) =
            self.ranges.range(..=start).next_back()
        {
            if prev_end >= start {
                start = prev_start;
                end = end.max(prev_end);
                self.ranges.remove(&prev_start);
            }
        }
        // absorb overlapping or adjacent successors
        let successors: Vec<u64> = self
            .ranges
            .range(start..=end)
            .map(|(&s, _)| s)
            .collect();
        for succ_start in successors {
            let succ_end = self.ranges.remove(&succ_start).expect("range present");
            end = end.max(succ_end);
        }
        self.ranges.insert(start, end);
    }

    pub fn subtract(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let cut_start = offset;
        let cut_end = offset + length;

        let affected: Vec<(u64, u64)> = {
            let mut out = Vec::new();
            if let Some((&s, &e)) = self.ranges.range(..cut_start).next_back() {
                if e > cut_start {
                    out.push((s, e));
                }
            }
            out.extend(
                self.ranges
                    .range(cut_start..cut_end)
                    .map(|(&s, &e)| (s, e)),
            );
            out
        };

        for (start, end) in affected {
            self.ranges.remove(&start);
            if start < cut_start {
                self.ranges.insert(start, cut_start);
            }
            if end > cut_end {
                self.ranges.insert(cut_end, end);
            }
        }
    }

    pub fn contains(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        match self.ranges.range(..=offset).next_back() {
            Some((_, &end)) => end >= offset + length,
            None => false,
        }
    }
}
