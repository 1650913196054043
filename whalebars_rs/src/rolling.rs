//! Forward-looking window extremes.
//!
//! For row `i` the window is `values[i + 1 ..= i + horizon]`: the row's own
//! value is never part of it. Rows whose window would run past the end of the
//! series are `None`.
//!
//! Both helpers walk the series backwards once with a monotonic deque of
//! indices, so the cost is O(n) per horizon regardless of its length.

use std::collections::VecDeque;

pub fn forward_max(values: &[f64], horizon: usize) -> Vec<Option<f64>> {
    forward_extreme(values, horizon, |kept, incoming| kept > incoming)
}

pub fn forward_min(values: &[f64], horizon: usize) -> Vec<Option<f64>> {
    forward_extreme(values, horizon, |kept, incoming| kept < incoming)
}

/// `dominates(kept, incoming)` is true when an already-queued value still
/// beats a newly entering one. Entries that are dominated by a newcomer can
/// never be the extreme again: the newcomer has a smaller index and therefore
/// stays in the window longer.
fn forward_extreme(
    values: &[f64],
    horizon: usize,
    dominates: impl Fn(f64, f64) -> bool,
) -> Vec<Option<f64>> {
    let len = values.len();
    let mut out = vec![None; len];
    if horizon == 0 || len == 0 {
        return out;
    }

    let mut window: VecDeque<usize> = VecDeque::with_capacity(horizon.min(len) + 1);
    for i in (0..len).rev() {
        let incoming = i + 1;
        if incoming < len {
            let value = values[incoming];
            while let Some(&back) = window.back() {
                if dominates(values[back], value) {
                    break;
                }
                window.pop_back();
            }
            window.push_back(incoming);
        }

        let last = i.saturating_add(horizon);
        while let Some(&front) = window.front() {
            if front > last {
                window.pop_front();
            } else {
                break;
            }
        }

        if last < len {
            out[i] = window.front().map(|&idx| values[idx]);
        }
    }
    out
}
