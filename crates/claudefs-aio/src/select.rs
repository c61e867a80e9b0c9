//! Deterministic linear-time order statistics (median of medians).

/// Partially reorders `array` so that the k-th smallest value (1-indexed)
/// sits at the returned index.
///
/// Runs in worst-case linear time. The slice is mutated in place; callers that
/// need the original order must copy first.
///
/// # Panics
/// Panics if `k` is zero or greater than `array.len()`.
pub fn select(array: &mut [u64], k: usize) -> usize {
    assert!(
        k >= 1 && k <= array.len(),
        "k={} out of range for {} elements",
        k,
        array.len()
    );
    select_range(array, 0, array.len() - 1, k)
}

/// Returns the value at quantile `q` (0 < q <= 1) of `samples`.
///
/// Works on a private copy, `samples` is left untouched. Returns `None` for an
/// empty input.
pub fn percentile(samples: &[u64], q: f64) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len();
    let k = ((q * n as f64).ceil() as usize).clamp(1, n);
    let mut scratch = samples.to_vec();
    let index = select(&mut scratch, k);
    Some(scratch[index])
}

fn select_range(array: &mut [u64], left: usize, right: usize, k: usize) -> usize {
    let pivot = pivot_index(array, left, right);
    let (lo, hi) = partition(array, left, right, pivot);
    let below = lo - left;
    let equal = hi - lo;

    if k <= below {
        select_range(array, left, lo - 1, k)
    } else if k <= below + equal {
        lo + (k - below - 1)
    } else {
        select_range(array, hi, right, k - below - equal)
    }
}

/// Sorts `array[left..=right]` and returns its midpoint.
fn insertion_sort(array: &mut [u64], left: usize, right: usize) -> usize {
    for i in left + 1..=right {
        let value = array[i];
        let mut j = i;
        while j > left && array[j - 1] > value {
            array[j] = array[j - 1];
            j -= 1;
        }
        array[j] = value;
    }
    left + ((right - left) >> 1)
}

fn pivot_index(array: &mut [u64], left: usize, right: usize) -> usize {
    if right - left < 5 {
        return insertion_sort(array, left, right);
    }

    // Gather the median of each full group of five at the front of the range.
    let mut medians_end = left;
    let mut i = left;
    while i + 4 <= right {
        let median = insertion_sort(array, i, i + 4);
        array.swap(medians_end, median);
        medians_end += 1;
        i += 5;
    }

    let count = medians_end - left;
    select_range(array, left, medians_end - 1, (count >> 1) + 1)
}

/// Three-way partition around `array[pivot]`.
///
/// Returns `(lo, hi)` such that `[left, lo)` is smaller than the pivot,
/// `[lo, hi)` equals it and `[hi, right]` is larger.
fn partition(array: &mut [u64], left: usize, right: usize, pivot: usize) -> (usize, usize) {
    let value = array[pivot];
    let mut lo = left;
    let mut i = left;
    let mut hi = right + 1;

    while i < hi {
        if array[i] < value {
            array.swap(lo, i);
            lo += 1;
            i += 1;
        } else if array[i] > value {
            hi -= 1;
            array.swap(i, hi);
        } else {
            i += 1;
        }
    }

    (lo, hi)
}
