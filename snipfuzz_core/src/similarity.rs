/// Score returned for two identical (or two empty) responses.
pub const MAX_SIMILARITY: f64 = 100.0;

/// Levenshtein distance with unit costs for insertion, deletion and substitution.
///
/// Operates on Unicode scalar values, so multi-byte characters count as one edit.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            let deletion = previous[j + 1] + 1;
            let insertion = current[j] + 1;
            current[j + 1] = substitution.min(deletion).min(insertion);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Normalized similarity of two responses in `[0, 100]`, rounded to two decimals.
///
/// Both inputs are trimmed first. Two empty strings are considered identical.
/// This is the only notion of "same response" used by the probe and mutation
/// stages.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.trim();
    let b = b.trim();
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return MAX_SIMILARITY;
    }

    let distance = edit_distance(a, b) as f64;
    let score = (1.0 - distance / longest as f64) * MAX_SIMILARITY;
    round_two_decimals(score.clamp(0.0, MAX_SIMILARITY))
}

fn round_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
