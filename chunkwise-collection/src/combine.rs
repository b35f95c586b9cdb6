use std::iter::Sum;

/// Chains partial `Vec`s, in order, into one.
pub fn concat<T>(results: &mut dyn Iterator<Item = Vec<T>>) -> Vec<T> {
    let mut out = Vec::new();
    for mut part in results {
        out.append(&mut part);
    }
    out
}

/// Adds partial results up.
pub fn sum<T: Sum<T>>(results: &mut dyn Iterator<Item = T>) -> T {
    results.sum()
}
