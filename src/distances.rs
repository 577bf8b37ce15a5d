use num_traits::AsPrimitive;

/// Squared Euclidean distance between an f32 query and a candidate of any
/// stored element type, accumulated in f32.
#[inline]
#[must_use]
pub fn squared_l2<T: AsPrimitive<f32>>(query: &[f32], candidate: &[T]) -> f32 {
    debug_assert_eq!(query.len(), candidate.len());
    query
        .iter()
        .zip(candidate)
        .map(|(&q, &c)| {
            let delta = q - c.as_();
            delta * delta
        })
        .sum()
}
