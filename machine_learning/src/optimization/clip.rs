/// Rescales `grad` in place so its L2 norm is at most `max_norm`.
///
/// # Arguments
/// * `grad` - The gradient to clip.
/// * `max_norm` - The maximum allowed norm.
///
/// # Returns
/// The total norm before clipping. Non finite norms are returned unchanged and
/// leave `grad` untouched, so the caller can skip the step.
pub fn clip_grad_norm(grad: &mut [f32], max_norm: f32) -> f32 {
    let norm = grad
        .iter()
        .map(|&g| (g as f64).powi(2))
        .sum::<f64>()
        .sqrt() as f32;

    if !norm.is_finite() {
        return norm;
    }

    let coef = max_norm / (norm + 1e-6);
    if coef < 1. {
        grad.iter_mut().for_each(|g| *g *= coef);
    }

    norm
}
