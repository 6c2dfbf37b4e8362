use ndarray::ArrayView2;

/// Computes the top-k accuracies of a batch of predictions.
///
/// # Arguments
/// * `output` - The scores, one row per sample.
/// * `targets` - The true class of every row.
/// * `topk` - The `k`s to evaluate.
///
/// # Returns
/// One percentage per `k`, the share of rows whose target is among its `k`
/// highest scores. Ties rank the lower index first.
pub fn accuracy(output: ArrayView2<f32>, targets: &[usize], topk: &[usize]) -> Vec<f32> {
    let batch = output.nrows().min(targets.len());
    if batch == 0 {
        return vec![0.; topk.len()];
    }

    let ranks: Vec<usize> = output
        .rows()
        .into_iter()
        .zip(targets)
        .map(|(row, &target)| {
            let Some(&score) = row.get(target) else {
                return usize::MAX;
            };

            row.iter()
                .enumerate()
                .filter(|&(j, &s)| s > score || (s == score && j < target))
                .count()
        })
        .collect();

    topk.iter()
        .map(|&k| {
            let correct = ranks.iter().filter(|&&r| r < k).count();
            correct as f32 * 100. / batch as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn top1_and_top2() {
        let output = array![[0.1, 0.7, 0.2], [0.5, 0.3, 0.2], [0.1, 0.2, 0.7], [0.3, 0.4, 0.3]];
        let acc = accuracy(output.view(), &[1, 1, 0, 2], &[1, 2]);

        assert_eq!(acc, vec![25., 50.]);
    }

    #[test]
    fn ties_rank_the_lower_index_first() {
        let output = array![[0.5, 0.5]];

        assert_eq!(accuracy(output.view(), &[0], &[1]), vec![100.]);
        assert_eq!(accuracy(output.view(), &[1], &[1]), vec![0.]);
    }
}
