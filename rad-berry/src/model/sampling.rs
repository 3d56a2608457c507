//! 训练部分内的随机过采样.

use std::cmp::Ordering;

use ndarray::ArrayView1;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// 对二分类标签做随机过采样: 返回行下标, 包含全部原始行以及少数类的随机重复,
/// 使两类行数相等. 类别已平衡或只有一类时返回原始行.
pub fn oversample(labels: ArrayView1<f64>, rng: &mut ChaCha8Rng) -> Vec<usize> {
    let mut out: Vec<usize> = (0..labels.len()).collect();
    let (neg, pos): (Vec<usize>, Vec<usize>) = out.iter().copied().partition(|i| labels[*i] < 0.5);
    let (n_neg, n_pos) = (neg.len(), pos.len());
    let (minority, deficit) = match n_neg.cmp(&n_pos) {
        Ordering::Less => (neg, n_pos - n_neg),
        Ordering::Greater => (pos, n_neg - n_pos),
        Ordering::Equal => return out,
    };
    if minority.is_empty() {
        return out;
    }
    out.extend((0..deficit).map(|_| minority[rng.gen_range(0..minority.len())]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_oversample_balances() {
        let y = array![0.0, 0.0, 0.0, 0.0, 1.0];
        let idx = oversample(y.view(), &mut ChaCha8Rng::seed_from_u64(1));
        assert_eq!(idx.len(), 8);
        assert_eq!(idx.iter().filter(|i| y[**i] == 1.0).count(), 4);
        assert_eq!(&idx[..5], &[0, 1, 2, 3, 4]);

        let single = array![1.0, 1.0];
        assert_eq!(oversample(single.view(), &mut ChaCha8Rng::seed_from_u64(1)), vec![0, 1]);
    }
}
