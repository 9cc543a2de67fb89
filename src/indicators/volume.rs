/// Ratio of the short-window mean volume to the long-window mean volume
///
/// Both windows end at the latest bar. Returns 0.0 when the long mean is
/// zero and None when there are fewer volumes than the longer window.
pub fn volume_ratio(volumes: &[f64], short_len: usize, long_len: usize) -> Option<f64> {
    if short_len == 0 || long_len == 0 || volumes.len() < short_len.max(long_len) {
        return None;
    }

    let mean = |len: usize| volumes[volumes.len() - len..].iter().sum::<f64>() / len as f64;

    let long_mean = mean(long_len);
    if long_mean == 0.0 {
        return Some(0.0);
    }

    Some(mean(short_len) / long_mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_ratio() {
        let volumes = vec![100.0, 100.0, 100.0, 300.0];
        // short mean 300, long mean 150
        assert_eq!(volume_ratio(&volumes, 1, 4), Some(2.0));
    }

    #[test]
    fn test_volume_ratio_zero_volume() {
        let volumes = vec![0.0; 10];
        assert_eq!(volume_ratio(&volumes, 3, 10), Some(0.0));
    }

    #[test]
    fn test_volume_ratio_insufficient_data() {
        let volumes = vec![1.0; 5];
        assert!(volume_ratio(&volumes, 3, 10).is_none());
        assert!(volume_ratio(&volumes, 0, 3).is_none());
    }
}
