//! Dial mapping: raw 0..100 reading → position over the station range.
//!
//! `position = raw/100 × (N−1)`, `floor = trunc(position)`,
//! `t = position − floor`, `ceil = min(floor+1, N−1)`.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DialState {
    /// Reading after clamping to 0..=100.
    pub reading: f32,
    pub position: f32,
    pub floor: usize,
    pub ceil: usize,
    /// Blend weight: 0 = pure floor station, 1 = pure ceil station.
    pub t: f32,
}

impl DialState {
    pub fn pair(&self) -> (usize, usize) {
        (self.floor, self.ceil)
    }

    /// Nominal weights before master volume.  When `floor == ceil` the whole
    /// weight sits on the single station.
    pub fn weights(&self) -> (f32, f32) {
        if self.floor == self.ceil {
            (1.0, 0.0)
        } else {
            (1.0 - self.t, self.t)
        }
    }
}

/// Map `raw` over `station_count` stations.  NaN maps like 0; callers are
/// expected to have replaced unreadable values with the last good reading.
pub fn map(raw: f32, station_count: usize) -> DialState {
    let reading = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 100.0) };
    let last = station_count.saturating_sub(1);
    let position = reading / 100.0 * last as f32;
    let floor = (position.trunc() as usize).min(last);
    let ceil = (floor + 1).min(last);
    let t = if floor == ceil {
        0.0
    } else {
        (position - floor as f32).clamp(0.0, 1.0)
    };
    DialState {
        reading,
        position,
        floor,
        ceil,
        t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_le_ceil_and_weights_sum_to_one() {
        for n in [2usize, 3, 7, 16] {
            for step in 0..=1000 {
                let raw = step as f32 / 10.0;
                let d = map(raw, n);
                assert!(d.floor <= d.ceil, "raw={raw} n={n}");
                assert_eq!(d.ceil, (d.floor + 1).min(n - 1));
                assert!((0.0..=1.0).contains(&d.t));
                let (a, b) = d.weights();
                assert!(((a + b) - 1.0).abs() < 1e-6, "raw={raw} n={n}");
            }
        }
    }

    #[test]
    fn test_bottom_edge() {
        let d = map(0.0, 16);
        assert_eq!(d.floor, 0);
        assert_eq!(d.ceil, 1);
        assert_eq!(d.t, 0.0);
        assert_eq!(d.weights(), (1.0, 0.0));
    }

    #[test]
    fn test_top_edge_collapses() {
        let d = map(100.0, 16);
        assert_eq!(d.position, 15.0);
        assert_eq!(d.pair(), (15, 15));
        assert_eq!(d.weights(), (1.0, 0.0));
    }

    #[test]
    fn test_midpoint_of_sixteen() {
        let d = map(50.0, 16);
        assert_eq!(d.position, 7.5);
        assert_eq!(d.pair(), (7, 8));
        assert_eq!(d.t, 0.5);
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        assert_eq!(map(-20.0, 4).pair(), map(0.0, 4).pair());
        assert_eq!(map(250.0, 4).pair(), (3, 3));
        assert_eq!(map(f32::NAN, 4).reading, 0.0);
    }
}
