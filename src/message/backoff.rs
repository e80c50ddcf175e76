use std::time::Duration;

/// An infinite stream of back-off durations, where the duration increases by
/// an exponential factor up to some maximum delay. Upon reaching the maximum
/// delay, that value is returned from then on. Used to pace reconnect
/// attempts in the TCP transport; the delay itself is applied with
/// [std::thread::sleep], so this is not for use from asynchronous code.
///
pub struct ExponentialBackoff {
    curr: Duration,
    max: Duration,
    factor: u32,
}

impl ExponentialBackoff {
    pub fn new(start: Duration, max: Duration, factor: u32) -> ExponentialBackoff {
        ExponentialBackoff {
            curr: start,
            max,
            factor,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let new_next = self.curr * self.factor;

        self.curr = if new_next > self.max {
            self.max
        } else {
            new_next
        };

        Some(self.curr)
    }
}

#[cfg(test)]
mod test {

    use super::ExponentialBackoff;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_then_saturates() {
        let waits: Vec<_> = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2,
        )
        .take(4)
        .collect();

        assert_eq!(
            waits,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }
}
