use std::thread::sleep;
use std::time::Duration;

/// Waits between retries never grow past this.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Retries the execution of `f` until `max_attempts` is reached, waiting
/// `initial_interval` after the first failure and doubling the wait after
/// each further one, capped at [`MAX_RETRY_INTERVAL`]. Returns the first
/// successful result or the latest error if all attempts fail.
pub fn retry<F, T, E>(max_attempts: usize, initial_interval: Duration, f: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    retry_with_sleep(max_attempts, initial_interval, f, sleep)
}

fn retry_with_sleep<F, T, E, S>(
    max_attempts: usize,
    initial_interval: Duration,
    mut f: F,
    mut sleep_fn: S,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    S: FnMut(Duration),
{
    let mut interval = initial_interval;
    let mut last_err = None;
    for attempt in 1..=max_attempts {
        match f() {
            Ok(result) => return Ok(result),
            Err(err) => {
                last_err = Some(err);
                if attempt < max_attempts {
                    sleep_fn(interval);
                    interval = (interval * 2).min(MAX_RETRY_INTERVAL);
                }
            }
        }
    }
    Err(last_err.expect("some error must exist at this point"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_success() {
        let result: Result<&str, &str> = retry(3, Duration::from_millis(10), || Ok("success"));
        assert_eq!(result, Ok("success"));
    }

    #[test]
    fn test_retry_failure() {
        let result: Result<&str, &str> = retry(3, Duration::from_millis(10), || Err("failure"));
        assert_eq!(result, Err("failure"));
    }

    #[test]
    fn test_retry_with_multiple_attempts() {
        let mut attempts = 0;
        let result = retry(3, Duration::from_millis(10), || {
            attempts += 1;
            if attempts < 3 {
                Err("try again")
            } else {
                Ok("finally succeeded")
            }
        });
        assert_eq!(result, Ok("finally succeeded"));
    }

    #[test]
    fn test_retry_backs_off_exponentially() {
        let mut slept = Vec::new();
        let result: Result<(), &str> = retry_with_sleep(
            4,
            Duration::from_millis(10),
            || Err("failure"),
            |interval| slept.push(interval),
        );

        assert_eq!(result, Err("failure"));
        // no wait after the final attempt
        assert_eq!(
            slept,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
            ]
        );
    }

    #[test]
    fn test_retry_interval_is_capped() {
        let mut slept = Vec::new();
        let result: Result<(), &str> = retry_with_sleep(
            3,
            Duration::from_secs(4),
            || Err("failure"),
            |interval| slept.push(interval),
        );

        assert_eq!(result, Err("failure"));
        assert_eq!(
            slept,
            vec![Duration::from_secs(4), Duration::from_secs(5)]
        );
    }
}
