//! Store configuration, read from connection-string query parameters.

use std::time::Duration;

use crate::admission::{AdmissionPolicy, DEFAULT_MAX_CONCURRENT_TXN};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Zero disables periodic compaction.
    pub compact_interval: Duration,
    /// Revisions kept behind the current one.
    pub compact_retention: i64,
    /// Revisions removed per compaction transaction.
    pub compact_batch_size: i64,
    pub poll_interval: Duration,
    /// Rows read per poll.
    pub poll_batch_size: i64,
    /// Event batches buffered per watcher before it is closed as too slow.
    pub watch_queue_size: usize,
    pub admission: AdmissionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compact_interval: Duration::from_secs(5 * 60),
            compact_retention: 1000,
            compact_batch_size: 1000,
            poll_interval: Duration::from_secs(1),
            poll_batch_size: 500,
            watch_queue_size: 1024,
            admission: AdmissionPolicy::AllowAll,
        }
    }
}

/// Raw admission parameters; they only make sense together.
#[derive(Debug, Default)]
struct AdmissionParams {
    policy: Option<String>,
    max_concurrent: Option<usize>,
    only_writes: Option<bool>,
}

impl StoreConfig {
    /// Builds a config from query pairs, returning the pairs it did not recognise.
    pub fn from_params<I, K, V>(params: I) -> Result<(Self, Vec<(String, String)>), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = StoreConfig::default();
        let mut admission = AdmissionParams::default();
        let mut rest = Vec::new();

        for (key, value) in params {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "compact-interval" => config.compact_interval = parse_duration(key, value)?,
                "compact-retention" => config.compact_retention = parse_non_negative(key, value)?,
                "compact-batch-size" => config.compact_batch_size = parse_positive(key, value)?,
                "poll-interval" => {
                    config.poll_interval = parse_duration(key, value)?;
                    if config.poll_interval.is_zero() {
                        return Err(ConfigError::invalid(key, value, "must be greater than zero"));
                    }
                }
                "poll-batch-size" => config.poll_batch_size = parse_positive(key, value)?,
                "watch-queue-size" => config.watch_queue_size = parse_positive::<i64>(key, value)? as usize,
                "admission-control-policy" => admission.policy = Some(value.to_owned()),
                "admission-control-policy-limit-max-concurrent-txn" => {
                    admission.max_concurrent = Some(parse_positive::<i64>(key, value)? as usize)
                }
                "admission-control-only-write-queries" => admission.only_writes = Some(parse_bool(key, value)?),
                _ => rest.push((key.to_owned(), value.to_owned())),
            }
        }

        config.admission = match admission.policy.as_deref() {
            None | Some("") | Some("allow-all") => AdmissionPolicy::AllowAll,
            Some("limit-concurrent-transactions") => AdmissionPolicy::LimitConcurrentTransactions {
                max_concurrent: admission.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT_TXN),
                only_writes: admission.only_writes.unwrap_or(false),
            },
            Some(other) => {
                return Err(ConfigError::invalid("admission-control-policy", other, "expected allow-all or limit-concurrent-transactions"))
            }
        };

        Ok((config, rest))
    }
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T, ConfigError>
where T: std::str::FromStr + PartialOrd + Default {
    match value.parse::<T>() {
        Ok(v) if v > T::default() => Ok(v),
        Ok(_) => Err(ConfigError::invalid(key, value, "must be greater than zero")),
        Err(_) => Err(ConfigError::invalid(key, value, "not a number")),
    }
}

fn parse_non_negative(key: &str, value: &str) -> Result<i64, ConfigError> {
    match value.parse::<i64>() {
        Ok(v) if v >= 0 => Ok(v),
        Ok(_) => Err(ConfigError::invalid(key, value, "must not be negative")),
        Err(_) => Err(ConfigError::invalid(key, value, "not a number")),
    }
}

pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "not a boolean")),
    }
}

/// Parses Go-style durations such as `5m`, `1m30s`, `250ms` or a bare `0`.
pub fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::invalid(key, value, reason);
    let input = value.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).ok_or_else(|| invalid("missing unit"))?;
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let number: f64 = rest[..digits].parse().map_err(|_| invalid("bad number"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid("unknown unit")),
        };
        rest = &rest[unit_len..];
        total += Duration::from_secs_f64(number * seconds_per_unit);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("x", "0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("x", "5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("x", "1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("x", "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("x", "1.5h").unwrap(), Duration::from_secs(5400));
        assert!(parse_duration("x", "10").is_err());
        assert!(parse_duration("x", "ten seconds").is_err());
        assert!(parse_duration("x", "5d").is_err());
    }

    #[test]
    fn defaults_when_no_params() {
        let (config, rest) = StoreConfig::from_params(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert!(rest.is_empty());
    }

    #[test]
    fn admission_parameters_combine() {
        let (config, _) = StoreConfig::from_params([
            ("admission-control-policy", "limit-concurrent-transactions"),
            ("admission-control-policy-limit-max-concurrent-txn", "8"),
            ("admission-control-only-write-queries", "true"),
        ])
        .unwrap();
        assert_eq!(config.admission, AdmissionPolicy::LimitConcurrentTransactions { max_concurrent: 8, only_writes: true });

        // the limit alone does not switch the policy on
        let (config, _) = StoreConfig::from_params([("admission-control-policy-limit-max-concurrent-txn", "8")]).unwrap();
        assert_eq!(config.admission, AdmissionPolicy::AllowAll);

        assert!(StoreConfig::from_params([("admission-control-policy", "fifo")]).is_err());
        assert!(StoreConfig::from_params([("admission-control-policy-limit-max-concurrent-txn", "0")]).is_err());
    }

    #[test]
    fn intervals_and_unknown_params() {
        let (config, rest) =
            StoreConfig::from_params([("compact-interval", "0"), ("poll-interval", "100ms"), ("pool-size", "4")]).unwrap();
        assert!(config.compact_interval.is_zero());
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(rest, vec![("pool-size".to_string(), "4".to_string())]);

        assert!(StoreConfig::from_params([("poll-interval", "0")]).is_err());
    }
}
