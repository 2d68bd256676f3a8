//! Metrics collected about a running load test.
//!
//! Every task execution produces a [`RequestMetric`] which streams over a
//! channel to the parent process, where it is folded into a
//! [`RequestAggregate`] keyed by `"<METHOD> <name>"`. Nothing is handled or
//! retried at the point of failure; a failed request is simply recorded and the
//! virtual user moves on.

use http::StatusCode;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::catalog::TaskMethod;
use crate::util;

/// Statistics about a single request, sent from a virtual user to the parent.
#[derive(Debug, Clone)]
pub struct RequestMetric {
    /// The method being used (ie, GET, POST, etc).
    pub method: TaskMethod,
    /// The reporting name of the request: the task's display name when set,
    /// otherwise the request path.
    pub name: String,
    /// How many milliseconds the request took.
    pub response_time: u128,
    /// The HTTP response code, or `None` if the request never completed.
    pub status_code: Option<StatusCode>,
    /// Whether or not the request was successful.
    pub success: bool,
    /// Which virtual user made the request.
    pub user: usize,
}

impl RequestMetric {
    pub fn new(method: TaskMethod, name: &str, user: usize) -> Self {
        RequestMetric {
            method,
            name: name.to_string(),
            response_time: 0,
            status_code: None,
            success: true,
            user,
        }
    }

    pub(crate) fn set_response_time(&mut self, response_time: u128) {
        self.response_time = response_time;
    }

    pub(crate) fn set_status_code(&mut self, status_code: Option<StatusCode>) {
        self.status_code = status_code;
    }
}

/// Aggregated statistics about all requests sharing a reporting key, (for
/// example `GET /api/checkout`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAggregate {
    /// The reporting name statistics are being collected for.
    pub name: String,
    /// The method statistics are being collected for.
    pub method: TaskMethod,
    /// Per-response-time counters, tracking how often requests complete with
    /// this response time.
    pub response_times: BTreeMap<usize, usize>,
    /// The shortest response time seen so far.
    pub min_response_time: usize,
    /// The longest response time seen so far.
    pub max_response_time: usize,
    /// Total combined response times seen so far.
    pub total_response_time: usize,
    /// Total number of response times seen so far.
    pub response_time_counter: usize,
    /// Per-status-code counters, tracking how often each response code was
    /// returned; only populated when `--status-codes` is enabled.
    pub status_code_counts: HashMap<u16, usize>,
    /// Total number of requests that resulted in a successful (2xx) status code.
    pub success_count: usize,
    /// Total number of requests that failed.
    pub fail_count: usize,
}

impl RequestAggregate {
    /// Create a new aggregate for a reporting key.
    pub fn new(name: &str, method: TaskMethod) -> Self {
        trace!("new aggregate for {} {}", method, name);
        RequestAggregate {
            name: name.to_string(),
            method,
            response_times: BTreeMap::new(),
            min_response_time: 0,
            max_response_time: 0,
            total_response_time: 0,
            response_time_counter: 0,
            status_code_counts: HashMap::new(),
            success_count: 0,
            fail_count: 0,
        }
    }

    /// Track response time.
    pub fn set_response_time(&mut self, response_time: u128) {
        // Perform this conversion only once, then re-use throughout this function.
        let response_time_usize = response_time as usize;

        // Update minimum if this one is fastest yet.
        if self.min_response_time == 0 || response_time_usize < self.min_response_time {
            self.min_response_time = response_time_usize;
        }

        // Update maximum if this one is slowest yet.
        if response_time_usize > self.max_response_time {
            self.max_response_time = response_time_usize;
        }

        self.total_response_time += response_time_usize;
        self.response_time_counter += 1;

        // Round the response time so we can combine similar times together and
        // minimize required memory to store and display.
        let rounded_response_time: usize;

        // No rounding for 1-100ms response times.
        if response_time < 100 {
            rounded_response_time = response_time_usize;
        }
        // Round to nearest 10 for 100-500ms response times.
        else if response_time < 500 {
            rounded_response_time = ((response_time as f64 / 10.0).round() * 10.0) as usize;
        }
        // Round to nearest 100 for 500-1000ms response times.
        else if response_time < 1000 {
            rounded_response_time = ((response_time as f64 / 100.0).round() * 100.0) as usize;
        }
        // Round to nearest 1000 for all larger response times.
        else {
            rounded_response_time = ((response_time as f64 / 1000.0).round() * 1000.0) as usize;
        }

        let counter = match self.response_times.get(&rounded_response_time) {
            Some(c) => *c + 1,
            None => 1,
        };
        self.response_times.insert(rounded_response_time, counter);
        debug!("incremented {} counter: {}", rounded_response_time, counter);
    }

    /// Increment counter for status code, creating new counter if first time
    /// seeing status code. Requests that never completed count under 0.
    pub fn set_status_code(&mut self, status_code: Option<StatusCode>) {
        let status_code_u16 = match status_code {
            Some(s) => s.as_u16(),
            _ => 0,
        };
        let counter = match self.status_code_counts.get(&status_code_u16) {
            Some(c) => *c + 1,
            None => 1,
        };
        self.status_code_counts.insert(status_code_u16, counter);
        debug!("incremented {} counter: {}", status_code_u16, counter);
    }
}

/// Metrics collected over the course of a load test.
///
/// Returned by [`Stampede::execute`](../struct.Stampede.html#method.execute)
/// when the load test finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// How many seconds the load test ran.
    pub duration: usize,
    /// Total number of virtual users launched.
    pub users: usize,
    /// Aggregated per-reporting-key statistics about all requests made.
    pub requests: HashMap<String, RequestAggregate>,
    /// Flag indicating whether to display status code counters.
    pub display_status_codes: bool,
    /// Flag indicating whether metrics were collected at all.
    pub display_metrics: bool,
}

impl Metrics {
    /// Fold a raw request metric into the aggregate for its reporting key.
    pub(crate) fn record_request(&mut self, raw: RequestMetric, status_codes: bool) {
        let key = format!("{} {}", raw.method, raw.name);
        let aggregate = self
            .requests
            .entry(key)
            .or_insert_with(|| RequestAggregate::new(&raw.name, raw.method));
        aggregate.set_response_time(raw.response_time);
        if status_codes {
            aggregate.set_status_code(raw.status_code);
        }
        if raw.success {
            aggregate.success_count += 1;
        } else {
            aggregate.fail_count += 1;
        }
    }

    /// Displays the final metrics unless metrics are disabled.
    pub fn print(&self) {
        if self.display_metrics {
            info!("printing metrics after {} seconds...", self.duration);
            println!("{}", self);
        }
    }

    /// Displays metrics about the running load test.
    pub(crate) fn print_running(&self) {
        if self.display_metrics {
            info!(
                "printing running metrics after {} seconds...",
                self.duration
            );
            println!("{}", self);
        }
    }

    /// Optionally prepares a table of requests and fails.
    pub(crate) fn fmt_requests(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.requests.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "------------------------------------------------------------------------------ "
        )?;
        writeln!(
            fmt,
            " {:<23} | {:<14} | {:<14} | {:<6} | {:<5}",
            "Name", "# reqs", "# fails", "req/s", "fail/s"
        )?;
        writeln!(
            fmt,
            " ----------------------------------------------------------------------------- "
        )?;
        let mut aggregate_fail_count = 0;
        let mut aggregate_total_count = 0;
        for (request_key, request) in self.requests.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let total_count = request.success_count + request.fail_count;
            let fail_percent = if request.fail_count > 0 {
                request.fail_count as f32 / total_count as f32 * 100.0
            } else {
                0.0
            };
            let (req_s, fail_s) =
                per_second_calculations(self.duration, total_count, request.fail_count);
            // Compress 100.0 and 0.0 to 100 and 0 respectively to save width.
            if fail_percent as usize == 100 || fail_percent as usize == 0 {
                writeln!(
                    fmt,
                    " {:<23} | {:<14} | {:<14} | {:<6.2} | {:<5.2}",
                    util::truncate_string(request_key, 23),
                    total_count.to_formatted_string(&Locale::en),
                    format!(
                        "{} ({}%)",
                        request.fail_count.to_formatted_string(&Locale::en),
                        fail_percent as usize
                    ),
                    req_s,
                    fail_s,
                )?;
            } else {
                writeln!(
                    fmt,
                    " {:<23} | {:<14} | {:<14} | {:<6.2} | {:<5.2}",
                    util::truncate_string(request_key, 23),
                    total_count.to_formatted_string(&Locale::en),
                    format!(
                        "{} ({:.1}%)",
                        request.fail_count.to_formatted_string(&Locale::en),
                        fail_percent
                    ),
                    req_s,
                    fail_s,
                )?;
            }
            aggregate_total_count += total_count;
            aggregate_fail_count += request.fail_count;
        }
        if self.requests.len() > 1 {
            let aggregate_fail_percent = if aggregate_fail_count > 0 {
                aggregate_fail_count as f32 / aggregate_total_count as f32 * 100.0
            } else {
                0.0
            };
            writeln!(
                fmt,
                " ------------------------+----------------+----------------+--------+--------- "
            )?;
            let (req_s, fail_s) =
                per_second_calculations(self.duration, aggregate_total_count, aggregate_fail_count);
            if aggregate_fail_percent as usize == 100 || aggregate_fail_percent as usize == 0 {
                writeln!(
                    fmt,
                    " {:<23} | {:<14} | {:<14} | {:<6.2} | {:<5.2}",
                    "Aggregated",
                    aggregate_total_count.to_formatted_string(&Locale::en),
                    format!(
                        "{} ({}%)",
                        aggregate_fail_count.to_formatted_string(&Locale::en),
                        aggregate_fail_percent as usize
                    ),
                    req_s,
                    fail_s,
                )?;
            } else {
                writeln!(
                    fmt,
                    " {:<23} | {:<14} | {:<14} | {:<6.2} | {:<5.2}",
                    "Aggregated",
                    aggregate_total_count.to_formatted_string(&Locale::en),
                    format!(
                        "{} ({:.1}%)",
                        aggregate_fail_count.to_formatted_string(&Locale::en),
                        aggregate_fail_percent
                    ),
                    req_s,
                    fail_s,
                )?;
            }
        }

        Ok(())
    }

    /// Optionally prepares a table of response times.
    pub(crate) fn fmt_response_times(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.requests.is_empty() {
            return Ok(());
        }

        let mut aggregate_response_times: BTreeMap<usize, usize> = BTreeMap::new();
        let mut aggregate_total_response_time = 0;
        let mut aggregate_response_time_counter = 0;
        let mut aggregate_min_response_time = 0;
        let mut aggregate_max_response_time = 0;

        writeln!(
            fmt,
            "------------------------------------------------------------------------------ "
        )?;
        writeln!(
            fmt,
            " {:<23} | {:<10} | {:<10} | {:<10} | {:<10}",
            "Name", "Avg (ms)", "Min (ms)", "Max (ms)", "Median"
        )?;
        writeln!(
            fmt,
            " ----------------------------------------------------------------------------- "
        )?;
        for (request_key, request) in self.requests.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            // Iterate over user response times, and merge into aggregate response times.
            for (time, count) in &request.response_times {
                let counter = match aggregate_response_times.get(time) {
                    Some(c) => *c + *count,
                    None => *count,
                };
                aggregate_response_times.insert(*time, counter);
            }
            aggregate_total_response_time += request.total_response_time;
            aggregate_response_time_counter += request.response_time_counter;
            if aggregate_min_response_time == 0
                || (request.min_response_time > 0
                    && request.min_response_time < aggregate_min_response_time)
            {
                aggregate_min_response_time = request.min_response_time;
            }
            if request.max_response_time > aggregate_max_response_time {
                aggregate_max_response_time = request.max_response_time;
            }

            let average = if request.response_time_counter == 0 {
                0.0
            } else {
                request.total_response_time as f32 / request.response_time_counter as f32
            };
            writeln!(
                fmt,
                " {:<23} | {:<10.2} | {:<10} | {:<10} | {:<10}",
                util::truncate_string(request_key, 23),
                average,
                request.min_response_time,
                request.max_response_time,
                util::median(
                    &request.response_times,
                    request.response_time_counter,
                    request.min_response_time,
                    request.max_response_time
                ),
            )?;
        }
        if self.requests.len() > 1 {
            writeln!(
                fmt,
                " ------------------------+------------+------------+------------+------------- "
            )?;
            let average = if aggregate_response_time_counter == 0 {
                0.0
            } else {
                aggregate_total_response_time as f32 / aggregate_response_time_counter as f32
            };
            writeln!(
                fmt,
                " {:<23} | {:<10.2} | {:<10} | {:<10} | {:<10}",
                "Aggregated",
                average,
                aggregate_min_response_time,
                aggregate_max_response_time,
                util::median(
                    &aggregate_response_times,
                    aggregate_response_time_counter,
                    aggregate_min_response_time,
                    aggregate_max_response_time
                ),
            )?;
        }

        Ok(())
    }

    /// Optionally prepares a table of status codes.
    pub(crate) fn fmt_status_codes(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        // If not tracking status codes, or there's nothing to display, exit immediately.
        if !self.display_status_codes || self.requests.is_empty() {
            return Ok(());
        }

        let mut aggregate_status_code_counts: HashMap<u16, usize> = HashMap::new();

        writeln!(
            fmt,
            "------------------------------------------------------------------------------ "
        )?;
        writeln!(fmt, " {:<23} | {:<51}", "Name", "Status codes")?;
        writeln!(
            fmt,
            " ----------------------------------------------------------------------------- "
        )?;
        for (request_key, request) in self.requests.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let codes = prepare_status_codes(
                &request.status_code_counts,
                &mut Some(&mut aggregate_status_code_counts),
            );
            writeln!(
                fmt,
                " {:<23} | {:<51}",
                util::truncate_string(request_key, 23),
                codes,
            )?;
        }
        if self.requests.len() > 1 {
            writeln!(
                fmt,
                " ------------------------+---------------------------------------------------- "
            )?;
            let codes = prepare_status_codes(&aggregate_status_code_counts, &mut None);
            writeln!(fmt, " {:<23} | {:<51}", "Aggregated", codes)?;
        }

        Ok(())
    }
}

/// Implement format trait to allow displaying the metrics.
impl fmt::Display for Metrics {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_requests(fmt)?;
        self.fmt_response_times(fmt)?;
        self.fmt_status_codes(fmt)
    }
}

/// Calculate requests and fails per second for the given duration.
fn per_second_calculations(duration: usize, total: usize, fail: usize) -> (f32, f32) {
    if duration == 0 {
        (0.0, 0.0)
    } else {
        (
            total as f32 / duration as f32,
            fail as f32 / duration as f32,
        )
    }
}

/// Build a displayable string of status code counts, optionally merging the
/// counts into a running aggregate.
fn prepare_status_codes(
    status_code_counts: &HashMap<u16, usize>,
    aggregate_counts: &mut Option<&mut HashMap<u16, usize>>,
) -> String {
    let mut codes = String::new();
    for (status_code, count) in status_code_counts.iter().sorted() {
        if !codes.is_empty() {
            codes.push_str(", ");
        }
        codes.push_str(&format!(
            "{} [{}]",
            status_code,
            count.to_formatted_string(&Locale::en)
        ));
        if let Some(aggregate) = aggregate_counts.as_mut() {
            let counter = match aggregate.get(status_code) {
                Some(c) => *c + *count,
                None => *count,
            };
            aggregate.insert(*status_code, counter);
        }
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_time_rounding() {
        let mut aggregate = RequestAggregate::new("/", TaskMethod::Get);

        // Under 100ms, no rounding.
        aggregate.set_response_time(1);
        assert_eq!(aggregate.response_times.get(&1), Some(&1));
        assert_eq!(aggregate.min_response_time, 1);
        assert_eq!(aggregate.max_response_time, 1);

        // 100-500ms rounds to the nearest 10.
        aggregate.set_response_time(123);
        assert_eq!(aggregate.response_times.get(&120), Some(&1));

        // 500-1000ms rounds to the nearest 100.
        aggregate.set_response_time(549);
        assert_eq!(aggregate.response_times.get(&500), Some(&1));

        // Over 1000ms rounds to the nearest 1000.
        aggregate.set_response_time(1499);
        assert_eq!(aggregate.response_times.get(&1000), Some(&1));

        assert_eq!(aggregate.response_time_counter, 4);
        assert_eq!(aggregate.total_response_time, 1 + 123 + 549 + 1499);
        assert_eq!(aggregate.min_response_time, 1);
        assert_eq!(aggregate.max_response_time, 1499);
    }

    #[test]
    fn status_code_counters() {
        let mut aggregate = RequestAggregate::new("/", TaskMethod::Get);
        aggregate.set_status_code(Some(StatusCode::OK));
        aggregate.set_status_code(Some(StatusCode::OK));
        aggregate.set_status_code(Some(StatusCode::NOT_FOUND));
        // A request that never completed counts under 0.
        aggregate.set_status_code(None);

        assert_eq!(aggregate.status_code_counts.get(&200), Some(&2));
        assert_eq!(aggregate.status_code_counts.get(&404), Some(&1));
        assert_eq!(aggregate.status_code_counts.get(&0), Some(&1));
    }

    #[test]
    fn requests_aggregate_under_reporting_name() {
        let mut metrics = Metrics {
            display_metrics: true,
            ..Metrics::default()
        };

        let mut raw = RequestMetric::new(TaskMethod::Post, "/api/cart/add", 0);
        raw.set_response_time(25);
        metrics.record_request(raw, false);

        let mut raw = RequestMetric::new(TaskMethod::Post, "/api/cart/add", 1);
        raw.set_response_time(50);
        raw.success = false;
        metrics.record_request(raw, false);

        let aggregate = metrics.requests.get("POST /api/cart/add").unwrap();
        assert_eq!(aggregate.success_count, 1);
        assert_eq!(aggregate.fail_count, 1);
        assert_eq!(aggregate.response_time_counter, 2);
    }
}
