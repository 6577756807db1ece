// Copyright 2026 coevict Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::{BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

// FIXME: https://github.com/rust-lang/rust-analyzer/issues/17685
// #[expect(missing_docs)]
/// ... ...
#[derive(Debug)]
pub struct Metrics {
    /* candidate admission */
    /// ... ...
    pub eviction_enqueue: BoxedCounter,
    /// ... ...
    pub eviction_dedup: BoxedCounter,
    /// ... ...
    pub eviction_local_evict: BoxedCounter,
    /// ... ...
    pub eviction_round_evict: BoxedCounter,
    /// ... ...
    pub eviction_reject: BoxedCounter,
    /// ... ...
    pub eviction_resubmit: BoxedCounter,

    /* rounds */
    /// ... ...
    pub round_create: BoxedCounter,
    /// ... ...
    pub round_prepare: BoxedCounter,
    /// ... ...
    pub round_complete: BoxedCounter,
    /// ... ...
    pub round_timeout: BoxedCounter,
    /// ... ...
    pub round_abort: BoxedCounter,
    /// ... ...
    pub round_cancel: BoxedCounter,

    /// ... ...
    pub round_inflight: BoxedGauge,
    /// ... ...
    pub round_duration: BoxedHistogram,
    /// ... ...
    pub admission_wait_duration: BoxedHistogram,

    /* remote requests */
    /// ... ...
    pub request_send: BoxedCounter,
    /// ... ...
    pub request_send_fail: BoxedCounter,
    /// ... ...
    pub request_handle: BoxedCounter,
    /// ... ...
    pub request_stale: BoxedCounter,
    /// ... ...
    pub request_reject_key: BoxedCounter,

    /* buffer */
    /// ... ...
    pub buffer_size: BoxedGauge,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new(name: impl Into<std::borrow::Cow<'static, str>>, registry: &dyn RegistryOps) -> Self {
        let name = name.into();

        let coevict_eviction_op_total = registry.register_counter_vec(
            "coevict_eviction_op_total".into(),
            "coevict eviction candidate operations".into(),
            &["name", "op"],
        );
        let coevict_round_op_total = registry.register_counter_vec(
            "coevict_round_op_total".into(),
            "coevict eviction round operations".into(),
            &["name", "op"],
        );
        let coevict_request_op_total = registry.register_counter_vec(
            "coevict_request_op_total".into(),
            "coevict eviction request operations".into(),
            &["name", "op"],
        );
        let coevict_round_inflight = registry.register_gauge_vec(
            "coevict_round_inflight".into(),
            "coevict in-flight eviction rounds".into(),
            &["name"],
        );
        let coevict_buffer_size = registry.register_gauge_vec(
            "coevict_buffer_size".into(),
            "coevict buffered eviction candidates".into(),
            &["name"],
        );
        let coevict_round_duration = registry.register_histogram_vec(
            "coevict_round_duration".into(),
            "coevict eviction round durations".into(),
            &["name"],
        );
        let coevict_admission_wait_duration = registry.register_histogram_vec(
            "coevict_admission_wait_duration".into(),
            "coevict round admission wait durations".into(),
            &["name"],
        );

        let eviction_enqueue = coevict_eviction_op_total.counter(&[name.clone(), "enqueue".into()]);
        let eviction_dedup = coevict_eviction_op_total.counter(&[name.clone(), "dedup".into()]);
        let eviction_local_evict = coevict_eviction_op_total.counter(&[name.clone(), "local_evict".into()]);
        let eviction_round_evict = coevict_eviction_op_total.counter(&[name.clone(), "round_evict".into()]);
        let eviction_reject = coevict_eviction_op_total.counter(&[name.clone(), "reject".into()]);
        let eviction_resubmit = coevict_eviction_op_total.counter(&[name.clone(), "resubmit".into()]);

        let round_create = coevict_round_op_total.counter(&[name.clone(), "create".into()]);
        let round_prepare = coevict_round_op_total.counter(&[name.clone(), "prepare".into()]);
        let round_complete = coevict_round_op_total.counter(&[name.clone(), "complete".into()]);
        let round_timeout = coevict_round_op_total.counter(&[name.clone(), "timeout".into()]);
        let round_abort = coevict_round_op_total.counter(&[name.clone(), "abort".into()]);
        let round_cancel = coevict_round_op_total.counter(&[name.clone(), "cancel".into()]);

        let round_inflight = coevict_round_inflight.gauge(&[name.clone()]);
        let round_duration = coevict_round_duration.histogram(&[name.clone()]);
        let admission_wait_duration = coevict_admission_wait_duration.histogram(&[name.clone()]);

        let request_send = coevict_request_op_total.counter(&[name.clone(), "send".into()]);
        let request_send_fail = coevict_request_op_total.counter(&[name.clone(), "send_fail".into()]);
        let request_handle = coevict_request_op_total.counter(&[name.clone(), "handle".into()]);
        let request_stale = coevict_request_op_total.counter(&[name.clone(), "stale".into()]);
        let request_reject_key = coevict_request_op_total.counter(&[name.clone(), "reject_key".into()]);

        let buffer_size = coevict_buffer_size.gauge(&[name]);

        Self {
            eviction_enqueue,
            eviction_dedup,
            eviction_local_evict,
            eviction_round_evict,
            eviction_reject,
            eviction_resubmit,
            round_create,
            round_prepare,
            round_complete,
            round_timeout,
            round_abort,
            round_cancel,
            round_inflight,
            round_duration,
            admission_wait_duration,
            request_send,
            request_send_fail,
            request_handle,
            request_stale,
            request_reject_key,
            buffer_size,
        }
    }

    /// Build noop metrics.
    ///
    /// Note: `noop` is only supposed to be called by other coevict components.
    #[doc(hidden)]
    pub fn noop() -> Self {
        use super::registry::noop::NoopMetricsRegistry;

        Self::new("test", &NoopMetricsRegistry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::registry::noop::NoopMetricsRegistry;

    #[test]
    fn test_noop_metrics() {
        let metrics = Metrics::new("noop", &NoopMetricsRegistry);
        metrics.eviction_enqueue.increase(1);
        metrics.round_inflight.increase(1);
        metrics.round_inflight.decrease(1);
        metrics.round_duration.record(0.5);
    }
}
