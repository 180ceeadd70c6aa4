//! Reports cache, loader and download metrics to statsd.
//!
//! Metrics are emitted with the [`metric!`](crate::metric) macro. Until [`configure_statsd`] has
//! been called, every metric is discarded.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};

use crate::config::Metrics;

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Capacity of the queue between emitting code and the UDP socket.
const QUEUE_CAPACITY: usize = 4096;

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,
    /// Tags attached to every metric.
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd_client
    }

    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Starts reporting to the statsd instance named in `config`.
///
/// Returns `false` without doing anything if no statsd host is configured. Sending happens on a
/// background thread, so emitting a metric never blocks a loader worker. Configuring twice is an
/// error.
pub fn configure_statsd(config: &Metrics) -> io::Result<bool> {
    let Some(ref host) = config.statsd else {
        return Ok(false);
    };

    let addr = host
        .as_str()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::other(format!("statsd host `{host}` did not resolve")))?;
    tracing::info!("Reporting metrics to statsd at {}", addr);

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = BufferedUdpMetricSink::from(addr, socket).map_err(io::Error::other)?;
    let sink = QueuingMetricSink::with_capacity(sink, QUEUE_CAPACITY);
    let statsd_client = StatsdClient::from_sink(&config.prefix, sink);

    METRICS_CLIENT
        .set(MetricsClient {
            statsd_client,
            tags: config.custom_tags.clone(),
        })
        .map_err(|_| io::Error::other("metrics client already configured"))?;
    Ok(true)
}

/// Invokes `f` with the configured client, or returns the default without statsd.
///
/// Prefer the [`metric!`](crate::metric) macro.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    match METRICS_CLIENT.get() {
        Some(client) => f(client),
        None => Default::default(),
    }
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("loader.fetch") += 1, "status" => "ok");
/// metric!(gauge("caches.memory.bytes") = total_bytes);
/// metric!(timer("futures.done") = elapsed);
/// metric!(histogram("caches.file.size") = blob.len() as u64);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    // sizes are reported as histograms rather than timers
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags, $id, $value $(, $k => $v)*)
    };
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(client.statsd().$method($id, $value)$(.with_tag($k, $v))*);
        })
    }};
}
