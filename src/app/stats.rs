//! Minimal StatsD client, mirroring the source's thin wrapper around the
//! `statsd` package: counters and gauges over UDP, silently disabled when
//! no collector is configured.

use std::net::UdpSocket;
use std::sync::Mutex;

pub trait Stats: Send + Sync {
    fn incr(&self, name: &str, value: f64);
    fn gauge(&self, name: &str, value: f64);
}

/// Used when `STATSD_URL` isn't set; every call is a no-op.
pub struct NullStats;

impl Stats for NullStats {
    fn incr(&self, _name: &str, _value: f64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
}

/// Sends `{prefix}.{name}:{value}|c` / `|g` lines to a UDP StatsD collector.
/// One socket, guarded by a mutex since `UdpSocket::send` takes `&self` but
/// callers may be on multiple tokio worker threads at once.
pub struct UdpStats {
    socket: Mutex<UdpSocket>,
    prefix: String,
}

impl UdpStats {
    pub fn connect(host: &str, port: u16, prefix: impl Into<String>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((host, port))?;
        Ok(UdpStats {
            socket: Mutex::new(socket),
            prefix: prefix.into(),
        })
    }

    fn send(&self, line: &str) {
        if let Ok(socket) = self.socket.lock() {
            let _ = socket.send(line.as_bytes());
        }
    }
}

impl Stats for UdpStats {
    fn incr(&self, name: &str, value: f64) {
        self.send(&format!("{}.{name}:{value}|c", self.prefix));
    }

    fn gauge(&self, name: &str, value: f64) {
        self.send(&format!("{}.{name}:{value}|g", self.prefix));
    }
}

/// Builds the stats client the way `App._stats_init` does: reads
/// `STATSD_URL` (`statsd://host[:port]`) and `STATSD_REALM`, falling back to
/// `NullStats` if either is missing or malformed, logging why.
pub fn from_env(process_name: &str) -> std::sync::Arc<dyn Stats> {
    use std::sync::Arc;

    let Ok(statsd_url) = std::env::var("STATSD_URL") else {
        log::info!("STATSD_URL not set");
        return Arc::new(NullStats);
    };

    let Ok(parsed) = url::Url::parse(&statsd_url) else {
        log::warn!("STATSD_URL {statsd_url} not a valid URL");
        return Arc::new(NullStats);
    };
    if parsed.scheme() != "statsd" {
        log::warn!("STATSD_URL {statsd_url} scheme not 'statsd'");
        return Arc::new(NullStats);
    }
    let Some(host) = parsed.host_str() else {
        log::warn!("STATSD_URL {statsd_url} missing host");
        return Arc::new(NullStats);
    };
    let port = parsed.port().unwrap_or(8125);

    let Ok(realm) = std::env::var("STATSD_REALM") else {
        log::warn!("STATSD_URL {statsd_url} but STATSD_REALM not set");
        return Arc::new(NullStats);
    };

    let prefix = format!("mc.{realm}.{process_name}");
    match UdpStats::connect(host, port, prefix.clone()) {
        Ok(client) => {
            log::info!("sending stats to {statsd_url} prefix {prefix}");
            Arc::new(client)
        }
        Err(err) => {
            log::warn!("could not connect to STATSD_URL {statsd_url}: {err}");
            Arc::new(NullStats)
        }
    }
}
