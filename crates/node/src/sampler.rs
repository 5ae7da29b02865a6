//! Cumulative byte counters of a network interface, read from procfs.

use chrono::Utc;
use proxyfleet_common::InterfaceSample;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const DEFAULT_ROUTE_PATH: &str = "/proc/net/route";
const DEFAULT_DEV_PATH: &str = "/proc/net/dev";

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("default route not found")]
    NoDefaultRoute,
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("malformed counters for interface {0}")]
    Malformed(String),
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct InterfaceSampler {
    route_path: PathBuf,
    dev_path: PathBuf,
}

impl Default for InterfaceSampler {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTE_PATH, DEFAULT_DEV_PATH)
    }
}

impl InterfaceSampler {
    pub fn new(route_path: impl Into<PathBuf>, dev_path: impl Into<PathBuf>) -> Self {
        Self {
            route_path: route_path.into(),
            dev_path: dev_path.into(),
        }
    }

    /// Samples `interface`, or the default-route interface when empty.
    pub async fn sample(&self, interface: &str) -> Result<InterfaceSample, SamplerError> {
        let name = if interface.is_empty() {
            self.default_interface().await?
        } else {
            interface.to_string()
        };

        let dev = read(&self.dev_path).await?;
        let (rx_bytes, tx_bytes) = parse_dev_counters(&dev, &name)?;
        Ok(InterfaceSample {
            interface: name,
            rx_bytes,
            tx_bytes,
            at: Utc::now(),
        })
    }

    async fn default_interface(&self) -> Result<String, SamplerError> {
        match tokio::fs::read_to_string(&self.route_path).await {
            Ok(table) => parse_default_route(&table).ok_or(SamplerError::NoDefaultRoute),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.route_path.display(), "Route table missing, asking netdev.");
                netdev::get_default_interface()
                    .map(|iface| iface.name)
                    .map_err(|_| SamplerError::NoDefaultRoute)
            }
            Err(source) => Err(SamplerError::Io {
                path: self.route_path.display().to_string(),
                source,
            }),
        }
    }
}

async fn read(path: &Path) -> Result<String, SamplerError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SamplerError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// First interface whose destination is 0.0.0.0 and whose route is up.
pub fn parse_default_route(table: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[1] != "00000000" {
            return None;
        }
        let flags = u32::from_str_radix(fields[3], 16).ok()?;
        (flags & 0x1 != 0).then(|| fields[0].to_string())
    })
}

/// Returns `(rx_bytes, tx_bytes)` for `interface`.
pub fn parse_dev_counters(dev: &str, interface: &str) -> Result<(u64, u64), SamplerError> {
    for line in dev.lines() {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        if name.trim() != interface {
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            return Err(SamplerError::Malformed(interface.to_string()));
        }
        let rx = fields[0]
            .parse()
            .map_err(|_| SamplerError::Malformed(interface.to_string()))?;
        let tx = fields[8]
            .parse()
            .map_err(|_| SamplerError::Malformed(interface.to_string()))?;
        return Ok((rx, tx));
    }
    Err(SamplerError::InterfaceNotFound(interface.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
docker0\t000011AC\t00000000\t0001\t0\t0\t0\t0000FFFF\t0\t0\t0
eth1\t00000000\t0101A8C0\t0002\t0\t0\t100\t00000000\t0\t0\t0
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
";

    const DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0: 123456     100    0    0    0     0          0         0   654321     200    0    0    0     0       0          0
";

    #[test]
    fn default_route_requires_up_flag() {
        assert_eq!(parse_default_route(ROUTE).as_deref(), Some("eth0"));
        assert_eq!(parse_default_route("Iface\tDestination\n"), None);
    }

    #[test]
    fn dev_counters_are_rx_and_tx_bytes() {
        assert_eq!(parse_dev_counters(DEV, "eth0").unwrap(), (123456, 654321));
        assert_eq!(parse_dev_counters(DEV, "lo").unwrap(), (1000, 1000));
        assert!(matches!(
            parse_dev_counters(DEV, "wlan0"),
            Err(SamplerError::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn short_counter_rows_are_malformed() {
        let dev = "eth0: 1 2 3\n";
        assert!(matches!(
            parse_dev_counters(dev, "eth0"),
            Err(SamplerError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn sample_uses_default_route_interface() {
        let dir = tempfile::tempdir().unwrap();
        let route = dir.path().join("route");
        let dev = dir.path().join("dev");
        std::fs::write(&route, ROUTE).unwrap();
        std::fs::write(&dev, DEV).unwrap();

        let sampler = InterfaceSampler::new(&route, &dev);
        let sample = sampler.sample("").await.unwrap();
        assert_eq!(sample.interface, "eth0");
        assert_eq!((sample.rx_bytes, sample.tx_bytes), (123456, 654321));

        let sample = sampler.sample("lo").await.unwrap();
        assert_eq!(sample.interface, "lo");
    }
}
