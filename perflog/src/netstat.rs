// Network throughput from the kernel's byte counters.
//
// Interfaces are discovered once, when the monitor is created, so that the header of
// network_metrics.csv never changes during a run.  Two families are looked at:
//
// - InfiniBand ports, <sys>/class/infiniband/<dev>/ports/<port>/counters.  The first counter pair
//   that exists is used.  The port_*_data counters count 4-byte words.
//
// - Physical Ethernet interfaces, <sys>/class/net/<iface> with a `device` entry, other than lo.
//
// Counters are differenced against the previous reading.  A counter that goes backwards (driver
// reload, wrap, reset) yields a zero delta rather than a negative one.  A counter that can't be
// read this cycle reports zero and keeps its previous value as the baseline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const IB_COUNTER_PAIRS: &[(&str, &str, u64)] = &[
    ("port_rcv_data_64", "port_xmit_data_64", 4),
    ("port_rcv_data", "port_xmit_data", 4),
    ("rx_bytes", "tx_bytes", 1),
];

const MIB: f64 = 1024.0 * 1024.0;

struct Counter {
    path: PathBuf,
    scale: u64,
    prev: Option<u64>,
}

impl Counter {
    fn new(path: PathBuf, scale: u64) -> Counter {
        let mut c = Counter {
            path,
            scale,
            prev: None,
        };
        c.prev = c.read();
        c
    }

    fn read(&self) -> Option<u64> {
        let text = fs::read_to_string(&self.path).ok()?;
        let value = text.trim().parse::<u64>().ok()?;
        Some(value.saturating_mul(self.scale))
    }

    // Bytes since the last successful reading, 0 if there is no baseline or no reading now.
    fn advance(&mut self) -> u64 {
        let Some(curr) = self.read() else {
            debug!("Could not read {}", self.path.display());
            return 0;
        };
        let delta = match self.prev {
            Some(prev) => counter_delta(prev, curr),
            None => 0,
        };
        self.prev = Some(curr);
        delta
    }
}

struct Interface {
    key: String,
    rx: Counter,
    tx: Counter,
}

pub struct NetworkMonitor {
    interfaces: Vec<Interface>,
    keys: Arc<[String]>,
}

impl NetworkMonitor {
    /// Find the interfaces under `sys_root` (normally /sys) and take the baseline readings.

    pub fn discover(sys_root: &Path) -> NetworkMonitor {
        let mut interfaces = infiniband_ports(sys_root);
        interfaces.extend(ethernet_interfaces(sys_root));
        interfaces.sort_by(|a, b| a.key.cmp(&b.key));
        let keys = interfaces
            .iter()
            .map(|i| i.key.clone())
            .collect::<Vec<String>>()
            .into();
        NetworkMonitor { interfaces, keys }
    }

    /// The column keys, in file order.

    pub fn keys(&self) -> Arc<[String]> {
        self.keys.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Read all counters and return rx,tx rates in MiB/s for each interface, in key order, over
    /// `elapsed_secs` since the previous call (or since discovery).

    pub fn sample(&mut self, elapsed_secs: f64) -> Vec<f64> {
        let mut rates = Vec::with_capacity(self.interfaces.len() * 2);
        for iface in self.interfaces.iter_mut() {
            let rx = iface.rx.advance();
            let tx = iface.tx.advance();
            rates.push(rate_mib(rx, elapsed_secs));
            rates.push(rate_mib(tx, elapsed_secs));
        }
        rates
    }
}

/// The increase of a monotonic counter, clamped at zero when the counter was reset.

pub fn counter_delta(prev: u64, curr: u64) -> u64 {
    curr.saturating_sub(prev)
}

fn rate_mib(bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        bytes as f64 / MIB / elapsed_secs
    } else {
        0.0
    }
}

fn sorted_entries(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return vec![];
    };
    let mut v = entries
        .flatten()
        .filter_map(|e| Some((e.file_name().to_str()?.to_string(), e.path())))
        .collect::<Vec<(String, PathBuf)>>();
    v.sort();
    v
}

fn infiniband_ports(sys_root: &Path) -> Vec<Interface> {
    let mut found = vec![];
    for (dev, dev_path) in sorted_entries(&sys_root.join("class/infiniband")) {
        for (port, port_path) in sorted_entries(&dev_path.join("ports")) {
            let counters = port_path.join("counters");
            let pair = IB_COUNTER_PAIRS
                .iter()
                .find(|(rx, tx, _)| counters.join(rx).is_file() && counters.join(tx).is_file());
            if let Some((rx, tx, scale)) = pair {
                found.push(Interface {
                    key: format!("IB_{dev}_port{port}"),
                    rx: Counter::new(counters.join(rx), *scale),
                    tx: Counter::new(counters.join(tx), *scale),
                });
            }
        }
    }
    found
}

fn ethernet_interfaces(sys_root: &Path) -> Vec<Interface> {
    let mut found = vec![];
    for (iface, path) in sorted_entries(&sys_root.join("class/net")) {
        if iface == "lo" || !path.join("device").exists() {
            continue;
        }
        let stats = path.join("statistics");
        if !stats.join("rx_bytes").is_file() {
            continue;
        }
        found.push(Interface {
            key: format!("ETH_{iface}"),
            rx: Counter::new(stats.join("rx_bytes"), 1),
            tx: Counter::new(stats.join("tx_bytes"), 1),
        });
    }
    found
}

#[test]
fn test_counter_delta_clamps_resets() {
    let readings = [100u64, 150, 90, 140];
    let deltas = readings
        .windows(2)
        .map(|w| counter_delta(w[0], w[1]))
        .collect::<Vec<u64>>();
    assert!(deltas == vec![50, 0, 50]);
}

#[cfg(test)]
fn write_counter(path: &Path, value: u64) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, format!("{value}\n")).unwrap();
}

#[test]
fn test_network_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let sys = dir.path();
    let ib = sys.join("class/infiniband/mlx5_0/ports/1/counters");
    write_counter(&ib.join("port_rcv_data"), 0);
    write_counter(&ib.join("port_xmit_data"), 0);
    let eth = sys.join("class/net/eno1");
    fs::create_dir_all(eth.join("device")).unwrap();
    write_counter(&eth.join("statistics/rx_bytes"), 1048576);
    write_counter(&eth.join("statistics/tx_bytes"), 0);
    // Virtual interfaces and loopback have no device entry or are excluded by name.
    write_counter(&sys.join("class/net/lo/statistics/rx_bytes"), 5);
    write_counter(&sys.join("class/net/veth0/statistics/rx_bytes"), 5);

    let mut mon = NetworkMonitor::discover(sys);
    assert!(mon.keys().to_vec() == vec!["ETH_eno1".to_string(), "IB_mlx5_0_port1".to_string()]);

    // 2 MiB received on eno1, 262144 words (1 MiB) sent on the IB port, over 2 seconds.
    write_counter(&eth.join("statistics/rx_bytes"), 3 * 1048576);
    write_counter(&ib.join("port_xmit_data"), 262144);
    assert!(mon.sample(2.0) == vec![1.0, 0.0, 0.0, 0.5]);

    // Counter reset on eno1 rx and an unreadable IB counter both give zero.
    write_counter(&eth.join("statistics/rx_bytes"), 10);
    fs::remove_file(ib.join("port_xmit_data")).unwrap();
    assert!(mon.sample(1.0) == vec![0.0, 0.0, 0.0, 0.0]);

    // The baseline for the unreadable counter is the last good value.
    write_counter(&ib.join("port_xmit_data"), 262144 + 262144);
    assert!(mon.sample(1.0) == vec![0.0, 0.0, 0.0, 1.0]);
}

#[test]
fn test_no_interfaces() {
    let dir = tempfile::tempdir().unwrap();
    let mut mon = NetworkMonitor::discover(dir.path());
    assert!(mon.is_empty());
    assert!(mon.sample(1.0).is_empty());
}
