//! Process-wide capacity limits, bandwidth tables and environment names.

use lazy_static::lazy_static;

/// Maximum number of nodes per node type.
pub const MAX_NODES: usize = 256;
/// Maximum number of links per node.
pub const MAX_LINKS: usize = 128;

/// Sentinel for integer attributes that have not been discovered yet.
pub const TOPO_UNDEF: i32 = -1;

// Link bandwidths in GB/s.
pub const LOC_BW: f64 = 5000.0;
pub const QPI_BW: f64 = 6.0;
pub const SKL_QPI_BW: f64 = 10.0;
pub const AMD_BW: f64 = 16.0;
pub const P9_BW: f64 = 32.0;
pub const ARM_BW: f64 = 6.0;
pub const ZPI_BW: f64 = 6.0;
pub const YONGFENG_ZPI_BW: f64 = 9.0;

/// Assumed NIC speed in Mb/s when the net element does not carry one.
pub const DEFAULT_NET_MBPS: i64 = 10000;

/// Lane width assumed when a pci element does not report link_width.
pub const PCI_WIDTH_DEFAULT: i64 = 16;
/// Per-lane speed class used when link_speed is missing or unknown.
pub const PCI_GEN_FALLBACK: i64 = 60;

lazy_static! {
    /// PCIe per-lane speed classes; link bandwidth is width * speed / 80.0.
    /// Both the bare and the "PCIe"-suffixed spellings occur in sysfs dumps.
    pub static ref PCI_GEN_SPEEDS: Vec<(&'static str, i64)> = vec![
        ("2.5 GT/s", 15),
        ("5 GT/s", 30),
        ("8 GT/s", 60),
        ("16 GT/s", 120),
        ("32 GT/s", 240),
        ("2.5 GT/s PCIe", 15),
        ("5.0 GT/s PCIe", 30),
        ("8.0 GT/s PCIe", 60),
        ("16.0 GT/s PCIe", 120),
        ("32.0 GT/s PCIe", 240),
        ("64.0 GT/s PCIe", 480),
    ];
}

/// Look up a PCIe generation string, falling back to Gen3 speeds.
pub fn pci_gen_speed(s: Option<&str>) -> i64 {
    s.and_then(|s| {
        PCI_GEN_SPEEDS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, speed)| *speed)
    })
    .unwrap_or(PCI_GEN_FALLBACK)
}

// Environment variables recognized by the engine.
pub const ENV_TOPO_FILE: &str = "FLAGCX_TOPO_FILE";
pub const ENV_TOPO_DUMP_FILE: &str = "FLAGCX_TOPO_DUMP_FILE";
pub const ENV_USENET: &str = "FLAGCX_USENET";
pub const ENV_ENABLE_TOPO_DETECT: &str = "FLAGCX_ENABLE_TOPO_DETECT";
pub const ENV_INTERSERVER_ROUTE_FILE: &str = "FLAGCX_INTERSERVER_ROUTE_FILE";
