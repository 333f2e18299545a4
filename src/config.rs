//! Environment-driven configuration.
//!
//! Every knob the library honours arrives through environment variables so
//! that deployment scripts can steer behaviour without code changes. The
//! full set is read once at context initialisation into an [`EnvConfig`]
//! snapshot; only the verbosity-control file is re-read afterwards (by the
//! route-table collector, see [`crate::route::rtc`]).

use std::env;
use std::path::PathBuf;

/// Path to a static seed route table loaded at startup.
pub const ENV_SEED_RT: &str = "RMR_SEED_RT";
/// Route manager service: `host:port` (connect and request tables) or a
/// bare port (listen for pushed tables).
pub const ENV_RTG_SVC: &str = "RMR_RTG_SVC";
/// When > 0 route manager input is raw newline records, not framed messages.
pub const ENV_RTG_RAW: &str = "RMR_RTG_ISRAW";
/// Port for control messages from the route manager; presence flips the
/// default mode to "connect and request".
pub const ENV_CTL_PORT: &str = "RMR_CTL_PORT";
/// Interface address to bind listeners to (default 0.0.0.0).
pub const ENV_BIND_IF: &str = "RMR_BIND_IF";
/// When set, the message source is stamped as name:port only.
pub const ENV_NAME_ONLY: &str = "RMR_SRC_NAMEONLY";
/// File polled for a verbosity digit.
pub const ENV_VERBOSE_FILE: &str = "RMR_VCTL_FILE";
/// Log verbosity level (0-5) applied at subscriber setup.
pub const ENV_LOG_VLEVEL: &str = "RMR_LOG_VLEVEL";
/// Human-readable stat output when != 0 (default); JSON otherwise.
pub const ENV_HR_LOG: &str = "RMR_HR_LOG";
/// Seconds between route-table request retransmits (1-300).
pub const ENV_RTREQ_FREQ: &str = "RMR_RTREQ_FREQ";

/// Default control port the collector listens on.
pub const DEF_CTL_PORT: &str = "4561";
/// Well-known route manager address used when only the control port is set.
pub const DEF_RTG_WK_ADDR: &str = "routemgr:4561";
/// Default table-request retransmit interval, seconds.
pub const DEF_RTREQ_FREQ: u64 = 5;
/// Fallback verbosity-control file.
pub const DEF_VCTL_FILE: &str = "/tmp/rmr.v";

/// How the route-table collector obtains tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcMode {
    /// Listen on `port`; the route manager connects and pushes tables.
    Passive { port: String },
    /// Connect to `mgr_addr`, request tables, and listen on `ctl_port` for
    /// pushed updates as well.
    Active { mgr_addr: String, ctl_port: String },
}

/// Snapshot of the environment taken at context initialisation.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub seed_rt: Option<PathBuf>,
    pub rtc_mode: RtcMode,
    pub rtg_raw: bool,
    pub bind_if: String,
    pub name_only: bool,
    pub vctl_file: PathBuf,
    pub log_vlevel: u8,
    pub hr_log: bool,
    pub rtreq_freq_secs: u64,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl EnvConfig {
    /// Read the current process environment.
    pub fn from_env() -> Self {
        let rtreq = var(ENV_RTREQ_FREQ)
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| {
                if !(1..=300).contains(&v) {
                    tracing::warn!(
                        "table request frequency {} out of range (1-300), using default {}",
                        v,
                        DEF_RTREQ_FREQ
                    );
                    DEF_RTREQ_FREQ
                } else {
                    v
                }
            })
            .unwrap_or(DEF_RTREQ_FREQ);

        Self {
            seed_rt: var(ENV_SEED_RT).map(PathBuf::from),
            rtc_mode: resolve_rtc_mode(var(ENV_RTG_SVC).as_deref(), var(ENV_CTL_PORT).as_deref()),
            rtg_raw: var(ENV_RTG_RAW).map(|v| v.parse::<i32>().unwrap_or(0) > 0).unwrap_or(false),
            bind_if: var(ENV_BIND_IF).unwrap_or_else(|| "0.0.0.0".to_string()),
            name_only: var(ENV_NAME_ONLY).is_some(),
            vctl_file: var(ENV_VERBOSE_FILE).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEF_VCTL_FILE)),
            log_vlevel: var(ENV_LOG_VLEVEL).and_then(|v| v.parse().ok()).unwrap_or(0),
            hr_log: var(ENV_HR_LOG).map(|v| v.parse::<i32>().unwrap_or(1) != 0).unwrap_or(true),
            rtreq_freq_secs: rtreq,
        }
    }
}

/// Mode truth table:
///
/// | RMR_CTL_PORT | RMR_RTG_SVC | behaviour                                   |
/// |--------------|-------------|---------------------------------------------|
/// | unset        | unset       | listen on the default control port          |
/// | set          | unset       | connect to the well-known manager address,  |
/// |              |             | listen on the configured control port       |
/// | any          | host:port   | connect to that address and request tables  |
/// | any          | port only   | listen on that port (legacy push mode)      |
fn resolve_rtc_mode(rtg_svc: Option<&str>, ctl_port: Option<&str>) -> RtcMode {
    match rtg_svc {
        None => match ctl_port {
            None => RtcMode::Passive { port: DEF_CTL_PORT.to_string() },
            Some(p) => RtcMode::Active { mgr_addr: DEF_RTG_WK_ADDR.to_string(), ctl_port: p.to_string() },
        },
        Some(svc) => {
            let toks: Vec<&str> = svc.split(':').collect();
            match toks.as_slice() {
                [port] => RtcMode::Passive { port: port.to_string() },
                ["tcp", port, ..] => RtcMode::Passive { port: port.to_string() }, // old style tcp:port listen
                _ => RtcMode::Active {
                    mgr_addr: svc.to_string(),
                    ctl_port: ctl_port.unwrap_or(DEF_CTL_PORT).to_string(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults_to_passive_listen() {
        assert_eq!(
            resolve_rtc_mode(None, None),
            RtcMode::Passive { port: DEF_CTL_PORT.to_string() }
        );
    }

    #[test]
    fn ctl_port_alone_flips_to_active() {
        assert_eq!(
            resolve_rtc_mode(None, Some("9999")),
            RtcMode::Active { mgr_addr: DEF_RTG_WK_ADDR.to_string(), ctl_port: "9999".to_string() }
        );
    }

    #[test]
    fn port_only_service_stays_passive() {
        assert_eq!(
            resolve_rtc_mode(Some("4561"), None),
            RtcMode::Passive { port: "4561".to_string() }
        );
        assert_eq!(
            resolve_rtc_mode(Some("tcp:4561"), None),
            RtcMode::Passive { port: "4561".to_string() }
        );
    }

    #[test]
    fn host_port_service_is_active() {
        assert_eq!(
            resolve_rtc_mode(Some("rtmgr:4561"), Some("5561")),
            RtcMode::Active { mgr_addr: "rtmgr:4561".to_string(), ctl_port: "5561".to_string() }
        );
    }
}
