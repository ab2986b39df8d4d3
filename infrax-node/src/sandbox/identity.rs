//! Process identity
//!
//! A process group id alone does not name a process: after a reboot or pid
//! reuse the same number belongs to someone else. The boot id together with
//! the group leader's start time (clock ticks since boot) does.

/// The process group of a job as recorded in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pgid: u32,
    pub boot_id: Option<String>,
    pub start_time: Option<u64>,
}

impl ProcessIdentity {
    /// Identity of the live process `pid`, as far as the platform tells
    pub fn capture(pid: u32) -> Self {
        Self {
            pgid: pid,
            boot_id: boot_id(),
            start_time: start_time(pid),
        }
    }

    /// Both halves of the identity are known
    pub fn is_verifiable(&self) -> bool {
        self.boot_id.is_some() && self.start_time.is_some()
    }

    /// Whether the process now holding `pgid` is the one recorded
    ///
    /// False whenever that cannot be established.
    pub fn matches_live(&self) -> bool {
        if !self.is_verifiable() {
            return false;
        }
        let live = Self::capture(self.pgid);
        live.boot_id == self.boot_id && live.start_time == self.start_time
    }
}

#[cfg(target_os = "linux")]
fn boot_id() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

#[cfg(not(target_os = "linux"))]
fn boot_id() -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_start_time(&stat)
}

#[cfg(not(target_os = "linux"))]
fn start_time(_pid: u32) -> Option<u64> {
    None
}

/// Field 22 of `/proc/<pid>/stat`
///
/// Field 2 is the command name in parentheses and may itself contain spaces
/// and parentheses, so counting starts after the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_start_time(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}
