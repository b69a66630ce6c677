//! Syslog priority: `facility << 3 | severity`.

pub const SEVERITY_NAMES: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

pub const FACILITY_NAMES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron", "authpriv",
    "ftp", "ntp", "security", "console", "solaris-cron", "local0", "local1", "local2", "local3",
    "local4", "local5", "local6", "local7",
];

pub fn severity(pri: u8) -> u8 {
    pri & 0x07
}

pub fn facility(pri: u8) -> u8 {
    pri >> 3
}

pub fn make(facility: u8, severity: u8) -> u8 {
    debug_assert!(facility < 24 && severity < 8);
    facility << 3 | (severity & 0x07)
}

pub fn severity_name(pri: u8) -> &'static str {
    SEVERITY_NAMES[severity(pri) as usize]
}

pub fn facility_name(pri: u8) -> Option<&'static str> {
    FACILITY_NAMES.get(facility(pri) as usize).copied()
}

pub fn severity_by_name(name: &str) -> Option<u8> {
    // "error" and "warn" circulate as aliases of the canonical names.
    match name {
        "error" => return Some(3),
        "warn" => return Some(4),
        _ => {}
    }
    SEVERITY_NAMES
        .iter()
        .position(|candidate| *candidate == name)
        .map(|severity| severity as u8)
}

pub fn facility_by_name(name: &str) -> Option<u8> {
    FACILITY_NAMES
        .iter()
        .position(|candidate| *candidate == name)
        .map(|facility| facility as u8)
}
