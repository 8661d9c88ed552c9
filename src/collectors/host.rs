/// Tag value used when the local hostname cannot be determined.
pub const FALLBACK_HOSTNAME: &str = "hostname";

/// Name of the local machine, or [`FALLBACK_HOSTNAME`].
pub fn local_hostname() -> String {
    match lookup() {
        Some(name) if !name.is_empty() => name,
        _ => {
            tracing::debug!("hostname lookup failed, using {FALLBACK_HOSTNAME:?}");
            FALLBACK_HOSTNAME.to_string()
        }
    }
}

#[cfg(unix)]
fn lookup() -> Option<String> {
    let uname = rustix::system::uname();
    uname.nodename().to_str().ok().map(str::to_string)
}

#[cfg(not(unix))]
fn lookup() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}
