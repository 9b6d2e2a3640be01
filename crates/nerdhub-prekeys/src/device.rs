//! Stable per-device identifier sent as `X-Device-Hash`.
//!
//! The hash input spells the OS and architecture the way Node's `os.type()`
//! and `os.arch()` do, so a device keeps the hash other Nerdhub clients
//! already registered for it.

use std::process::Command;

use sha2::{Digest, Sha256};
use tracing::warn;

const MACHINE_ID_PATH: &str = "/etc/machine-id";
const UNKNOWN_MACHINE: &str = "unknown";

/// SHA-256 hex of `"{os}-{release}-{arch}-{machine_id}"` for this host.
pub fn device_hash() -> String {
    let os = os_type(std::env::consts::OS);
    compute_device_hash(
        os,
        &os_release(),
        arch_name(std::env::consts::ARCH),
        &machine_id(os),
    )
}

pub fn compute_device_hash(os: &str, release: &str, arch: &str, machine_id: &str) -> String {
    let digest = Sha256::digest(format!("{os}-{release}-{arch}-{machine_id}").as_bytes());
    hex::encode(digest)
}

/// Kernel name as `uname -s` reports it.
pub fn os_type(os: &str) -> &str {
    match os {
        "linux" | "android" => "Linux",
        "macos" | "ios" => "Darwin",
        "windows" => "Windows_NT",
        "freebsd" => "FreeBSD",
        "openbsd" => "OpenBSD",
        "netbsd" => "NetBSD",
        "solaris" | "illumos" => "SunOS",
        other => other,
    }
}

/// Architecture in Node's vocabulary.
pub fn arch_name(arch: &str) -> &str {
    match arch {
        "x86_64" => "x64",
        "x86" => "ia32",
        "aarch64" => "arm64",
        "powerpc" => "ppc",
        "powerpc64" => "ppc64",
        "loongarch64" => "loong64",
        other => other,
    }
}

fn os_release() -> String {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .ok()
        .or_else(|| command_output("uname", &["-r"]));
    release.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn machine_id(os: &str) -> String {
    let id = match os {
        "Linux" => std::fs::read_to_string(MACHINE_ID_PATH)
            .map_err(|e| warn!(path = MACHINE_ID_PATH, error = %e, "could not read machine id"))
            .ok(),
        "Darwin" => command_output("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"])
            .as_deref()
            .and_then(ioreg_platform_uuid),
        "Windows_NT" => command_output("wmic", &["csproduct", "get", "UUID"])
            .as_deref()
            .and_then(wmic_uuid),
        _ => None,
    };
    id.map(|s| s.trim().to_string())
        .unwrap_or_else(|| UNKNOWN_MACHINE.to_string())
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            warn!(program, status = %out.status, "machine query failed");
            None
        }
        Err(e) => {
            warn!(program, error = %e, "machine query failed");
            None
        }
    }
}

/// The `IOPlatformUUID` line of `ioreg` output with its quotes removed.
///
/// Other clients hash the whole line (`IOPlatformUUID = XXXX`), not only the
/// value, so the key name stays in.
fn ioreg_platform_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("IOPlatformUUID"))
        .map(|line| line.replace('"', "").trim().to_string())
}

/// Second line of `wmic csproduct get UUID`.
fn wmic_uuid(output: &str) -> Option<String> {
    output.lines().nth(1).map(|line| line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_hex_sha256() {
        let hash = compute_device_hash("Linux", "6.1.0", "x64", "abc");
        assert_eq!(hash, hex::encode(Sha256::digest(b"Linux-6.1.0-x64-abc")));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn hash_depends_on_every_component() {
        let base = compute_device_hash("Linux", "6.1.0", "x64", "abc");
        assert_ne!(base, compute_device_hash("Darwin", "6.1.0", "x64", "abc"));
        assert_ne!(base, compute_device_hash("Linux", "6.1.1", "x64", "abc"));
        assert_ne!(base, compute_device_hash("Linux", "6.1.0", "arm64", "abc"));
        assert_ne!(base, compute_device_hash("Linux", "6.1.0", "x64", "abd"));
    }

    #[test]
    fn platform_names_follow_node() {
        assert_eq!(os_type("linux"), "Linux");
        assert_eq!(os_type("macos"), "Darwin");
        assert_eq!(os_type("windows"), "Windows_NT");
        assert_eq!(arch_name("x86_64"), "x64");
        assert_eq!(arch_name("aarch64"), "arm64");
        assert_eq!(arch_name("x86"), "ia32");
        assert_eq!(arch_name("riscv64"), "riscv64");
    }

    #[test]
    fn platform_uuid_is_read_from_ioreg() {
        let output = "+-o Mac  <class IOPlatformExpertDevice>\n    {\n      \"IOPlatformSerialNumber\" = \"C02X\"\n      \"IOPlatformUUID\" = \"8A1B-22C3\"\n    }\n";
        assert_eq!(
            ioreg_platform_uuid(output).as_deref(),
            Some("IOPlatformUUID = 8A1B-22C3")
        );
        assert_eq!(ioreg_platform_uuid("{}"), None);
    }

    #[test]
    fn uuid_is_second_wmic_line() {
        let output = "UUID                                  \r\n4C4C4544-0042-3510-8051-B4C04F384E32  \r\n\r\n";
        assert_eq!(
            wmic_uuid(output).as_deref(),
            Some("4C4C4544-0042-3510-8051-B4C04F384E32")
        );
    }

    #[test]
    fn device_hash_is_stable() {
        assert_eq!(device_hash(), device_hash());
    }
}
