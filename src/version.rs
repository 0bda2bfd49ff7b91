// Centralized version information

// Firmware release name, shown in the boot banner
pub const FIRMWARE_VERSION: &str = "v0.3-wifi-ota";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Full version string including Cargo version
pub fn full_version() -> String {
    format!("{} ({})", FIRMWARE_VERSION, CARGO_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_contains_both() {
        let v = full_version();
        assert!(v.starts_with(FIRMWARE_VERSION));
        assert!(v.contains(CARGO_VERSION));
    }
}
