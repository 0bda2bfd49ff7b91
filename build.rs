use std::fs;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    #[cfg(feature = "esp-idf")]
    embuild::espidf::sysenv::output();

    println!("cargo:rerun-if-changed=wifi_config.h");

    // Read WiFi / OTA configuration if it exists
    let wifi_config_path = "wifi_config.h";
    if Path::new(wifi_config_path).exists() {
        let contents = fs::read_to_string(wifi_config_path)?;

        for (define, var) in [
            ("#define WIFI_SSID", "WIFI_SSID"),
            ("#define WIFI_PASSWORD", "WIFI_PASSWORD"),
            ("#define OTA_URL", "OTA_URL"),
        ] {
            let value = contents
                .lines()
                .find(|l| l.contains(define))
                .and_then(|l| l.split('"').nth(1))
                .unwrap_or("");
            println!("cargo:rustc-env={}={}", var, value);
        }
    } else {
        // Use empty defaults if no config file
        println!("cargo:rustc-env=WIFI_SSID=");
        println!("cargo:rustc-env=WIFI_PASSWORD=");
        println!("cargo:rustc-env=OTA_URL=");
        println!("cargo:warning=wifi_config.h not found! Copy wifi_config.h.example to wifi_config.h and add your credentials.");
    }

    Ok(())
}
