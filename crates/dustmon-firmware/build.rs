//! Bakes network credentials and time settings into the binary.
//!
//! Values come from the process environment, falling back to a `.env` file
//! in the crate or workspace root.

const KEYS: [(&str, &str); 4] = [
    ("WIFI_SSID", ""),
    ("WIFI_PASSWORD", ""),
    ("NTP_SERVER", "pool.ntp.org"),
    ("UTC_OFFSET_SECS", "0"),
];

fn main() {
    if let Err(e) = dotenvy::dotenv() {
        println!("cargo:warning=no .env loaded: {e}");
    }

    for (key, default) in KEYS {
        let value = std::env::var(key).unwrap_or_else(|_| default.to_owned());
        println!("cargo:rustc-env={key}={value}");
        println!("cargo:rerun-if-env-changed={key}");
    }
    println!("cargo:rerun-if-changed=.env");
    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
