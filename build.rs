fn main() {
    // ── macOS: Bluetooth permission for a bare CLI binary ─────────────────────
    //
    // CoreBluetooth only lets a process scan when its Info.plist carries
    // NSBluetoothAlwaysUsageDescription. A command-line tool has no bundle,
    // so the plist is linked into the `__TEXT,__info_plist` section of the
    // Mach-O image, where macOS looks for it.
    //
    // Only the btleplug transport needs it; a `--no-default-features` build
    // (protocol core and simulator) links without it.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let ble = std::env::var_os("CARGO_FEATURE_BLE").is_some();
    if target_os != "macos" || !ble {
        return;
    }

    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
